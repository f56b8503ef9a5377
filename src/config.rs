use std::{collections::BTreeMap, path::PathBuf};

use burn::config::Config;

use crate::{
    augment::AugmentationConfig,
    error::ConfigurationError,
    model::{Architecture, ModelConfig},
    source::SourceOptions,
};

/// One dataset root and how its class folders map onto the label space.
#[derive(Config, Debug)]
pub struct DatasetConfig {
    pub name: String,

    pub root: PathBuf,

    /// Folder name -> label name, for folders not already named after a label.
    #[config(default = "BTreeMap::new()")]
    pub aliases: BTreeMap<String, String>,
}

#[derive(Config, Debug)]
pub struct RunConfig {
    pub datasets: Vec<DatasetConfig>,

    pub architecture: Architecture,

    #[config(default = 100)]
    pub img_dim: usize,

    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = 30)]
    pub max_epochs: usize,

    #[config(default = 0.15)]
    pub validation_fraction: f64,

    #[config(default = 5)]
    pub patience: usize,

    /// Hand back the best epoch's weights when early stopping ends the run.
    #[config(default = false)]
    pub restore_best_weights: bool,

    #[config(default = "AugmentationConfig::new()")]
    pub augmentation: AugmentationConfig,

    #[config(default = true)]
    pub shuffle: bool,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,

    #[config(default = 256)]
    pub hidden_units: usize,

    #[config(default = 0.5)]
    pub dropout: f64,

    /// Overrides the unified training cardinality.
    pub steps_per_epoch: Option<usize>,

    /// Overrides the unified validation cardinality.
    pub validation_steps: Option<usize>,

    /// Named-msgpack record holding pretrained backbone weights.
    pub backbone_weights: Option<PathBuf>,

    /// Artifact whose weights seed this run.
    pub init_from: Option<PathBuf>,
}

impl RunConfig {
    /// 100px from-scratch CNN, 30 epochs, patience 5.
    pub fn scratch(datasets: Vec<DatasetConfig>) -> Self {
        Self::new(datasets, Architecture::Scratch)
            .with_img_dim(100)
            .with_max_epochs(30)
            .with_patience(5)
    }

    /// 224px frozen ResNet-50, 50 epochs, patience 10, best weights restored.
    pub fn transfer(datasets: Vec<DatasetConfig>) -> Self {
        Self::new(datasets, Architecture::Transfer)
            .with_img_dim(224)
            .with_max_epochs(50)
            .with_patience(10)
            .with_restore_best_weights(true)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.datasets.is_empty() {
            return Err(invalid("datasets", "at least one dataset is required"));
        }
        for (i, dataset) in self.datasets.iter().enumerate() {
            if self.datasets[..i].iter().any(|other| other.name == dataset.name) {
                return Err(invalid(
                    "datasets",
                    format!("duplicate dataset name '{}'", dataset.name),
                ));
            }
        }

        let positive = [
            ("img_dim", self.img_dim),
            ("batch_size", self.batch_size),
            ("max_epochs", self.max_epochs),
            ("patience", self.patience),
            ("hidden_units", self.hidden_units),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be at least 1"));
            }
        }
        if self.steps_per_epoch == Some(0) {
            return Err(invalid("steps_per_epoch", "must be at least 1"));
        }
        if self.validation_steps == Some(0) {
            return Err(invalid("validation_steps", "must be at least 1"));
        }

        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(invalid(
                "validation_fraction",
                format!("must lie in (0, 1), got {}", self.validation_fraction),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(invalid("dropout", format!("must lie in [0, 1), got {}", self.dropout)));
        }
        if !(self.learning_rate > 0.0) {
            return Err(invalid(
                "learning_rate",
                format!("must be positive, got {}", self.learning_rate),
            ));
        }

        self.augmentation.validate()
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            img_dim: self.img_dim,
            batch_size: self.batch_size,
            validation_fraction: self.validation_fraction,
            shuffle: self.shuffle,
            seed: self.seed,
            augmentation: self.augmentation.clone(),
        }
    }

    /// Options for scoring a trained model at `img_dim` on this run's datasets.
    ///
    /// Keeps the batch size and validation split but never shuffles or augments.
    pub fn evaluation_options(&self, img_dim: usize) -> SourceOptions {
        SourceOptions {
            img_dim,
            shuffle: false,
            augmentation: AugmentationConfig::disabled(),
            ..self.source_options()
        }
    }

    pub fn model_config(&self, classes: usize) -> ModelConfig {
        ModelConfig::new(self.architecture, classes, self.img_dim)
            .with_hidden_units(self.hidden_units)
            .with_dropout(self.dropout)
            .with_backbone_weights(self.backbone_weights.clone())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field,
        reason: reason.into(),
    }
}
