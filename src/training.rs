use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    artifact::{self, ArtifactMetadata, BEST_MODEL_FILE},
    config::RunConfig,
    data::WasteBatcher,
    error::{ArtifactError, ConfigurationError, DataPipelineError, Result},
    inference,
    labels::LabelSpace,
    model::{categorical_cross_entropy, correct_predictions, ModelConfig, Network},
    source::{BatchSource, BatchStream, Split},
    unify::UnifiedSource,
};

pub const METRICS_FILE: &str = "metrics.jsonl";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    NoImprovement,
    MaxEpochs,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::NoImprovement => write!(f, "no improvement"),
            StopReason::MaxEpochs => write!(f, "max epochs reached"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunPhase {
    Running { epoch: usize },
    Improved { epoch: usize, val_loss: f64 },
    Stagnant { epoch: usize, streak: usize },
    Stopped(StopReason),
}

/// Validation-loss watcher: strictly lower is better, NaN never is.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best_loss: f64,
    best_epoch: Option<usize>,
    streak: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_loss: f64::INFINITY,
            best_epoch: None,
            streak: 0,
        }
    }

    /// Records the validation loss of `epoch`, returning `Improved` or `Stagnant`.
    pub fn observe(&mut self, epoch: usize, val_loss: f64) -> RunPhase {
        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            self.best_epoch = Some(epoch);
            self.streak = 0;
            RunPhase::Improved { epoch, val_loss }
        } else {
            self.streak += 1;
            RunPhase::Stagnant {
                epoch,
                streak: self.streak,
            }
        }
    }

    pub fn should_stop(&self) -> bool {
        self.streak >= self.patience
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub improved: bool,
}

/// Append-only JSON-lines file of epoch records.
pub struct MetricsLog {
    path: PathBuf,
}

impl MetricsLog {
    /// Starts a fresh log, truncating any previous run's records.
    pub fn create(path: PathBuf) -> Result<Self, ArtifactError> {
        File::create(&path).map_err(|source| ArtifactError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path })
    }

    pub fn append(&self, record: &EpochRecord) -> Result<(), ArtifactError> {
        let io_error = |source| ArtifactError::Io {
            path: self.path.clone(),
            source,
        };

        let line = serde_json::to_string(record).map_err(|e| io_error(e.into()))?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(io_error)?;
        writeln!(file, "{line}").map_err(io_error)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub history: Vec<EpochRecord>,
    pub stop_reason: StopReason,
    pub best_epoch: Option<usize>,
    pub best_val_loss: f64,
    pub artifact: PathBuf,
}

impl TrainingReport {
    /// Epochs that produced a new best artifact, in order.
    pub fn improvements(&self) -> impl Iterator<Item = &EpochRecord> {
        self.history.iter().filter(|record| record.improved)
    }
}

#[derive(Debug, Clone, Copy)]
struct EpochMetrics {
    loss: f64,
    accuracy: f64,
}

/// Runs the epoch loop for one network over one batch source.
pub struct Trainer<B: AutodiffBackend> {
    config: RunConfig,
    model: ModelConfig,
    labels: LabelSpace,
    artifact_dir: PathBuf,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(
        config: RunConfig,
        model: ModelConfig,
        labels: LabelSpace,
        artifact_dir: &Path,
        device: B::Device,
    ) -> Self {
        Self {
            config,
            model,
            labels,
            artifact_dir: artifact_dir.to_path_buf(),
            device,
        }
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.artifact_dir.join(BEST_MODEL_FILE)
    }

    /// Trains until early stopping or `max_epochs`, returning the final network.
    ///
    /// The best network is written to the artifact path at every improvement. With
    /// `restore_best_weights`, an early stop hands back the best network instead of the
    /// last.
    pub fn fit(
        &self,
        network: Network<B>,
        source: &dyn BatchSource,
    ) -> Result<(Network<B>, TrainingReport)> {
        self.labels
            .ensure_matches(source.labels(), &format!("training on '{}'", source.name()))?;
        if source.img_dim() != self.model.img_dim {
            return Err(ConfigurationError::ResolutionMismatch {
                context: format!("training on '{}'", source.name()),
                expected: self.model.img_dim,
                found: source.img_dim(),
            }
            .into());
        }

        let steps = self.resolve_steps(source, Split::Training, self.config.steps_per_epoch)?;
        let validation_steps =
            self.resolve_steps(source, Split::Validation, self.config.validation_steps)?;

        fs::create_dir_all(&self.artifact_dir).map_err(|source| ArtifactError::Io {
            path: self.artifact_dir.clone(),
            source,
        })?;
        let metrics = MetricsLog::create(self.artifact_dir.join(METRICS_FILE))?;
        let artifact_path = self.artifact_path();

        info!(
            "Training {} network on '{}': {} steps per epoch, {} validation steps, \
             up to {} epochs",
            self.model.architecture,
            source.name(),
            steps,
            validation_steps,
            self.config.max_epochs
        );

        let batcher =
            WasteBatcher::<B>::new(self.device.clone(), self.model.img_dim, self.labels.len());
        let mut optimizer = AdamConfig::new().init();
        let mut stream = BatchStream::new(source, Split::Training);
        let mut early_stopping = EarlyStopping::new(self.config.patience);
        let mut history = Vec::new();
        let mut best: Option<Network<B>> = None;
        let mut network = network;

        let stop_reason = 'epochs: {
            for epoch in 1..=self.config.max_epochs {
                debug!("{:?}", RunPhase::Running { epoch });

                let mut loss_sum = 0.0;
                let mut correct = 0;
                let mut seen = 0;

                for _ in 0..steps {
                    let items = stream.next().ok_or(DataPipelineError::Exhausted {
                        split: Split::Training,
                    })??;
                    let batch = batcher.batch(items);
                    let size = batch.targets.dims()[0];

                    let logits = network.forward(batch.images);
                    let loss = categorical_cross_entropy(logits.clone(), batch.targets.clone());

                    loss_sum += loss.clone().detach().into_scalar().elem::<f64>() * size as f64;
                    correct += correct_predictions(logits.detach(), batch.targets);
                    seen += size;

                    let grads = GradientsParams::from_grads(loss.backward(), &network);
                    network = optimizer.step(self.config.learning_rate, network, grads);
                }

                let train = EpochMetrics {
                    loss: loss_sum / seen as f64,
                    accuracy: correct as f64 / seen as f64,
                };
                let valid = self.validate(&network, source, validation_steps)?;

                let phase = early_stopping.observe(epoch, valid.loss);
                let improved = matches!(phase, RunPhase::Improved { .. });

                if improved {
                    let metadata = ArtifactMetadata::new(
                        &self.labels,
                        self.model.clone(),
                        epoch,
                        valid.loss,
                        valid.accuracy,
                    );
                    artifact::save(&artifact_path, &metadata, &network)?;
                    best = Some(network.clone());
                }

                info!(
                    "epoch {}/{}: loss {:.4}, accuracy {:.4}, val_loss {:.4}, val_accuracy {:.4}{}",
                    epoch,
                    self.config.max_epochs,
                    train.loss,
                    train.accuracy,
                    valid.loss,
                    valid.accuracy,
                    if improved { " (saved)" } else { "" }
                );
                debug!("{:?}", phase);

                let record = EpochRecord {
                    epoch,
                    train_loss: train.loss,
                    train_accuracy: train.accuracy,
                    val_loss: valid.loss,
                    val_accuracy: valid.accuracy,
                    improved,
                };
                metrics.append(&record)?;
                history.push(record);

                if early_stopping.should_stop() {
                    break 'epochs StopReason::NoImprovement;
                }
            }
            StopReason::MaxEpochs
        };

        info!("{:?}", RunPhase::Stopped(stop_reason));

        if stop_reason == StopReason::NoImprovement && self.config.restore_best_weights {
            if let (Some(best), Some(epoch)) = (best, early_stopping.best_epoch()) {
                info!("Restoring weights from epoch {}", epoch);
                network = best;
            }
        }

        if early_stopping.best_epoch().is_none() {
            warn!("Validation loss never improved, no artifact was written");
        }

        let report = TrainingReport {
            history,
            stop_reason,
            best_epoch: early_stopping.best_epoch(),
            best_val_loss: early_stopping.best_loss(),
            artifact: artifact_path,
        };

        Ok((network, report))
    }

    fn resolve_steps(
        &self,
        source: &dyn BatchSource,
        split: Split,
        requested: Option<usize>,
    ) -> Result<usize> {
        let cardinality = source.cardinality(split);
        if cardinality == 0 {
            return Err(ConfigurationError::EmptySplit {
                dataset: source.name().to_string(),
                split,
            }
            .into());
        }

        let steps = match requested {
            Some(steps) if steps < cardinality => {
                warn!(
                    "{} steps override ({}) is below the combined cardinality ({}), \
                     later datasets are under-sampled",
                    split, steps, cardinality
                );
                steps
            }
            Some(steps) => steps,
            None => cardinality,
        };

        Ok(steps)
    }

    fn validate(
        &self,
        network: &Network<B>,
        source: &dyn BatchSource,
        steps: usize,
    ) -> Result<EpochMetrics> {
        let report = inference::evaluate(&network.valid(), source, Some(steps), &self.device)?;

        Ok(EpochMetrics {
            loss: report.loss,
            accuracy: report.accuracy,
        })
    }
}

/// Trains a waste classifier end to end and leaves the best artifact in `artifact_dir`.
///
/// Writes `config.json`, `metrics.jsonl` and the best-model artifact. The trained
/// network itself is not returned; load the artifact to use it.
pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: RunConfig,
    device: B::Device,
) -> Result<TrainingReport> {
    config.validate()?;

    fs::create_dir_all(artifact_dir).map_err(|source| ArtifactError::Io {
        path: artifact_dir.to_path_buf(),
        source,
    })?;
    let config_path = artifact_dir.join(CONFIG_FILE);
    config.save(&config_path).map_err(|source| ArtifactError::Io {
        path: config_path.clone(),
        source,
    })?;

    B::seed(config.seed);

    let labels = LabelSpace::waste();
    let model = config.model_config(labels.len());
    let network = match &config.init_from {
        Some(path) => {
            info!("Continuing from artifact {:?}", path);
            let loaded = artifact::load::<B>(path, &labels, &device)?;
            let stored = &loaded.metadata;
            let compatible = stored.model.architecture == model.architecture
                && stored.img_dim == model.img_dim;
            if !compatible {
                return Err(ArtifactError::Incompatible {
                    path: path.clone(),
                    reason: format!(
                        "artifact is a {} network at {}px, the run wants {} at {}px",
                        stored.model.architecture,
                        stored.img_dim,
                        model.architecture,
                        model.img_dim
                    ),
                }
                .into());
            }
            loaded.network
        }
        None => model.init::<B>(&device)?,
    };

    let source = UnifiedSource::open(&config.datasets, &labels, config.source_options())?;

    let trainer = Trainer::<B>::new(config, model, labels, artifact_dir, device);
    let (_, report) = trainer.fit(network, &source)?;

    info!(
        "Training stopped ({}) after {} epochs, best val_loss {:.4} at epoch {:?}",
        report.stop_reason,
        report.history.len(),
        report.best_val_loss,
        report.best_epoch
    );

    Ok(report)
}
