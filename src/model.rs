use std::{fmt, path::PathBuf};

use burn::{
    prelude::*,
    tensor::{
        activation::{log_softmax, softmax},
        ElementConversion,
    },
};
use nn::{
    pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    Dropout, DropoutConfig, Linear, LinearConfig, Relu,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::ConfigurationError,
    module::{
        conv_pool::{ConvPool, ConvPoolConfig},
        resnet::{ResNet50, ResNetConfig, RESNET50_FEATURES, RESNET50_INPUT_DIM},
    },
};

const SCRATCH_CHANNELS: [usize; 3] = [32, 64, 128];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// Three conv/pool blocks trained from random weights.
    Scratch,
    /// Frozen ResNet-50 backbone with a trainable head.
    Transfer,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Scratch => write!(f, "scratch"),
            Architecture::Transfer => write!(f, "transfer"),
        }
    }
}

#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    hidden: Linear<B>,
    activation: Relu,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> Classifier<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.hidden.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct ScratchCnn<B: Backend> {
    blocks: Vec<ConvPool<B>>,
    classifier: Classifier<B>,
}

impl<B: Backend> ScratchCnn<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        let x = x.flatten(1, 3);
        self.classifier.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct TransferNet<B: Backend> {
    backbone: ResNet50<B>,
    avg_pool: AdaptiveAvgPool2d,
    classifier: Classifier<B>,
}

impl<B: Backend> TransferNet<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.backbone.forward(x);
        let x = self.avg_pool.forward(x);
        let x = x.flatten(1, 3);
        self.classifier.forward(x)
    }
}

/// The classifier network; the variant is fixed for a whole run.
#[derive(Module, Debug)]
pub enum Network<B: Backend> {
    Scratch(ScratchCnn<B>),
    Transfer(TransferNet<B>),
}

impl<B: Backend> Network<B> {
    /// Unnormalized class scores, `[batch, classes]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Network::Scratch(network) => network.forward(images),
            Network::Transfer(network) => network.forward(images),
        }
    }

    /// Softmax over the label space; every row sums to 1.
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn architecture(&self) -> Architecture {
        match self {
            Network::Scratch(_) => Architecture::Scratch,
            Network::Transfer(_) => Architecture::Transfer,
        }
    }

    /// Stops gradient tracking on the pretrained backbone. No-op for the scratch stack.
    pub fn freeze_backbone(self) -> Self {
        match self {
            Network::Transfer(network) => Network::Transfer(TransferNet {
                backbone: network.backbone.no_grad(),
                ..network
            }),
            scratch => scratch,
        }
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub architecture: Architecture,

    pub classes: usize,

    pub img_dim: usize,

    #[config(default = 256)]
    pub hidden_units: usize,

    #[config(default = 0.5)]
    pub dropout: f64,

    pub backbone_weights: Option<PathBuf>,
}

impl ModelConfig {
    /// Checks the resolution and head settings against the architecture.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.classes == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "classes",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigurationError::InvalidValue {
                field: "dropout",
                reason: format!("must lie in [0, 1), got {}", self.dropout),
            });
        }
        self.feature_dim().map(|_| ())
    }

    /// Width of the flattened features fed to the head.
    fn feature_dim(&self) -> Result<usize, ConfigurationError> {
        match self.architecture {
            Architecture::Scratch => {
                let side = (0..SCRATCH_CHANNELS.len())
                    .try_fold(self.img_dim, |dim, _| ConvPoolConfig::output_dim(dim))
                    .ok_or_else(|| ConfigurationError::InvalidValue {
                        field: "img_dim",
                        reason: format!(
                            "{} is too small for the scratch stack, \
                             nothing is left after three conv/pool blocks",
                            self.img_dim
                        ),
                    })?;
                Ok(SCRATCH_CHANNELS[SCRATCH_CHANNELS.len() - 1] * side * side)
            }
            Architecture::Transfer => {
                if self.img_dim != RESNET50_INPUT_DIM {
                    return Err(ConfigurationError::ResolutionMismatch {
                        context: "transfer architecture (ResNet-50 backbone)".to_string(),
                        expected: RESNET50_INPUT_DIM,
                        found: self.img_dim,
                    });
                }
                Ok(RESNET50_FEATURES)
            }
        }
    }

    fn classifier<B: Backend>(&self, features: usize, device: &B::Device) -> Classifier<B> {
        Classifier {
            hidden: LinearConfig::new(features, self.hidden_units).init(device),
            activation: Relu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_units, self.classes).init(device),
        }
    }

    /// Builds the network with fresh weights, without touching `backbone_weights`.
    pub fn build<B: Backend>(&self, device: &B::Device) -> Result<Network<B>, ConfigurationError> {
        self.validate()?;
        let features = self.feature_dim()?;

        let network = match self.architecture {
            Architecture::Scratch => {
                let mut in_channels = 3;
                let blocks = SCRATCH_CHANNELS
                    .iter()
                    .map(|&out_channels| {
                        let block =
                            ConvPoolConfig::new([in_channels, out_channels]).init(device);
                        in_channels = out_channels;
                        block
                    })
                    .collect();

                Network::Scratch(ScratchCnn {
                    blocks,
                    classifier: self.classifier(features, device),
                })
            }
            Architecture::Transfer => Network::Transfer(TransferNet {
                backbone: ResNetConfig::new().init(device),
                avg_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
                classifier: self.classifier(features, device),
            }),
        };

        Ok(network.freeze_backbone())
    }

    /// Builds the network for a new run.
    ///
    /// The transfer architecture loads `backbone_weights` and fails without them.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Network<B>, ConfigurationError> {
        self.validate()?;
        let weights = match self.architecture {
            Architecture::Transfer => Some(self.backbone_weights.as_ref().ok_or_else(|| {
                ConfigurationError::InvalidValue {
                    field: "backbone_weights",
                    reason: "the transfer architecture needs pretrained ResNet-50 weights"
                        .to_string(),
                }
            })?),
            Architecture::Scratch => None,
        };

        let network = match (self.build(device)?, weights) {
            (Network::Transfer(network), Some(path)) => {
                info!("Loading backbone weights from {:?}", path);
                let backbone = network.backbone.load_pretrained(path, device)?;
                Network::Transfer(TransferNet { backbone, ..network })
            }
            (network, _) => network,
        };

        let network = network.freeze_backbone();
        info!(
            "Built {} network: {} parameters, input {}x{}x3, {} classes",
            self.architecture,
            network.num_params(),
            self.img_dim,
            self.img_dim,
            self.classes
        );

        Ok(network)
    }
}

/// Categorical cross-entropy between class scores and one-hot targets.
pub fn categorical_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log_probs = log_softmax(logits, 1);
    (targets * log_probs).sum_dim(1).mean().neg()
}

/// Rows whose highest score lands on the hot target index.
pub fn correct_predictions<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> usize {
    let predicted = logits.argmax(1);
    let expected = targets.argmax(1);

    predicted
        .equal(expected)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn scratch_probabilities_sum_to_one() {
        let device = Default::default();
        let network = ModelConfig::new(Architecture::Scratch, 6, 24)
            .init::<TestBackend>(&device)
            .unwrap();

        let images = Tensor::<TestBackend, 4>::random(
            [3, 3, 24, 24],
            burn::tensor::Distribution::Default,
            &device,
        );
        let probabilities = network.forward_probabilities(images);
        assert_eq!(probabilities.dims(), [3, 6]);

        let sums = probabilities.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        assert!(sums.iter().all(|sum| (sum - 1.0).abs() < 1e-5));
    }

    #[test]
    fn scratch_rejects_tiny_images() {
        let err = ModelConfig::new(Architecture::Scratch, 6, 16)
            .init::<TestBackend>(&Default::default())
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { field: "img_dim", .. }));
    }

    #[test]
    fn transfer_rejects_scratch_resolution() {
        let err = ModelConfig::new(Architecture::Transfer, 6, 100)
            .init::<TestBackend>(&Default::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::ResolutionMismatch {
                expected: 224,
                found: 100,
                ..
            }
        ));
    }

    #[test]
    fn transfer_without_backbone_weights_is_rejected() {
        let err = ModelConfig::new(Architecture::Transfer, 6, 224)
            .init::<TestBackend>(&Default::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidValue {
                field: "backbone_weights",
                ..
            }
        ));
    }

    #[test]
    fn scratch_feature_width_at_default_resolution() {
        let config = ModelConfig::new(Architecture::Scratch, 6, 100);
        assert_eq!(config.feature_dim().unwrap(), 128 * 10 * 10);
    }

    #[test]
    fn cross_entropy_prefers_correct_scores() {
        let device = Default::default();
        let targets = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [0.0, 1.0]], &device);
        let good = Tensor::<TestBackend, 2>::from_floats([[4.0, 0.0], [0.0, 4.0]], &device);
        let bad = Tensor::<TestBackend, 2>::from_floats([[0.0, 4.0], [4.0, 0.0]], &device);

        let good_loss = categorical_cross_entropy(good.clone(), targets.clone()).into_scalar();
        let bad_loss = categorical_cross_entropy(bad.clone(), targets.clone()).into_scalar();
        assert!(good_loss < bad_loss);

        assert_eq!(correct_predictions(good, targets.clone()), 2);
        assert_eq!(correct_predictions(bad, targets), 0);
    }
}
