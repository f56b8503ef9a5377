use std::path::Path;

use burn::{
    nn::pool::{MaxPool2d, MaxPool2dConfig},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
};
use nn::PaddingConfig2d;

use super::{
    bottleneck::{Bottleneck, BottleneckConfig},
    conv2d_norm::{Conv2dNorm, Conv2dNormConfig},
};
use crate::error::ConfigurationError;

/// Bottleneck blocks per stage of ResNet-50.
pub const RESNET50_BLOCKS: [usize; 4] = [3, 4, 6, 3];
const STAGE_WIDTHS: [usize; 4] = [64, 128, 256, 512];
const STEM_CHANNELS: usize = 64;

/// Square input resolution the pretrained backbone was trained on.
pub const RESNET50_INPUT_DIM: usize = 224;
/// Channels of the final feature map.
pub const RESNET50_FEATURES: usize = 2048;

/// ResNet-50 feature extractor, everything before global pooling.
#[derive(Module, Debug)]
pub struct ResNet50<B: Backend> {
    stem: Conv2dNorm<B>,
    stem_pool: MaxPool2d,
    blocks: Vec<Bottleneck<B>>,
}

impl<B: Backend> ResNet50<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stem.forward(x);
        let x = self.stem_pool.forward(x);

        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    /// Replaces the weights with a full-precision named-msgpack record.
    ///
    /// Record keys follow the field names of this module:
    ///
    /// - `stem.conv.weight`, `stem.norm.{gamma,beta,running_mean,running_var}`
    /// - `blocks.N.{reduce,spatial,expand}.conv.weight` and `.norm.*` likewise
    /// - `blocks.N.downsample.conv.weight` and `.norm.*` on the first block of a stage
    ///
    /// `N` counts blocks across all stages, so torchvision's `layer2.0` is `blocks.3`.
    /// Its `conv1`/`bn1` pair maps to `reduce`, `conv2`/`bn2` to `spatial`,
    /// `conv3`/`bn3` to `expand` and `downsample.0`/`downsample.1` to `downsample`.
    /// Batch norm `weight` and `bias` become `gamma` and `beta`.
    pub fn load_pretrained(
        self,
        path: &Path,
        device: &B::Device,
    ) -> Result<Self, ConfigurationError> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.load_file(path, &recorder, device)
            .map_err(|e| ConfigurationError::BackboneWeights {
                path: path.to_path_buf(),
                reason: format!("{e:?}"),
            })
    }
}

#[derive(Config, Debug)]
pub struct ResNetConfig {
    #[config(default = "RESNET50_BLOCKS")]
    pub blocks: [usize; 4],
}

impl ResNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet50<B> {
        let stem = Conv2dNormConfig::new(
            [3, STEM_CHANNELS],
            [7, 7],
            [2, 2],
            PaddingConfig2d::Explicit(3, 3),
        )
        .init(device);

        let stem_pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut in_channels = STEM_CHANNELS;
        let mut blocks = vec![];

        let stages = self.blocks.iter().zip(STAGE_WIDTHS.iter());
        for (stage, (&count, &width)) in stages.enumerate() {
            for i in 0..count {
                let stride = if i == 0 && stage > 0 { 2 } else { 1 };
                let config = BottleneckConfig::new([in_channels, width], stride);
                in_channels = config.out_channels();
                blocks.push(config.init(device));
            }
        }

        ResNet50 {
            stem,
            stem_pool,
            blocks,
        }
    }
}
