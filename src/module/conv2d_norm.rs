use burn::{nn::conv::Conv2d, prelude::*, tensor::activation::relu};
use nn::{conv::Conv2dConfig, PaddingConfig2d};

use super::frozen_norm::FrozenBatchNorm;

/// Convolution, frozen normalization and an optional ReLU.
#[derive(Module, Debug)]
pub struct Conv2dNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: FrozenBatchNorm<B>,
    activate: bool,
}

impl<B: Backend> Conv2dNorm<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);

        if self.activate {
            relu(x)
        } else {
            x
        }
    }
}

#[derive(Config, Debug)]
pub struct Conv2dNormConfig {
    channels: [usize; 2],

    kernel_size: [usize; 2],

    stride: [usize; 2],

    padding: PaddingConfig2d,

    #[config(default = true)]
    activate: bool,
}

impl Conv2dNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Conv2dNorm<B> {
        Conv2dNorm {
            conv: Conv2dConfig::new(self.channels, self.kernel_size)
                .with_stride(self.stride)
                .with_padding(self.padding.clone())
                .with_bias(false)
                .init(device),
            norm: FrozenBatchNorm::new(self.channels[1], device),
            activate: self.activate,
        }
    }
}
