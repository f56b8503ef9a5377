use burn::{prelude::*, tensor::activation::relu};
use nn::PaddingConfig2d;

use super::conv2d_norm::{Conv2dNorm, Conv2dNormConfig};

/// ResNet bottleneck: 1x1 reduce, 3x3 (strided), 1x1 expand, plus a shortcut.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    pub reduce: Conv2dNorm<B>,
    pub spatial: Conv2dNorm<B>,
    pub expand: Conv2dNorm<B>,

    pub downsample: Option<Conv2dNorm<B>>,
}

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let x = self.reduce.forward(x);
        let x = self.spatial.forward(x);
        let x = self.expand.forward(x);

        relu(x + shortcut)
    }
}

#[derive(Config, Debug)]
pub struct BottleneckConfig {
    /// Input channels and bottleneck width.
    pub channels: [usize; 2],
    pub stride: usize,
    #[config(default = 4)]
    pub expansion: usize,
}

impl BottleneckConfig {
    pub fn out_channels(&self) -> usize {
        self.channels[1] * self.expansion
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Bottleneck<B> {
        let [in_channels, width] = self.channels;
        let out_channels = self.out_channels();
        let stride = [self.stride, self.stride];

        let downsample = if self.stride != 1 || in_channels != out_channels {
            Some(
                Conv2dNormConfig::new(
                    [in_channels, out_channels],
                    [1, 1],
                    stride,
                    PaddingConfig2d::Valid,
                )
                .with_activate(false)
                .init(device),
            )
        } else {
            None
        };

        Bottleneck {
            reduce: Conv2dNormConfig::new(
                [in_channels, width],
                [1, 1],
                [1, 1],
                PaddingConfig2d::Valid,
            )
            .init(device),

            spatial: Conv2dNormConfig::new(
                [width, width],
                [3, 3],
                stride,
                PaddingConfig2d::Explicit(1, 1),
            )
            .init(device),

            expand: Conv2dNormConfig::new(
                [width, out_channels],
                [1, 1],
                [1, 1],
                PaddingConfig2d::Valid,
            )
            .with_activate(false)
            .init(device),

            downsample,
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    #[test]
    fn strided_block_halves_and_expands() {
        let device = Default::default();
        let block = BottleneckConfig::new([64, 32], 2).init::<NdArray<f32>>(&device);
        assert!(block.downsample.is_some());

        let x = Tensor::<NdArray<f32>, 4>::zeros([1, 64, 8, 8], &device);
        assert_eq!(block.forward(x).dims(), [1, 128, 4, 4]);
    }

    #[test]
    fn matching_block_uses_identity_shortcut() {
        let device = Default::default();
        let block = BottleneckConfig::new([128, 32], 1).init::<NdArray<f32>>(&device);
        assert!(block.downsample.is_none());

        let x = Tensor::<NdArray<f32>, 4>::ones([1, 128, 5, 5], &device);
        let y = block.forward(x);
        assert_eq!(y.dims(), [1, 128, 5, 5]);
        let min = y.min().into_scalar();
        assert!(min >= 0.0);
    }
}
