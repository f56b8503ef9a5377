use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Relu,
    },
    prelude::*,
};

/// 3x3 valid convolution, ReLU, 2x2 max-pooling.
#[derive(Module, Debug)]
pub struct ConvPool<B: Backend> {
    conv: Conv2d<B>,
    activation: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> ConvPool<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.activation.forward(x);
        self.pool.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct ConvPoolConfig {
    pub channels: [usize; 2],
}

impl ConvPoolConfig {
    /// Spatial size after the block, `None` if nothing would be left.
    pub fn output_dim(input_dim: usize) -> Option<usize> {
        let convolved = input_dim.checked_sub(2)?;
        let pooled = convolved / 2;
        (pooled > 0).then_some(pooled)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvPool<B> {
        ConvPool {
            conv: Conv2dConfig::new(self.channels, [3, 3]).init(device),
            activation: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}
