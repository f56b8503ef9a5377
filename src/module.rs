pub mod bottleneck;
pub mod conv2d_norm;
pub mod conv_pool;
pub mod frozen_norm;
pub mod resnet;
