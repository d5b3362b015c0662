use burn::{module::Module, nn::conv::Conv2d, prelude::*};
use nn::{
    conv::Conv2dConfig,
    pool::{MaxPool2d, MaxPool2dConfig},
    BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d,
};

use super::leaky_relu::LeakyReLU;

/// Weight of the current batch in the running statistics update, i.e. a
/// 0.99 decay of the running mean and variance.
const BATCH_NORM_MOMENTUM: f64 = 0.01;
const BATCH_NORM_EPSILON: f64 = 1e-3;

/// Same-padded convolution followed by leaky ReLU, batch norm and an optional
/// 2x2 max-pool.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    activation: LeakyReLU,
    norm: BatchNorm<B, 2>,
    pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.activation.forward(x);
        let x = self.norm.forward(x);

        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }
}

#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    channels: [usize; 2],

    kernel_size: usize,

    #[config(default = false)]
    pool: bool,

    #[config(default = 0.2)]
    negative_slope: f64,
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        ConvBlock {
            conv: Conv2dConfig::new(self.channels, [self.kernel_size, self.kernel_size])
                .with_padding(PaddingConfig2d::Same)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init(device),
            activation: LeakyReLU::new(self.negative_slope),
            norm: BatchNormConfig::new(self.channels[1])
                .with_momentum(BATCH_NORM_MOMENTUM)
                .with_epsilon(BATCH_NORM_EPSILON)
                .init(device),
            pool: self
                .pool
                .then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()),
        }
    }
}
