use burn::prelude::*;
use nn::{Dropout, DropoutConfig, Initializer, Linear, LinearConfig};

use super::leaky_relu::LeakyReLU;

/// Fully connected layer with leaky ReLU activation.
#[derive(Module, Debug)]
pub struct Dense<B: Backend> {
    pub linear: Linear<B>,
    activation: LeakyReLU,
    dropout: Dropout,
}

impl<B: Backend> Dense<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear.forward(x);
        let x = self.activation.forward(x);
        self.dropout.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct DenseConfig {
    d_input: usize,

    d_output: usize,

    #[config(default = 0.2)]
    negative_slope: f64,

    #[config(default = 0.0)]
    dropout: f64,

    #[config(default = 0.001)]
    init_std: f64,
}

impl DenseConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Dense<B> {
        Dense {
            linear: LinearConfig::new(self.d_input, self.d_output)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: self.init_std,
                })
                .init(device),
            activation: LeakyReLU::new(self.negative_slope),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}
