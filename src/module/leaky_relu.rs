use burn::{
    module::Module,
    prelude::Backend,
    tensor::{activation::relu, Tensor},
};

#[derive(Module, Debug, Clone)]
pub struct LeakyReLU {
    pub negative_slope: f64,
}

impl LeakyReLU {
    pub fn new(negative_slope: f64) -> Self {
        Self { negative_slope }
    }

    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        relu(input.clone()) + input.clamp_max(0).mul_scalar(self.negative_slope)
    }
}
