use burn::{prelude::*, train::RegressionOutput};
use nn::{
    pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    Initializer, Linear, LinearConfig,
};
use tracing::info;

use crate::{
    error::Error,
    module::{
        conv_block::{ConvBlock, ConvBlockConfig},
        dense::{Dense, DenseConfig},
    },
};

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    conv_blocks: Vec<ConvBlock<B>>,

    avg_pool: AdaptiveAvgPool2d,
    fc_layers: Vec<Dense<B>>,
    head: Linear<B>,
}

impl<B: Backend> Model<B> {
    /// Maps `[N, C, H, W]` images to `[N, output_dim]` predictions.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .conv_blocks
            .iter()
            .fold(x, |x, conv_block| conv_block.forward(x));

        let x = self.avg_pool.forward(x);
        let x = x.flatten(1, 3);

        let x = self.fc_layers.iter().fold(x, |x, dense| dense.forward(x));
        self.head.forward(x)
    }

    pub fn forward_regression(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 2>,
        loss: &WeightedMseLoss<B>,
    ) -> RegressionOutput<B> {
        let output = self.forward(images);
        let loss = loss.forward(output.clone(), targets.clone());

        RegressionOutput::new(loss, output, targets)
    }

    /// Half the summed squares of every convolution kernel and fully connected
    /// weight matrix. Biases and batch norm parameters are not included.
    pub fn l2_penalty(&self) -> Tensor<B, 1> {
        let head = self.head.weight.val().powf_scalar(2.0).sum();

        let conv = self
            .conv_blocks
            .iter()
            .map(|block| block.conv.weight.val().powf_scalar(2.0).sum());
        let dense = self
            .fc_layers
            .iter()
            .map(|layer| layer.linear.weight.val().powf_scalar(2.0).sum());

        conv.chain(dense)
            .fold(head, |total, squares| total + squares)
            .div_scalar(2.0)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub image_width: usize,
    pub image_height: usize,

    #[config(default = 1)]
    pub image_channel: usize,

    /// Square kernel size of every convolution layer.
    pub filter_sizes: Vec<usize>,
    /// Base channel count of every convolution layer, scaled by `filter_multiplier`.
    pub n_filters: Vec<usize>,
    /// Whether a 2x2 max-pool follows the convolution layer.
    pub max_pool: Vec<bool>,

    pub fc_layers: Vec<usize>,

    #[config(default = 5)]
    pub output_dim: usize,

    /// Per-output loss weights; only the first `output_dim` entries are used.
    pub output_weights: Vec<f32>,

    #[config(default = 5.0)]
    pub max_gradient_norm: f32,

    #[config(default = 4)]
    pub filter_multiplier: usize,

    #[config(default = 0.2)]
    pub negative_slope: f64,

    #[config(default = 0.0)]
    pub dropout: f64,

    #[config(default = 0.005)]
    pub l2_weight: f64,
}

impl ModelConfig {
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |message: String| Err(Error::InvalidConfig(message));

        if self.filter_sizes.len() != self.n_filters.len()
            || self.filter_sizes.len() != self.max_pool.len()
        {
            return invalid(format!(
                "filter_sizes ({}), n_filters ({}) and max_pool ({}) must have the same length",
                self.filter_sizes.len(),
                self.n_filters.len(),
                self.max_pool.len()
            ));
        }
        if let Some(size) = self.filter_sizes.iter().find(|&&s| s == 0 || s % 2 == 0) {
            return invalid(format!("filter size {size} must be odd"));
        }
        if self.n_filters.iter().any(|&n| n == 0) || self.filter_multiplier == 0 {
            return invalid("convolution layers need at least one filter".to_string());
        }
        if self.fc_layers.iter().any(|&h| h == 0) {
            return invalid("fully connected layers need at least one unit".to_string());
        }
        if self.output_dim == 0 {
            return invalid("output_dim must be > 0".to_string());
        }
        if self.output_weights.len() < self.output_dim {
            return invalid(format!(
                "{} output weights given for output_dim {}",
                self.output_weights.len(),
                self.output_dim
            ));
        }
        if self.image_width == 0 || self.image_height == 0 || self.image_channel == 0 {
            return invalid("image dimensions must be > 0".to_string());
        }

        let pools = self.max_pool.iter().filter(|&&pool| pool).count() as u32;
        if (self.image_width >> pools.min(usize::BITS - 1)) == 0
            || (self.image_height >> pools.min(usize::BITS - 1)) == 0
        {
            return invalid(format!(
                "{}x{} input cannot be pooled {pools} times",
                self.image_width, self.image_height
            ));
        }

        Ok(())
    }

    /// Loss weights actually applied to the outputs.
    pub fn loss_weights(&self) -> &[f32] {
        &self.output_weights[..self.output_dim.min(self.output_weights.len())]
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let mut channels = self.image_channel;
        let [mut height, mut width] = [self.image_height, self.image_width];

        let mut conv_blocks = vec![];
        for (i, ((&kernel_size, &filters), &pool)) in self
            .filter_sizes
            .iter()
            .zip(&self.n_filters)
            .zip(&self.max_pool)
            .enumerate()
        {
            let out_channels = filters * self.filter_multiplier;
            conv_blocks.push(
                ConvBlockConfig::new([channels, out_channels], kernel_size)
                    .with_pool(pool)
                    .with_negative_slope(self.negative_slope)
                    .init(device),
            );
            channels = out_channels;
            info!("layer {i} conv2d: [-, {channels}, {height}, {width}]");

            if pool {
                height /= 2;
                width /= 2;
                info!("layer {i} max pool: [-, {channels}, {height}, {width}]");
            }
        }

        let avg_pool = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        info!("avg pool: [-, {channels}, 1, 1]");

        let mut d_input = channels;
        let mut fc_layers = vec![];
        for (i, &d_output) in self.fc_layers.iter().enumerate() {
            fc_layers.push(
                DenseConfig::new(d_input, d_output)
                    .with_negative_slope(self.negative_slope)
                    .with_dropout(self.dropout)
                    .init(device),
            );
            d_input = d_output;
            info!("layer {i} fully connected: [-, {d_output}]");
        }

        let head = LinearConfig::new(d_input, self.output_dim)
            .with_initializer(Initializer::XavierUniform { gain: 1.0 })
            .init(device);
        info!("output: [-, {}]", self.output_dim);

        Model {
            conv_blocks,
            avg_pool,
            fc_layers,
            head,
        }
    }
}

/// Mean squared error where every output column carries its own weight. The
/// weighted sum is divided by the number of entries with a non-zero weight.
#[derive(Debug, Clone)]
pub struct WeightedMseLoss<B: Backend> {
    weights: Tensor<B, 2>,
    nonzero: usize,
}

impl<B: Backend> WeightedMseLoss<B> {
    pub fn new(weights: &[f32], device: &B::Device) -> Self {
        let data = TensorData::new(weights.to_vec(), [1, weights.len()]).convert::<B::FloatElem>();

        Self {
            weights: Tensor::from_data(data, device),
            nonzero: weights.iter().filter(|&&w| w != 0.0).count(),
        }
    }

    pub fn forward(&self, predictions: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
        let [batch_size, _] = predictions.dims();
        let squared = (predictions - targets).powf_scalar(2.0) * self.weights.clone();

        let count = batch_size * self.nonzero;
        if count == 0 {
            return squared.sum().mul_scalar(0.0);
        }

        squared.sum().div_scalar(count as f64)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    pub fn tiny_config() -> ModelConfig {
        ModelConfig::new(
            8,
            8,
            vec![3, 3],
            vec![2, 2],
            vec![true, false],
            vec![8],
            vec![1.0, 1.0, 1.0, 1.0, 1.0],
        )
        .with_output_dim(4)
        .with_filter_multiplier(1)
    }

    #[test]
    fn output_has_one_row_per_image() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);

        let output = model.forward(Tensor::zeros([3, 1, 8, 8], &device));

        assert_eq!(output.dims(), [3, 4]);
    }

    #[test]
    fn validate_rejects_inconsistent_layers() {
        let mut config = tiny_config();
        config.max_pool = vec![true];
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = tiny_config();
        config.filter_sizes = vec![3, 4];
        assert!(config.validate().is_err());

        let mut config = tiny_config();
        config.output_weights = vec![1.0, 1.0];
        assert!(config.validate().is_err());

        let mut config = tiny_config();
        config.max_pool = vec![true, true];
        config.image_width = 2;
        assert!(config.validate().is_err());

        assert!(tiny_config().validate().is_ok());
    }

    #[test]
    fn loss_weights_use_output_dim_prefix() {
        let mut config = tiny_config();
        config.output_weights = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(config.loss_weights(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn weighted_mse_matches_hand_computed_value() {
        let device = Default::default();
        let loss = WeightedMseLoss::<TestBackend>::new(&[1.0, 0.0, 2.0], &device);

        let predictions = Tensor::from_floats([[1.0, 5.0, 0.0], [0.0, -3.0, 1.0]], &device);
        let targets = Tensor::from_floats([[0.0, 0.0, 1.0], [2.0, 0.0, 1.0]], &device);

        // (1*1 + 2*1 + 1*4 + 2*0) / (2 rows * 2 weighted columns)
        let value = loss.forward(predictions, targets).into_scalar();
        assert!((value - 7.0 / 4.0).abs() < 1e-6);
    }

    #[test]
    fn weighted_mse_is_zero_without_weights() {
        let device = Default::default();
        let loss = WeightedMseLoss::<TestBackend>::new(&[0.0, 0.0], &device);

        let predictions = Tensor::from_floats([[1.0, 2.0]], &device);
        let targets = Tensor::from_floats([[3.0, 4.0]], &device);

        assert_eq!(loss.forward(predictions, targets).into_scalar(), 0.0);
    }

    fn half_squares<const D: usize>(weight: Tensor<TestBackend, D>) -> f32 {
        let values = weight.into_data().to_vec::<f32>().unwrap();
        values.iter().map(|w| w * w).sum::<f32>() / 2.0
    }

    #[test]
    fn l2_penalty_covers_conv_dense_and_head_weights() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);

        let conv: f32 = model
            .conv_blocks
            .iter()
            .map(|block| half_squares(block.conv.weight.val()))
            .sum();
        let dense: f32 = model
            .fc_layers
            .iter()
            .map(|layer| half_squares(layer.linear.weight.val()))
            .sum();
        let head = half_squares(model.head.weight.val());
        let expected = conv + dense + head;

        let value = model.l2_penalty().into_scalar();
        assert!(expected > 0.0);
        assert!(
            (value - expected).abs() <= 1e-5 * expected.max(1.0),
            "{value} != {expected}"
        );
    }
}
