use std::{marker::PhantomData, path::Path};

use burn::{
    data::dataloader::batcher::Batcher,
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::{GradientsParams, Optimizer, RmsPropConfig},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use ndarray::Array3;
use tracing::{debug, info};

use crate::{
    data::{Batch, RegressionBatcher},
    error::{Error, Result},
    model::{Model, ModelConfig, WeightedMseLoss},
};

pub fn rmsprop<B: AutodiffBackend>(config: &RmsPropConfig) -> impl Optimizer<Model<B>, B> {
    config.clone().with_grad_clipping(None).init()
}

struct GradientSquares<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    total: Option<Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientSquares<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) else {
            return;
        };

        let squares = grad.powf_scalar(2.0).sum();
        self.total = Some(match self.total.take() {
            Some(total) => total + squares,
            None => squares,
        });
    }
}

struct GradientScale<'a, B> {
    grads: &'a mut GradientsParams,
    scale: f64,
    backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientScale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads
                .register::<B::InnerBackend, D>(id, grad.mul_scalar(self.scale));
        }
    }
}

/// L2 norm of all of the module's gradients taken together.
pub fn global_norm<B: AutodiffBackend, M: AutodiffModule<B>>(
    module: &M,
    grads: &GradientsParams,
) -> f32 {
    let mut squares = GradientSquares::<B> { grads, total: None };
    module.visit(&mut squares);

    squares
        .total
        .map_or(0.0, |total| total.into_scalar().elem::<f32>().sqrt())
}

/// Scales every gradient by `max_norm / global_norm` when the global norm
/// exceeds `max_norm`, keeping the update direction. Returns the norm
/// measured before clipping.
pub fn clip_by_global_norm<B: AutodiffBackend, M: AutodiffModule<B>>(
    module: &M,
    mut grads: GradientsParams,
    max_norm: f32,
) -> (GradientsParams, f32) {
    let norm = global_norm::<B, M>(module, &grads);
    if norm > max_norm {
        let mut scale = GradientScale::<B> {
            grads: &mut grads,
            scale: f64::from(max_norm / norm),
            backend: PhantomData,
        };
        module.visit(&mut scale);
    }

    (grads, norm)
}

/// Owns the trainable model and its optimizer state and runs single
/// train / eval / predict steps on batches.
pub struct Regressor<B: AutodiffBackend, O> {
    model: Model<B>,
    optimizer: O,
    loss: WeightedMseLoss<B>,
    batcher: RegressionBatcher<B>,
    config: ModelConfig,
    device: B::Device,
    global_step: usize,
    global_epoch_step: usize,
}

impl<B, O> Regressor<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
{
    pub fn new(config: &ModelConfig, optimizer: O, device: &B::Device) -> Result<Self> {
        config.validate()?;
        info!("building the model...");

        Ok(Self {
            model: config.init(device),
            optimizer,
            loss: WeightedMseLoss::new(config.loss_weights(), device),
            batcher: RegressionBatcher::new(device.clone()),
            config: config.clone(),
            device: device.clone(),
            global_step: 0,
            global_epoch_step: 0,
        })
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn global_epoch_step(&self) -> usize {
        self.global_epoch_step
    }

    pub fn increment_epoch(&mut self) -> usize {
        self.global_epoch_step += 1;
        self.global_epoch_step
    }

    /// Restores step counters from a previous run.
    pub fn set_progress(&mut self, global_step: usize, global_epoch_step: usize) {
        self.global_step = global_step;
        self.global_epoch_step = global_epoch_step;
    }

    /// One optimization step on the batch. Batch norm uses batch statistics
    /// and dropout is active. Returns the data loss without the L2 term.
    pub fn train(&mut self, batch: Batch, learning_rate: f64) -> Result<f32> {
        check_labels(&batch, self.config.output_dim)?;

        let batch = self.batcher.batch(batch.items);
        let output = self
            .model
            .forward_regression(batch.images, batch.targets, &self.loss);

        let penalty = self.model.l2_penalty().mul_scalar(self.config.l2_weight);
        let total = output.loss.clone() + penalty;

        let grads = GradientsParams::from_grads(total.backward(), &self.model);
        let (grads, norm) =
            clip_by_global_norm::<B, _>(&self.model, grads, self.config.max_gradient_norm);
        self.model = self
            .optimizer
            .step(learning_rate, self.model.clone(), grads);
        self.global_step += 1;

        let loss = output.loss.into_scalar().elem::<f32>();
        debug!(
            "step {}: loss {loss:.6}, gradient norm {norm:.4}",
            self.global_step
        );

        Ok(loss)
    }

    /// Loss and predictions with running batch norm statistics.
    pub fn eval(&self, batch: Batch) -> Result<(f32, Vec<Vec<f32>>)> {
        self.predictor().eval(batch)
    }

    pub fn predict(&self, images: &[Array3<f32>]) -> Result<Vec<Vec<f32>>> {
        self.predictor().predict(images)
    }

    pub fn predictor(&self) -> Predictor<B::InnerBackend> {
        Predictor::new(self.model.valid(), &self.config, &self.device)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.model
            .clone()
            .save_file(path, &CompactRecorder::new())?;
        debug!("model saved to {}", path.display());
        Ok(())
    }

    pub fn restore(&mut self, path: &Path) -> Result<()> {
        self.model = self
            .model
            .clone()
            .load_file(path, &CompactRecorder::new(), &self.device)?;
        info!("model restored from {}", path.display());
        Ok(())
    }
}

/// Inference-only view of a trained model.
pub struct Predictor<B: Backend> {
    model: Model<B>,
    loss: WeightedMseLoss<B>,
    batcher: RegressionBatcher<B>,
    output_dim: usize,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: Model<B>, config: &ModelConfig, device: &B::Device) -> Self {
        Self {
            model,
            loss: WeightedMseLoss::new(config.loss_weights(), device),
            batcher: RegressionBatcher::new(device.clone()),
            output_dim: config.output_dim,
        }
    }

    pub fn load(config: &ModelConfig, path: &Path, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let model = config
            .init::<B>(device)
            .load_file(path, &CompactRecorder::new(), device)?;
        info!("model restored from {}", path.display());

        Ok(Self::new(model, config, device))
    }

    pub fn eval(&self, batch: Batch) -> Result<(f32, Vec<Vec<f32>>)> {
        check_labels(&batch, self.output_dim)?;
        if batch.is_empty() {
            return Ok((0.0, Vec::new()));
        }

        let batch = self.batcher.batch(batch.items);
        let output = self
            .model
            .forward_regression(batch.images, batch.targets, &self.loss);

        let loss = output.loss.into_scalar().elem::<f32>();
        Ok((loss, rows(output.output)?))
    }

    pub fn predict(&self, images: &[Array3<f32>]) -> Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let output = self.model.forward(self.batcher.images(images));
        rows(output)
    }
}

fn check_labels(batch: &Batch, output_dim: usize) -> Result<()> {
    match batch.labels().find(|label| label.len() != output_dim) {
        Some(label) => Err(Error::InvalidConfig(format!(
            "label length {} does not match output_dim {output_dim}",
            label.len()
        ))),
        None => Ok(()),
    }
}

fn rows<B: Backend>(output: Tensor<B, 2>) -> Result<Vec<Vec<f32>>> {
    let [_, width] = output.dims();
    let values = output
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| Error::Tensor(format!("{err:?}")))?;

    Ok(values.chunks(width.max(1)).map(<[f32]>::to_vec).collect())
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    use super::*;
    use crate::{
        augment::Identity,
        data::{
            tests::{fixture, SHAPE},
            Batchizer,
        },
        model::tests::tiny_config,
    };

    type TestBackend = Autodiff<NdArray<f32>>;

    fn regressor(
        device: &<TestBackend as Backend>::Device,
    ) -> Regressor<TestBackend, impl Optimizer<Model<TestBackend>, TestBackend>> {
        let config = tiny_config();
        let optimizer =
            rmsprop::<TestBackend>(&RmsPropConfig::new().with_alpha(0.9).with_epsilon(1e-10));
        Regressor::new(&config, optimizer, device).unwrap()
    }

    fn fixed_batch(dir: &Path, count: usize) -> Batch {
        let list = fixture(dir, count);
        let mut batchizer = Batchizer::new(&list, count).unwrap().with_seed(5);
        batchizer.epoch(&Identity, 4, SHAPE).next().unwrap().unwrap()
    }

    #[test]
    fn training_reduces_loss_on_a_fixed_batch() {
        TestBackend::seed(0);
        let dir = tempfile::tempdir().unwrap();
        let batch = fixed_batch(dir.path(), 4);
        let device = Default::default();
        let mut regressor = regressor(&device);

        let first = regressor.train(batch.clone(), 1e-2).unwrap();
        let mut last = first;
        for _ in 0..30 {
            last = regressor.train(batch.clone(), 1e-2).unwrap();
        }

        assert_eq!(regressor.global_step(), 31);
        assert!(last < first, "loss did not decrease: {first} -> {last}");
    }

    #[test]
    fn eval_and_predict_agree() {
        let dir = tempfile::tempdir().unwrap();
        let batch = fixed_batch(dir.path(), 3);
        let device = Default::default();
        let regressor = regressor(&device);

        let images: Vec<_> = batch.images().cloned().collect();
        let (loss, evaluated) = regressor.eval(batch).unwrap();
        let predicted = regressor.predict(&images).unwrap();

        assert!(loss.is_finite());
        assert_eq!(evaluated.len(), 3);
        assert!(evaluated.iter().all(|row| row.len() == 4));
        for (a, b) in evaluated.iter().flatten().zip(predicted.iter().flatten()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn label_length_must_match_output_dim() {
        let dir = tempfile::tempdir().unwrap();
        let list = fixture(dir.path(), 2);
        let mut batchizer = Batchizer::new(&list, 2).unwrap();
        let batch = batchizer.epoch(&Identity, 3, SHAPE).next().unwrap().unwrap();

        let device = Default::default();
        let mut regressor = regressor(&device);

        assert!(matches!(
            regressor.train(batch, 1e-3),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn restore_reproduces_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let batch = fixed_batch(dir.path(), 2);
        let images: Vec<_> = batch.images().cloned().collect();
        let device = Default::default();

        let mut trained = regressor(&device);
        trained.train(batch, 1e-2).unwrap();
        let path = dir.path().join("model");
        trained.save(&path).unwrap();
        let expected = trained.predict(&images).unwrap();

        let mut restored = regressor(&device);
        restored.restore(&path).unwrap();
        let from_session = restored.predict(&images).unwrap();

        let predictor =
            Predictor::<NdArray<f32>>::load(&tiny_config(), &path, &device).unwrap();
        let from_file = predictor.predict(&images).unwrap();

        // CompactRecorder stores half precision
        for ((a, b), c) in expected
            .iter()
            .flatten()
            .zip(from_session.iter().flatten())
            .zip(from_file.iter().flatten())
        {
            assert!((a - b).abs() < 1e-2);
            assert!((b - c).abs() < 1e-6);
        }
    }

    #[test]
    fn clipping_bounds_the_global_gradient_norm() {
        TestBackend::seed(0);
        let dir = tempfile::tempdir().unwrap();
        let batch = fixed_batch(dir.path(), 4);
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);

        let batch = RegressionBatcher::<TestBackend>::new(device.clone()).batch(batch.items);
        let loss = WeightedMseLoss::new(config.loss_weights(), &device);
        let targets = batch.targets.mul_scalar(1e3);
        let output = model.forward_regression(batch.images, targets, &loss);
        let grads = GradientsParams::from_grads(output.loss.backward(), &model);

        let before = global_norm::<TestBackend, _>(&model, &grads);
        assert!(before > 1.0, "gradient norm too small to clip: {before}");

        let (clipped, measured) = clip_by_global_norm::<TestBackend, _>(&model, grads, 1.0);
        let after = global_norm::<TestBackend, _>(&model, &clipped);

        assert!((measured - before).abs() <= 1e-3 * before);
        assert!(after <= 1.0 + 1e-4, "global norm {after} exceeds 1.0");
        assert!(after > 0.99, "clipping shrank the norm to {after}");

        let (unchanged, _) = clip_by_global_norm::<TestBackend, _>(&model, clipped, 10.0);
        let kept = global_norm::<TestBackend, _>(&model, &unchanged);
        assert!((kept - after).abs() <= 1e-5);
    }
}
