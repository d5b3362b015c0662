use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    config::Config,
    optim::RmsPropConfig,
    prelude::Backend,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    augment::{AugmentConfig, Identity, LABEL_FIELDS},
    data::{load_images, Batchizer, ImageShape},
    error::Error,
    model::ModelConfig,
    regressor::{rmsprop, Predictor, Regressor},
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,

    pub optimizer: RmsPropConfig,

    pub augment: AugmentConfig,

    #[config(default = 10)]
    pub epoch_count: usize,

    #[config(default = 8)]
    pub batch_size: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,

    /// Multiplied into the learning rate after every epoch.
    #[config(default = 1.0)]
    pub learning_rate_decay: f64,

    /// Number of label fields fed as targets; defaults to `model.output_dim`.
    pub label_len: Option<usize>,
}

impl TrainingConfig {
    pub fn label_len(&self) -> usize {
        self.label_len.unwrap_or(self.model.output_dim)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.model.validate()?;

        let label_len = self.label_len();
        if label_len != self.model.output_dim || label_len > LABEL_FIELDS {
            return Err(Error::InvalidConfig(format!(
                "label_len {label_len} must equal output_dim {} and be at most {LABEL_FIELDS}",
                self.model.output_dim
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_string()));
        }

        Ok(())
    }
}

/// Step counters persisted next to the checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingProgress {
    pub global_step: usize,
    pub global_epoch: usize,
}

impl TrainingProgress {
    fn path(artifact_dir: &Path) -> PathBuf {
        artifact_dir.join("progress.json")
    }

    pub fn load(artifact_dir: &Path) -> crate::Result<Option<Self>> {
        let path = Self::path(artifact_dir);
        if !path.is_file() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    pub fn save(&self, artifact_dir: &Path) -> crate::Result<()> {
        fs::write(Self::path(artifact_dir), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f32,
    pub valid_loss: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct EvalReport {
    pub count: usize,
    pub loss: f32,
    /// Mean absolute error of every output.
    pub mean_abs_error: Vec<f32>,
    pub predictions: Vec<(String, Vec<f32>)>,
}

pub fn image_shape(model: &ModelConfig) -> ImageShape {
    ImageShape {
        channels: model.image_channel,
        height: model.image_height,
        width: model.image_width,
    }
}

pub fn checkpoint_path(artifact_dir: &Path, epoch: usize) -> PathBuf {
    artifact_dir.join("checkpoint").join(format!("model-{epoch}"))
}

/// Seed of the training shuffle when starting after `epoch` completed
/// epochs, so a resumed run does not replay the first run's batch order.
pub fn shuffle_seed(seed: u64, epoch: usize) -> u64 {
    seed.wrapping_add(epoch as u64)
}

fn create_artifact_dir(artifact_dir: &Path, resume: bool) -> crate::Result<()> {
    if !resume {
        fs::remove_dir_all(artifact_dir).ok();
    }
    fs::create_dir_all(artifact_dir.join("checkpoint"))?;
    Ok(())
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: TrainingConfig,
    train_list: &Path,
    valid_list: Option<&Path>,
    resume: bool,
    device: B::Device,
) -> crate::Result<Vec<EpochReport>> {
    config.validate()?;
    create_artifact_dir(artifact_dir, resume)?;

    config.save(artifact_dir.join("config.json"))?;

    B::seed(config.seed);

    let optimizer = rmsprop::<B>(&config.optimizer);
    let mut regressor = Regressor::new(&config.model, optimizer, &device)?;

    if resume {
        match TrainingProgress::load(artifact_dir)? {
            Some(progress) if progress.global_epoch > 0 => {
                regressor.restore(&checkpoint_path(artifact_dir, progress.global_epoch))?;
                regressor.set_progress(progress.global_step, progress.global_epoch);
                info!(
                    "resuming after epoch {} (step {})",
                    progress.global_epoch, progress.global_step
                );
            }
            _ => warn!(
                "nothing to resume in {}, starting fresh",
                artifact_dir.display()
            ),
        }
    }

    let label_len = config.label_len();
    let shape = image_shape(&config.model);
    let augmenter = config.augment.init();

    let first_epoch = regressor.global_epoch_step();

    let mut batchizer = Batchizer::new(train_list, config.batch_size)?
        .with_seed(shuffle_seed(config.seed, first_epoch));
    if batchizer.is_empty() {
        return Err(Error::EmptyDataset);
    }
    let mut valid = valid_list
        .map(|path| Batchizer::new(path, config.batch_size))
        .transpose()?
        .map(|batchizer| batchizer.with_seed(config.seed));
    if valid.as_ref().is_some_and(Batchizer::is_empty) {
        return Err(Error::EmptyDataset);
    }

    let batch_count = batchizer.batch_count();
    let log_interval = (batch_count / 10).max(1);
    let mut learning_rate =
        config.learning_rate * config.learning_rate_decay.powi(first_epoch as i32);

    let mut batches = batchizer.batches(&augmenter, label_len, shape);
    let mut reports = Vec::new();

    for _ in first_epoch..config.epoch_count {
        let epoch = regressor.global_epoch_step() + 1;
        let mut total = 0.0;

        for (i, batch) in batches.by_ref().take(batch_count).enumerate() {
            let loss = regressor.train(batch?, learning_rate)?;
            total += loss;

            if (i + 1) % log_interval == 0 || i + 1 == batch_count {
                info!(
                    "[Train - Epoch {epoch} - Iteration {}/{batch_count}] loss {loss:.6} lr {learning_rate:.3e}",
                    i + 1
                );
            }
        }
        let train_loss = total / batch_count as f32;

        let valid_loss = match valid.as_mut() {
            Some(valid) => {
                let report = evaluate_pass(&regressor.predictor(), valid, label_len, shape)?;
                info!(
                    "[Valid - Epoch {epoch}] loss {:.6} mae {:?}",
                    report.loss, report.mean_abs_error
                );
                Some(report.loss)
            }
            None => None,
        };

        regressor.increment_epoch();
        regressor.save(&checkpoint_path(artifact_dir, epoch))?;
        TrainingProgress {
            global_step: regressor.global_step(),
            global_epoch: regressor.global_epoch_step(),
        }
        .save(artifact_dir)?;

        info!("epoch {epoch}: train loss {train_loss:.6}");
        reports.push(EpochReport {
            epoch,
            train_loss,
            valid_loss,
        });

        learning_rate *= config.learning_rate_decay;
    }

    regressor.save(&artifact_dir.join("model"))?;
    info!("model saved to {}", artifact_dir.join("model").display());

    Ok(reports)
}

/// One unaugmented pass over `batchizer`.
pub fn evaluate_pass<B: Backend>(
    predictor: &Predictor<B>,
    batchizer: &mut Batchizer,
    label_len: usize,
    shape: ImageShape,
) -> crate::Result<EvalReport> {
    let mut report = EvalReport {
        mean_abs_error: vec![0.0; label_len],
        ..Default::default()
    };
    let mut loss_sum = 0.0;

    for batch in batchizer.epoch(&Identity, label_len, shape) {
        let batch = batch?;
        let size = batch.len();
        let labels: Vec<Vec<f32>> = batch.labels().map(<[f32]>::to_vec).collect();
        let names: Vec<String> = batch.names().map(str::to_string).collect();

        let (loss, predictions) = predictor.eval(batch)?;
        loss_sum += loss * size as f32;
        report.count += size;

        for ((name, label), prediction) in names.into_iter().zip(labels).zip(predictions) {
            for ((error, truth), predicted) in report
                .mean_abs_error
                .iter_mut()
                .zip(&label)
                .zip(&prediction)
            {
                *error += (truth - predicted).abs();
            }
            report.predictions.push((name, prediction));
        }
    }

    if report.count > 0 {
        report.loss = loss_sum / report.count as f32;
        for error in &mut report.mean_abs_error {
            *error /= report.count as f32;
        }
    }

    Ok(report)
}

fn load_trained<B: Backend>(
    artifact_dir: &Path,
    device: &B::Device,
) -> crate::Result<(TrainingConfig, Predictor<B>)> {
    let config = TrainingConfig::load(artifact_dir.join("config.json"))?;
    let predictor = Predictor::load(&config.model, &artifact_dir.join("model"), device)?;

    Ok((config, predictor))
}

pub fn evaluate<B: Backend>(
    artifact_dir: &Path,
    data_list: &Path,
    output: Option<&Path>,
    device: B::Device,
) -> crate::Result<EvalReport> {
    let (config, predictor) = load_trained::<B>(artifact_dir, &device)?;

    let mut batchizer = Batchizer::new(data_list, config.batch_size)?.with_seed(config.seed);
    let report = evaluate_pass(
        &predictor,
        &mut batchizer,
        config.label_len(),
        image_shape(&config.model),
    )?;

    info!(
        "evaluated {} samples: loss {:.6}, mae {:?}",
        report.count, report.loss, report.mean_abs_error
    );

    if let Some(output) = output {
        write_predictions(output, &report.predictions)?;
        info!("predictions written to {}", output.display());
    }

    Ok(report)
}

pub fn predict<B: Backend>(
    artifact_dir: &Path,
    images: &[PathBuf],
    device: B::Device,
) -> crate::Result<Vec<(PathBuf, Vec<f32>)>> {
    let (config, predictor) = load_trained::<B>(artifact_dir, &device)?;
    let shape = image_shape(&config.model);

    let mut predictions = Vec::with_capacity(images.len());
    for paths in images.chunks(config.batch_size.max(1)) {
        let planes = load_images(paths, shape)?;
        let outputs = predictor.predict(&planes)?;
        predictions.extend(paths.iter().cloned().zip(outputs));
    }

    Ok(predictions)
}

pub fn write_predictions(
    path: &Path,
    predictions: &[(String, Vec<f32>)],
) -> crate::Result<()> {
    let mut content = String::new();
    for (name, values) in predictions {
        let values: Vec<String> = values.iter().map(|value| value.to_string()).collect();
        content.push_str(&format!("{name},{}\n", values.join(",")));
    }

    fs::write(path, content)?;
    Ok(())
}
