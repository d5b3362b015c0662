use std::path::PathBuf;

use anyhow::Context;
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    config::Config,
    optim::RmsPropConfig,
    tensor::backend::AutodiffBackend,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use box_regressor::{
    augment::AugmentConfig,
    logging,
    model::ModelConfig,
    training::{evaluate, predict, train, TrainingConfig},
};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum BackendKind {
    Wgpu,
    NdArray,
}

#[derive(Parser, Debug)]
#[command(
    name = "box-regressor",
    about = "Regress (x, y, w, h, angle) boxes from grayscale images"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = logging::LogLevel::Info, global = true)]
    log_level: logging::LogLevel,

    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu, global = true)]
    backend: BackendKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model on a `path,x,y,w,h,a` list.
    Train {
        /// Training config (JSON); built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        train: PathBuf,
        #[arg(long)]
        valid: Option<PathBuf>,
        #[arg(long, default_value = "artifact")]
        artifact_dir: PathBuf,
        /// Continue from the latest checkpoint in the artifact directory.
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f64>,
    },
    /// Report loss and per-output error of a trained model on a list.
    Eval {
        #[arg(long, default_value = "artifact")]
        artifact_dir: PathBuf,
        #[arg(long)]
        data: PathBuf,
        /// Write `path,p0,p1,...` rows here.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print predictions for individual images.
    Predict {
        #[arg(long, default_value = "artifact")]
        artifact_dir: PathBuf,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
}

fn default_config() -> TrainingConfig {
    let model = ModelConfig::new(
        128,
        128,
        vec![3, 3, 3, 3, 3],
        vec![8, 8, 16, 16, 32],
        vec![true, true, true, true, false],
        vec![256, 64],
        vec![1.0, 1.0, 1.0, 1.0, 1.0],
    );

    TrainingConfig::new(
        model,
        RmsPropConfig::new()
            .with_alpha(0.9)
            .with_momentum(0.0)
            .with_epsilon(1e-10),
        AugmentConfig::new(),
    )
}

fn run<B: AutodiffBackend>(command: Command, device: B::Device) -> anyhow::Result<()> {
    match command {
        Command::Train {
            config,
            train: train_list,
            valid,
            artifact_dir,
            resume,
            epochs,
            batch_size,
            learning_rate,
        } => {
            let mut config = match config {
                Some(path) => TrainingConfig::load(&path)
                    .map_err(|e| anyhow::anyhow!("{e:?}"))
                    .with_context(|| format!("failed to load config {}", path.display()))?,
                None => default_config(),
            };
            if let Some(epochs) = epochs {
                config.epoch_count = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if let Some(learning_rate) = learning_rate {
                config.learning_rate = learning_rate;
            }

            let reports = train::<B>(
                &artifact_dir,
                config,
                &train_list,
                valid.as_deref(),
                resume,
                device,
            )
            .context("training failed")?;

            if let Some(last) = reports.last() {
                info!(
                    "finished after epoch {}: train loss {:.6}, valid loss {:?}",
                    last.epoch, last.train_loss, last.valid_loss
                );
            }
        }
        Command::Eval {
            artifact_dir,
            data,
            output,
        } => {
            let report =
                evaluate::<B::InnerBackend>(&artifact_dir, &data, output.as_deref(), device)
                    .context("evaluation failed")?;
            println!("samples: {}", report.count);
            println!("loss: {:.6}", report.loss);
            println!("mean absolute error: {:?}", report.mean_abs_error);
        }
        Command::Predict {
            artifact_dir,
            images,
        } => {
            let predictions = predict::<B::InnerBackend>(&artifact_dir, &images, device)
                .context("prediction failed")?;
            for (path, values) in predictions {
                let values: Vec<String> = values.iter().map(|v| format!("{v:.4}")).collect();
                println!("{},{}", path.display(), values.join(","));
            }
        }
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level)?;

    match cli.backend {
        BackendKind::Wgpu => {
            type Backend = Wgpu<f32, i32>;
            run::<Autodiff<Backend>>(cli.command, WgpuDevice::default())
        }
        BackendKind::NdArray => {
            type Backend = NdArray<f32>;
            run::<Autodiff<Backend>>(cli.command, NdArrayDevice::default())
        }
    }
}
