use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, Wgpu},
    config::Config,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use waste_classifier::{
    logging::init_logging, train, unify::UnifiedSource, DatasetConfig, Evaluator, LabelSpace,
    Predictor, RunConfig,
};

type Backend = Wgpu<f32, i32>;
type AutodiffBackend = Autodiff<Backend>;

/// Waste image classifier: training, evaluation and prediction.
#[derive(Parser, Debug)]
#[command(name = "waste-classifier", version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (ignored when RUST_LOG is set)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Preset {
    /// 100px CNN trained from scratch
    Scratch,
    /// 224px frozen ResNet-50 with a trainable head
    Transfer,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train on one or more dataset directories
    Train {
        /// Run configuration JSON; replaces --preset and --dataset
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short, long, value_enum, default_value = "scratch")]
        preset: Preset,

        /// Dataset as NAME=PATH, repeatable; order is the concatenation order
        #[arg(short, long = "dataset", value_parser = parse_dataset)]
        datasets: Vec<DatasetConfig>,

        /// Directory receiving the artifact, config.json and metrics.jsonl
        #[arg(short, long, default_value = "artifact")]
        artifact_dir: PathBuf,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        steps_per_epoch: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Named-msgpack ResNet-50 weights for the transfer preset
        #[arg(long)]
        backbone_weights: Option<PathBuf>,

        /// Artifact to continue training from
        #[arg(long)]
        init_from: Option<PathBuf>,
    },

    /// Score a trained artifact on the validation split of dataset directories
    Evaluate {
        #[arg(short, long)]
        model: PathBuf,

        /// Run configuration JSON supplying datasets, aliases, batch size and split
        #[arg(short, long, conflicts_with = "datasets")]
        config: Option<PathBuf>,

        #[arg(
            short,
            long = "dataset",
            value_parser = parse_dataset,
            required_unless_present = "config"
        )]
        datasets: Vec<DatasetConfig>,

        /// Defaults to the run configuration's batch size
        #[arg(long)]
        batch_size: Option<usize>,

        /// Defaults to the run configuration's validation fraction
        #[arg(long)]
        validation_fraction: Option<f64>,

        /// Batches to evaluate; defaults to the whole validation split
        #[arg(long)]
        steps: Option<usize>,
    },

    /// Classify images with a trained artifact
    Predict {
        #[arg(short, long)]
        model: PathBuf,

        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Print predictions as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Write a preset run configuration to edit by hand
    InitConfig {
        #[arg(short, long, value_enum, default_value = "scratch")]
        preset: Preset,

        #[arg(short, long = "dataset", value_parser = parse_dataset)]
        datasets: Vec<DatasetConfig>,

        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },
}

fn parse_dataset(value: &str) -> Result<DatasetConfig, String> {
    let (name, root) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got '{value}'"))?;
    if name.is_empty() || root.is_empty() {
        return Err(format!("expected NAME=PATH, got '{value}'"));
    }
    Ok(DatasetConfig::new(name.to_string(), PathBuf::from(root)))
}

fn preset_config(preset: Preset, datasets: Vec<DatasetConfig>) -> RunConfig {
    match preset {
        Preset::Scratch => RunConfig::scratch(datasets),
        Preset::Transfer => RunConfig::transfer(datasets),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose).context("failed to initialize logging")?;

    let device = WgpuDevice::default();

    match cli.command {
        Commands::Train {
            config,
            preset,
            datasets,
            artifact_dir,
            epochs,
            batch_size,
            steps_per_epoch,
            seed,
            backbone_weights,
            init_from,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => {
                    if datasets.is_empty() {
                        bail!("pass at least one --dataset NAME=PATH or a --config file");
                    }
                    preset_config(preset, datasets)
                }
            };

            if let Some(epochs) = epochs {
                config.max_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if let Some(seed) = seed {
                config.seed = seed;
            }
            if steps_per_epoch.is_some() {
                config.steps_per_epoch = steps_per_epoch;
            }
            if backbone_weights.is_some() {
                config.backbone_weights = backbone_weights;
            }
            if init_from.is_some() {
                config.init_from = init_from;
            }

            let report = train::<AutodiffBackend>(&artifact_dir, config, device)
                .context("training failed")?;

            println!(
                "Stopped after {} epochs ({}); best val_loss {:.4} at epoch {}",
                report.history.len(),
                report.stop_reason,
                report.best_val_loss,
                report
                    .best_epoch
                    .map(|epoch| epoch.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            println!("Artifact: {}", report.artifact.display());
        }

        Commands::Evaluate {
            model,
            config,
            datasets,
            batch_size,
            validation_fraction,
            steps,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => RunConfig::scratch(datasets),
            };
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if let Some(validation_fraction) = validation_fraction {
                config.validation_fraction = validation_fraction;
            }

            let labels = LabelSpace::waste();
            let evaluator = Evaluator::<Backend>::load(&model, &labels, device)?;

            let options = config.evaluation_options(evaluator.metadata().img_dim);
            let source = UnifiedSource::open(&config.datasets, &labels, options)?;
            let report = evaluator.evaluate(&source, steps)?;

            println!(
                "{} samples: loss {:.4}, accuracy {:.4}",
                report.samples, report.loss, report.accuracy
            );
            for class in &report.per_class {
                match class.accuracy() {
                    Some(accuracy) => println!(
                        "  {:<10} {:>6.2}% ({}/{})",
                        class.label,
                        accuracy * 100.0,
                        class.correct,
                        class.samples
                    ),
                    None => println!("  {:<10}      - (0 samples)", class.label),
                }
            }
        }

        Commands::Predict { model, images, json } => {
            let labels = LabelSpace::waste();
            let predictor = Predictor::<Backend>::load(&model, &labels, device)?;

            for path in &images {
                let prediction = predictor.predict_path(path)?;
                if json {
                    println!("{}", serde_json::to_string(&prediction)?);
                } else {
                    println!(
                        "{}: {} ({:.2}%)",
                        path.display(),
                        prediction.label,
                        prediction.confidence * 100.0
                    );
                }
            }
        }

        Commands::InitConfig {
            preset,
            datasets,
            output,
        } => {
            write_config(&preset_config(preset, datasets), &output)?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<RunConfig> {
    RunConfig::load(path)
        .map_err(|e| anyhow!("failed to read run configuration {path:?}: {e:?}"))
}

fn write_config(config: &RunConfig, output: &Path) -> Result<()> {
    config
        .save(output)
        .with_context(|| format!("failed to write {output:?}"))?;
    info!("Wrote run configuration to {:?}", output);
    Ok(())
}
