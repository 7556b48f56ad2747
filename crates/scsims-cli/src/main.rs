//! SIMS command line
//!
//! Trains TabNet cell-type classifiers on expression matrices and runs
//! prediction, explanation and feature importance on saved model archives.

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use scsims_core::DeviceSpec;
use scsims_model::prelude::*;
use scsims_model::ClassAttrs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

mod config;
mod dataset;

use config::{TrainConfig, TrainOverrides};
use dataset::DataFile;

#[derive(Parser, Debug)]
#[command(name = "scsims")]
#[command(about = "Sparse interpretable TabNet classifier for single-cell data", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Device to run on (cpu, cuda, cuda:N, metal)
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Write Prometheus metrics to this file on exit
    #[arg(long, global = true)]
    metrics_out: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a classifier and save it as a zip archive
    Train {
        /// Training configuration (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Labelled expression data (JSON)
        #[arg(long)]
        data: PathBuf,

        /// Archive path; `.zip` is appended when missing
        #[arg(short, long, default_value = "model")]
        output: PathBuf,

        #[arg(long)]
        max_epochs: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Top-3 predicted classes per row, as CSV
    Predict {
        #[arg(short, long)]
        model: PathBuf,

        #[arg(long)]
        data: PathBuf,

        /// Write CSV here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long, default_value = "32")]
        batch_size: usize,
    },

    /// Per-row attention over the input genes, as JSON
    Explain {
        #[arg(short, long)]
        model: PathBuf,

        #[arg(long)]
        data: PathBuf,

        /// Scale each row to sum to 1
        #[arg(long)]
        normalize: bool,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Share of attention per gene, as CSV
    Importances {
        #[arg(short, long)]
        model: PathBuf,

        #[arg(long)]
        data: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);
    let metrics_handle = init_metrics()?;

    let device = cli
        .device
        .as_deref()
        .map(DeviceSpec::parse)
        .transpose()?;

    match cli.command {
        Command::Train {
            config,
            data,
            output,
            max_epochs,
            batch_size,
        } => {
            let overrides = TrainOverrides {
                max_epochs,
                batch_size,
                device,
            };
            train(config.as_deref(), &data, &output, &overrides)?
        }
        Command::Predict {
            model,
            data,
            output,
            batch_size,
        } => predict(&model, &data, output.as_deref(), batch_size, device)?,
        Command::Explain {
            model,
            data,
            normalize,
            output,
        } => explain(&model, &data, normalize, output.as_deref(), device)?,
        Command::Importances {
            model,
            data,
            output,
        } => importances(&model, &data, output.as_deref(), device)?,
    }

    if let Some(path) = cli.metrics_out {
        std::fs::write(&path, metrics_handle.render())
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!("Metrics written to {}", path.display());
    }
    Ok(())
}

fn train(
    config_path: Option<&Path>,
    data_path: &Path,
    output: &Path,
    overrides: &TrainOverrides,
) -> Result<()> {
    let config = TrainConfig::load(config_path, overrides)?;
    info!("Configuration loaded successfully");

    let data = DataFile::load(data_path)?;
    let labels = data
        .labels
        .as_deref()
        .context("Training data needs a `labels` array")?;
    let encoder = LabelEncoder::fit(labels);
    let dataset = data.to_dataset(Some(&encoder))?;
    info!(
        rows = dataset.n_rows(),
        genes = dataset.n_cols(),
        classes = encoder.num_classes(),
        "Training data loaded"
    );

    let hparams = config.hyperparams(dataset.n_cols(), encoder.num_classes())?;
    let loader_config = LoaderConfig::default()
        .with_batch_size(config.training.batch_size)
        .with_workers(config.training.num_workers);

    let (train_loader, val_loader) = if config.training.val_fraction > 0.0 {
        let (train_set, val_set) = dataset.split(config.training.val_fraction, config.training.seed)?;
        if train_set.n_rows() == 0 {
            bail!(
                "val_fraction {} leaves no rows for training",
                config.training.val_fraction
            );
        }
        let val = if val_set.n_rows() > 0 {
            Some(CollateLoader::new(val_set, loader_config.clone())?)
        } else {
            None
        };
        let train = CollateLoader::new(
            train_set,
            loader_config.with_shuffle(config.training.seed),
        )?;
        (train, val)
    } else {
        let train = CollateLoader::new(dataset, loader_config.with_shuffle(config.training.seed))?;
        (train, None)
    };

    let mut classifier = SimsClassifier::new(hparams)?.with_class_attrs(ClassAttrs {
        preds_mapper: Some(encoder.to_mapper()),
        refgenes: data.genes.clone(),
    });

    let report = Trainer::new(config.trainer()).fit(&mut classifier, &train_loader, val_loader.as_ref())?;
    if let Some(last) = report.epochs.last() {
        info!(
            epochs = report.epochs.len(),
            steps = report.steps,
            train_loss = ?last.train_loss,
            val_median_f1 = ?last.val_median_f1,
            "Training finished"
        );
    }

    let archive = classifier.save_model(output)?;
    info!("Model saved to {}", archive.display());
    Ok(())
}

/// Load an archive, optionally moving it to another device
fn load_classifier(model: &Path, device: Option<DeviceSpec>) -> Result<SimsClassifier> {
    let device = match device {
        Some(spec) => spec.to_device()?,
        None => Device::Cpu,
    };
    let classifier = SimsClassifier::load(model, &device)
        .with_context(|| format!("Failed to load model {}", model.display()))?;
    info!("Model loaded from {}", model.display());
    Ok(classifier)
}

/// Dataset plus the alignment onto the model's training genes
fn load_inputs(
    classifier: &SimsClassifier,
    data_path: &Path,
) -> Result<(MatrixDataset, Option<GeneAlignment>)> {
    let data = DataFile::load(data_path)?;
    let alignment = data.alignment(classifier.class_attrs.refgenes.as_deref());
    if alignment.is_none() && data.rows[0].len() != classifier.hparams().input_dim {
        bail!(
            "{} has {} columns but the model expects {}; include a `genes` array to align them",
            data_path.display(),
            data.rows[0].len(),
            classifier.hparams().input_dim
        );
    }
    Ok((data.to_dataset(None)?, alignment))
}

fn write_output(output: Option<&Path>, content: &str) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {}", path.display());
        }
        None => std::io::stdout().write_all(content.as_bytes())?,
    }
    Ok(())
}

fn predict(
    model: &Path,
    data_path: &Path,
    output: Option<&Path>,
    batch_size: usize,
    device: Option<DeviceSpec>,
) -> Result<()> {
    let mut classifier = load_classifier(model, device)?;
    let (dataset, alignment) = load_inputs(&classifier, data_path)?;

    let options = PredictOptions::default()
        .with_batch_size(batch_size)
        .with_alignment(alignment);
    let mapper = classifier.class_attrs.preds_mapper.clone();
    let decoder = mapper.as_ref().map(|m| m as &dyn LabelDecoder);
    let frame = classifier.predict(&dataset, &options, decoder)?;

    write_output(output, &frame.to_csv_string())
}

fn explain(
    model: &Path,
    data_path: &Path,
    normalize: bool,
    output: Option<&Path>,
    device: Option<DeviceSpec>,
) -> Result<()> {
    let mut classifier = load_classifier(model, device)?;
    let (dataset, alignment) = load_inputs(&classifier, data_path)?;

    let mut options = ExplainOptions::default().with_alignment(alignment);
    if normalize {
        options = options.normalized();
    }
    let explanation = classifier.explain(&dataset, &options)?;

    let body = serde_json::json!({
        "genes": classifier.class_attrs.refgenes,
        "matrix": explanation.matrix.to_vec2::<f32>()?,
        "labels": explanation.labels,
    });
    write_output(output, &serde_json::to_string_pretty(&body)?)
}

fn importances(
    model: &Path,
    data_path: &Path,
    output: Option<&Path>,
    device: Option<DeviceSpec>,
) -> Result<()> {
    let mut classifier = load_classifier(model, device)?;
    let (dataset, alignment) = load_inputs(&classifier, data_path)?;

    let options = ExplainOptions::default().with_alignment(alignment);
    let importances = classifier.feature_importances(&dataset, &options)?;

    let mut csv = String::from("gene,importance\n");
    for (i, value) in importances.iter().enumerate() {
        let gene = classifier
            .class_attrs
            .refgenes
            .as_ref()
            .and_then(|genes| genes.get(i).cloned())
            .unwrap_or_else(|| i.to_string());
        csv.push_str(&format!("{},{}\n", gene, value));
    }
    write_output(output, &csv)
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("scsims=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scsims=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Initialize metrics recorder and return handle for rendering
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    metrics::describe_gauge!(
        "scsims_step_value",
        "Last value of each per-step training scalar"
    );
    metrics::describe_gauge!(
        "scsims_epoch_value",
        "Last value of each per-epoch scalar, including metrics and learning rate"
    );

    Ok(handle)
}
