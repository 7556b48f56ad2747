//! Training configuration

use anyhow::Context;
use scsims_core::DeviceSpec;
use scsims_model::{HyperParams, TrainerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Training run configuration
///
/// `model` holds any [`HyperParams`] fields except the data shape, which is
/// filled in from the training data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default)]
    pub model: serde_yaml::Mapping,

    #[serde(default)]
    pub training: TrainingConfig,
}

/// Loop and loader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,

    #[serde(default)]
    pub max_steps: Option<usize>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Share of rows held out for validation
    #[serde(default = "default_val_fraction")]
    pub val_fraction: f64,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            max_steps: None,
            batch_size: default_batch_size(),
            num_workers: default_num_workers(),
            val_fraction: default_val_fraction(),
            seed: default_seed(),
        }
    }
}

fn default_max_epochs() -> usize {
    10
}

fn default_batch_size() -> usize {
    32
}

fn default_num_workers() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_val_fraction() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct TrainOverrides {
    pub max_epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub device: Option<DeviceSpec>,
}

impl TrainConfig {
    /// Load configuration from file and CLI overrides
    pub fn load(config_path: Option<&Path>, overrides: &TrainOverrides) -> anyhow::Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => Self::default(),
        };

        if let Some(max_epochs) = overrides.max_epochs {
            config.training.max_epochs = max_epochs;
        }
        if let Some(batch_size) = overrides.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(device) = overrides.device {
            // via JSON to get the one-key map form instead of a `!cuda` tag
            config.model.insert(
                serde_yaml::Value::from("device"),
                serde_yaml::to_value(serde_json::to_value(device)?)?,
            );
        }

        Ok(config)
    }

    /// Hyperparameters for data with `input_dim` genes and `output_dim` classes
    pub fn hyperparams(&self, input_dim: usize, output_dim: usize) -> anyhow::Result<HyperParams> {
        let mut model = self.model.clone();
        model.insert("input_dim".into(), input_dim.into());
        model.insert("output_dim".into(), output_dim.into());

        let params: HyperParams = serde_yaml::from_value(serde_yaml::Value::Mapping(model))
            .context("Invalid model section")?;
        params.validate()?;
        Ok(params)
    }

    pub fn trainer(&self) -> TrainerConfig {
        TrainerConfig {
            max_epochs: self.training.max_epochs,
            max_steps: self.training.max_steps,
        }
    }
}
