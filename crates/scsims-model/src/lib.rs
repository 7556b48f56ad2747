//! SIMS Model
//!
//! Sparse, interpretable TabNet classifier for single-cell gene expression.
//!
//! The crate is organized bottom-up:
//! - [`network`]: TabNet layers, sparse attention masks and the explain reduction
//! - [`metrics`], [`loss`], [`optim`]: the training objective and its bookkeeping
//! - [`data`], [`label_encoder`]: expression matrices, gene alignment, batching
//! - [`classifier`]: [`SimsClassifier`], tying the above together
//! - [`archive`]: zip persistence of hyperparameters and weights
//! - [`trainer`]: a small epoch loop for fitting and testing
//!
//! Everything runs on Candle; pick a device through
//! [`HyperParams::device`](model_config::HyperParams::device).

pub mod archive;
pub mod classifier;
pub mod data;
pub mod label_encoder;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model_config;
pub mod network;
pub mod optim;
pub mod prediction;
pub mod trainer;

pub use classifier::{
    ClassAttrs, ExplainOptions, Explanation, PredictOptions, SimsClassifier, StepOutput,
};
pub use data::{Batch, CollateLoader, GeneAlignment, LoaderConfig, MatrixDataset};
pub use label_encoder::{LabelDecoder, LabelEncoder};
pub use logging::RunLog;
pub use loss::{CrossEntropy, LossFn};
pub use metrics::{aggregate_metrics, median_f1, ConfusionMatrix, MetricSet, StepStats};
pub use model_config::{
    CatEmbDim, HyperParams, MaskType, OptimizerKind, OptimizerSpec, SchedulerSpec,
};
pub use optim::{OptimizerConfig, OptimizerFactory, ParamOptimizer, SchedulerFactory};
pub use prediction::{LabelValue, PredictionFrame, PredictionRow};
pub use trainer::{FitReport, Trainer, TrainerConfig};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::classifier::{ExplainOptions, PredictOptions, SimsClassifier};
    pub use crate::data::{CollateLoader, GeneAlignment, LoaderConfig, MatrixDataset};
    pub use crate::label_encoder::{LabelDecoder, LabelEncoder};
    pub use crate::model_config::HyperParams;
    pub use crate::trainer::{Trainer, TrainerConfig};
    pub use scsims_core::prelude::*;
}
