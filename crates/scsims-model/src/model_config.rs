//! Model hyperparameters
//!
//! Everything needed to rebuild an equivalent classifier. This is the
//! `init_params` block of a saved model archive, so every field here must stay
//! serializable. Live objects (custom losses, optimizer factories) are attached
//! separately on the classifier and never reach this struct.

use scsims_core::{DeviceSpec, Error, Result};
use serde::{Deserialize, Serialize};

/// TabNet classifier hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    /// Number of input features (genes)
    pub input_dim: usize,

    /// Number of classes
    pub output_dim: usize,

    /// Width of the decision layer
    #[serde(default = "default_width")]
    pub n_d: usize,

    /// Width of the attention layer
    #[serde(default = "default_width")]
    pub n_a: usize,

    /// Number of decision steps
    #[serde(default = "default_n_steps")]
    pub n_steps: usize,

    /// Feature reuse relaxation; 1.0 forces each feature to be used at most once
    #[serde(default = "default_gamma")]
    pub gamma: f64,

    /// Column indices of categorical features
    #[serde(default)]
    pub cat_idxs: Vec<usize>,

    /// Cardinality of each categorical feature
    #[serde(default)]
    pub cat_dims: Vec<usize>,

    /// Embedding width of categorical features
    #[serde(default)]
    pub cat_emb_dim: CatEmbDim,

    /// Independent GLU layers per feature transformer
    #[serde(default = "default_glu_layers")]
    pub n_independent: usize,

    /// GLU layers shared across decision steps
    #[serde(default = "default_glu_layers")]
    pub n_shared: usize,

    /// Added inside the log of the sparsity term
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Chunk size for ghost batch normalization
    #[serde(default = "default_virtual_batch_size")]
    pub virtual_batch_size: usize,

    /// Batch norm momentum
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    /// Attention mask function
    #[serde(default)]
    pub mask_type: MaskType,

    /// Weight of the sparsity term in the loss
    #[serde(default = "default_lambda_sparse")]
    pub lambda_sparse: f64,

    /// Optimizer settings
    #[serde(default)]
    pub optim_params: OptimizerSpec,

    /// Learning-rate scheduler settings; `null` disables scheduling
    #[serde(default = "default_scheduler")]
    pub scheduler_params: Option<SchedulerSpec>,

    /// Per-class loss weights
    #[serde(default)]
    pub weights: Option<Vec<f32>>,

    /// Skip building the explain reduction matrix
    #[serde(default)]
    pub no_explain: bool,

    /// Device the network lives on; overwritten with the caller's device on load.
    /// Written as `cpu` or a one-key map such as `cuda: {index: 1}`.
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub device: DeviceSpec,
}

/// Categorical embedding width, either shared or per categorical feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CatEmbDim {
    Single(usize),
    PerFeature(Vec<usize>),
}

impl Default for CatEmbDim {
    fn default() -> Self {
        Self::Single(1)
    }
}

impl CatEmbDim {
    /// Embedding widths expanded to one entry per categorical feature
    pub fn expand(&self, n_cat: usize) -> Vec<usize> {
        match self {
            Self::Single(dim) => vec![*dim; n_cat],
            Self::PerFeature(dims) => dims.clone(),
        }
    }
}

/// Function turning attention logits into a mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MaskType {
    #[default]
    Sparsemax,
    Entmax,
}

/// Built-in optimizers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    AdamW,
    Sgd,
}

/// Optimizer settings. When an optimizer factory is attached to the classifier
/// `optimizer` is ignored and the remaining fields are handed to the factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    #[serde(default)]
    pub optimizer: OptimizerKind,

    #[serde(default = "default_lr")]
    pub lr: f64,

    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    #[serde(default = "default_beta1")]
    pub beta1: f64,

    #[serde(default = "default_beta2")]
    pub beta2: f64,

    #[serde(default = "default_eps")]
    pub eps: f64,
}

impl Default for OptimizerSpec {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::default(),
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
        }
    }
}

/// Learning-rate scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheduler", rename_all = "snake_case")]
pub enum SchedulerSpec {
    /// Multiply the LR by `factor` once the monitored loss stops improving
    ReduceOnPlateau {
        #[serde(default = "default_plateau_factor")]
        factor: f64,
        #[serde(default = "default_patience")]
        patience: usize,
        #[serde(default = "default_threshold")]
        threshold: f64,
        #[serde(default)]
        cooldown: usize,
        #[serde(default)]
        min_lr: f64,
    },

    /// Multiply the LR by `gamma` every `step_size` epochs
    StepDecay {
        step_size: usize,
        #[serde(default = "default_step_gamma")]
        gamma: f64,
    },
}

impl Default for SchedulerSpec {
    fn default() -> Self {
        Self::ReduceOnPlateau {
            factor: default_plateau_factor(),
            patience: default_patience(),
            threshold: default_threshold(),
            cooldown: 0,
            min_lr: 0.0,
        }
    }
}

fn default_width() -> usize {
    8
}

fn default_n_steps() -> usize {
    3
}

fn default_gamma() -> f64 {
    1.3
}

fn default_glu_layers() -> usize {
    2
}

fn default_epsilon() -> f64 {
    1e-15
}

fn default_virtual_batch_size() -> usize {
    128
}

fn default_momentum() -> f64 {
    0.02
}

fn default_lambda_sparse() -> f64 {
    1e-3
}

fn default_scheduler() -> Option<SchedulerSpec> {
    Some(SchedulerSpec::default())
}

fn default_lr() -> f64 {
    1e-3
}

fn default_weight_decay() -> f64 {
    1e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

fn default_plateau_factor() -> f64 {
    0.75 // Reduce LR by 25% on plateau
}

fn default_patience() -> usize {
    10
}

fn default_threshold() -> f64 {
    1e-4
}

fn default_step_gamma() -> f64 {
    0.1
}

impl HyperParams {
    /// Hyperparameters with defaults for everything but the data shape
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            n_d: default_width(),
            n_a: default_width(),
            n_steps: default_n_steps(),
            gamma: default_gamma(),
            cat_idxs: Vec::new(),
            cat_dims: Vec::new(),
            cat_emb_dim: CatEmbDim::default(),
            n_independent: default_glu_layers(),
            n_shared: default_glu_layers(),
            epsilon: default_epsilon(),
            virtual_batch_size: default_virtual_batch_size(),
            momentum: default_momentum(),
            mask_type: MaskType::default(),
            lambda_sparse: default_lambda_sparse(),
            optim_params: OptimizerSpec::default(),
            scheduler_params: default_scheduler(),
            weights: None,
            no_explain: false,
            device: DeviceSpec::default(),
        }
    }

    /// Load from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let params: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("Failed to parse hyperparameters: {}", e)))?;
        params.validate()?;
        Ok(params)
    }

    /// Load from a YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Set decision and attention widths
    pub fn with_widths(mut self, n_d: usize, n_a: usize) -> Self {
        self.n_d = n_d;
        self.n_a = n_a;
        self
    }

    /// Set number of decision steps
    pub fn with_steps(mut self, n_steps: usize) -> Self {
        self.n_steps = n_steps;
        self
    }

    /// Set categorical features
    pub fn with_categorical(
        mut self,
        cat_idxs: Vec<usize>,
        cat_dims: Vec<usize>,
        cat_emb_dim: CatEmbDim,
    ) -> Self {
        self.cat_idxs = cat_idxs;
        self.cat_dims = cat_dims;
        self.cat_emb_dim = cat_emb_dim;
        self
    }

    /// Set mask function
    pub fn with_mask_type(mut self, mask_type: MaskType) -> Self {
        self.mask_type = mask_type;
        self
    }

    /// Set sparsity weight
    pub fn with_lambda_sparse(mut self, lambda_sparse: f64) -> Self {
        self.lambda_sparse = lambda_sparse;
        self
    }

    /// Set per-class loss weights
    pub fn with_weights(mut self, weights: Vec<f32>) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Set optimizer
    pub fn with_optimizer(mut self, spec: OptimizerSpec) -> Self {
        self.optim_params = spec;
        self
    }

    /// Set or disable the scheduler
    pub fn with_scheduler(mut self, spec: Option<SchedulerSpec>) -> Self {
        self.scheduler_params = spec;
        self
    }

    /// Set ghost batch size
    pub fn with_virtual_batch_size(mut self, virtual_batch_size: usize) -> Self {
        self.virtual_batch_size = virtual_batch_size;
        self
    }

    /// Set device
    pub fn with_device(mut self, device: DeviceSpec) -> Self {
        self.device = device;
        self
    }

    /// Skip building the explain matrix
    pub fn without_explain(mut self) -> Self {
        self.no_explain = true;
        self
    }

    /// Reject shapes the network cannot be built from
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.output_dim == 0 {
            return Err(Error::config(format!(
                "input_dim and output_dim must be positive (got {} and {})",
                self.input_dim, self.output_dim
            )));
        }
        if self.n_steps == 0 {
            return Err(Error::config("n_steps must be at least 1"));
        }
        if self.n_d == 0 || self.n_a == 0 {
            return Err(Error::config("n_d and n_a must be positive"));
        }
        if self.n_shared == 0 && self.n_independent == 0 {
            return Err(Error::config(
                "n_shared and n_independent can't be both zero",
            ));
        }
        if self.virtual_batch_size == 0 {
            return Err(Error::config("virtual_batch_size must be positive"));
        }
        if self.cat_idxs.len() != self.cat_dims.len() {
            return Err(Error::config(format!(
                "cat_idxs has {} entries but cat_dims has {}",
                self.cat_idxs.len(),
                self.cat_dims.len()
            )));
        }
        if let Some(idx) = self.cat_idxs.iter().find(|&&i| i >= self.input_dim) {
            return Err(Error::config(format!(
                "categorical index {} is out of range for input_dim {}",
                idx, self.input_dim
            )));
        }
        if self.cat_idxs.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::config("cat_idxs must be strictly increasing"));
        }
        if let CatEmbDim::PerFeature(dims) = &self.cat_emb_dim {
            if dims.len() != self.cat_dims.len() {
                return Err(Error::config(format!(
                    "cat_emb_dim has {} entries but there are {} categorical features",
                    dims.len(),
                    self.cat_dims.len()
                )));
            }
        }
        if self.cat_emb_dim.expand(self.cat_idxs.len()).contains(&0) {
            return Err(Error::config("cat_emb_dim entries must be positive"));
        }
        if let Some(weights) = &self.weights {
            if weights.len() != self.output_dim {
                return Err(Error::config(format!(
                    "{} class weights given for {} classes",
                    weights.len(),
                    self.output_dim
                )));
            }
        }
        Ok(())
    }

    /// Width of the input after categorical embedding
    pub fn post_embed_dim(&self) -> usize {
        let emb: usize = self.cat_emb_dim.expand(self.cat_idxs.len()).iter().sum();
        self.input_dim + emb - self.cat_idxs.len()
    }
}
