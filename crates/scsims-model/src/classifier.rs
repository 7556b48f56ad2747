//! The SIMS classifier
//!
//! [`SimsClassifier`] wraps a [`TabNet`] network with everything around it:
//! the training objective, per-step and per-epoch metrics, optimizer
//! construction, explanation, prediction and (in `archive`) persistence.

use crate::data::{Batch, CollateLoader, GeneAlignment, LoaderConfig, MatrixDataset};
use crate::label_encoder::LabelDecoder;
use crate::logging::RunLog;
use crate::loss::{CrossEntropy, LossFn};
use crate::metrics::{
    aggregate_metrics, median, per_class_f1, BatchPredictions, ConfusionMatrix, MetricSet,
    StepStats,
};
use crate::model_config::HyperParams;
use crate::network::{ReducingMatrix, TabNet};
use crate::optim::{
    build_optimizers, OptimizerConfig, OptimizerFactory, ParamOptimizer, SchedulerFactory,
};
use crate::prediction::{LabelValue, PredictionFrame, PredictionRow};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use scsims_core::{Error, Result, Tag};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Number of ranked classes reported per sample by [`SimsClassifier::predict`]
pub const TOP_K: usize = 3;

/// Non-hyperparameter state stored alongside the weights
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassAttrs {
    /// Class index to label
    #[serde(default)]
    pub preds_mapper: Option<BTreeMap<u32, String>>,

    /// Gene order the network was trained on
    #[serde(default)]
    pub refgenes: Option<Vec<String>>,
}

/// Result of one training, validation or test step
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Classification loss minus the weighted sparsity term
    pub loss: Tensor,
    pub stats: StepStats,
}

/// Options for [`SimsClassifier::explain`] and [`SimsClassifier::feature_importances`]
#[derive(Debug, Clone, PartialEq)]
pub struct ExplainOptions {
    /// Only explain these rows
    pub rows: Option<Vec<usize>>,
    pub batch_size: usize,
    pub num_workers: usize,
    pub alignment: Option<GeneAlignment>,
    /// Reuse (and fill) the cached result
    pub cache: bool,
    /// Divide every row by its sum
    pub normalize: bool,
}

impl Default for ExplainOptions {
    fn default() -> Self {
        Self {
            rows: None,
            batch_size: 4,
            num_workers: 0,
            alignment: None,
            cache: false,
            normalize: false,
        }
    }
}

impl ExplainOptions {
    pub fn with_rows(mut self, rows: Vec<usize>) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_alignment(mut self, alignment: Option<GeneAlignment>) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn normalized(mut self) -> Self {
        self.normalize = true;
        self
    }
}

/// Options for [`SimsClassifier::predict`]
#[derive(Debug, Clone, PartialEq)]
pub struct PredictOptions {
    pub rows: Option<Vec<usize>>,
    pub batch_size: usize,
    pub num_workers: usize,
    pub alignment: Option<GeneAlignment>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            rows: None,
            batch_size: 32,
            num_workers: 4,
            alignment: None,
        }
    }
}

impl PredictOptions {
    pub fn with_rows(mut self, rows: Vec<usize>) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_alignment(mut self, alignment: Option<GeneAlignment>) -> Self {
        self.alignment = alignment;
        self
    }
}

/// Attention scores mapped back onto the input features
#[derive(Debug, Clone)]
pub struct Explanation {
    /// `(n, input_dim)` aggregate attention
    pub matrix: Tensor,
    /// One `(n, input_dim)` mask per decision step
    pub masks: Vec<Tensor>,
    /// Labels of the explained rows, when the dataset is labelled
    pub labels: Option<Vec<u32>>,
}

/// TabNet classifier with its training objective and inference helpers
pub struct SimsClassifier {
    pub(crate) hparams: HyperParams,
    pub(crate) device: Device,
    pub(crate) varmap: VarMap,
    pub(crate) network: TabNet,
    pub(crate) reducing_matrix: Option<ReducingMatrix>,
    pub(crate) class_weights: Option<Tensor>,
    pub(crate) loss: Option<Arc<dyn LossFn>>,
    pub(crate) metrics: MetricSet,
    pub(crate) custom_metrics: bool,
    pub(crate) optimizer_factory: Option<OptimizerFactory>,
    pub(crate) scheduler_factory: Option<SchedulerFactory>,
    pub class_attrs: ClassAttrs,
    explain_cache: Option<Explanation>,
    importance_cache: Option<Vec<f32>>,
    log: RunLog,
}

impl std::fmt::Debug for SimsClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimsClassifier")
            .field("hparams", &self.hparams)
            .field("device", &self.device)
            .field("training", &self.network.is_training())
            .field("metrics", &self.metrics.names())
            .field("class_attrs", &self.class_attrs)
            .finish_non_exhaustive()
    }
}

impl SimsClassifier {
    /// Build an untrained classifier on the device named in `hparams`
    pub fn new(hparams: HyperParams) -> Result<Self> {
        let device = hparams.device.to_device()?;
        Self::on_device(hparams, device)
    }

    /// Build an untrained classifier on `device`
    pub fn on_device(hparams: HyperParams, device: Device) -> Result<Self> {
        hparams.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network = TabNet::new(&hparams, vb)
            .map_err(|e| Error::model(format!("Failed to build network: {}", e)))?;

        let reducing_matrix = if hparams.no_explain {
            None
        } else {
            Some(ReducingMatrix::new(&hparams))
        };

        let class_weights = hparams
            .weights
            .as_ref()
            .map(|w| Tensor::new(w.as_slice(), &device))
            .transpose()?;

        info!(
            input_dim = hparams.input_dim,
            output_dim = hparams.output_dim,
            n_steps = hparams.n_steps,
            parameters = varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            "Built SIMS classifier"
        );

        Ok(Self {
            metrics: aggregate_metrics(hparams.output_dim),
            hparams,
            device,
            varmap,
            network,
            reducing_matrix,
            class_weights,
            loss: None,
            custom_metrics: false,
            optimizer_factory: None,
            scheduler_factory: None,
            class_attrs: ClassAttrs::default(),
            explain_cache: None,
            importance_cache: None,
            log: RunLog::new(),
        })
    }

    /// Replace the cross-entropy loss
    pub fn with_loss(mut self, loss: Arc<dyn LossFn>) -> Self {
        self.loss = Some(loss);
        self
    }

    /// Replace the default metric dictionary
    pub fn with_metrics(mut self, metrics: MetricSet) -> Self {
        self.metrics = metrics;
        self.custom_metrics = true;
        self
    }

    pub fn with_optimizer_factory(mut self, factory: OptimizerFactory) -> Self {
        self.optimizer_factory = Some(factory);
        self
    }

    pub fn with_scheduler_factory(mut self, factory: SchedulerFactory) -> Self {
        self.scheduler_factory = Some(factory);
        self
    }

    pub fn with_class_attrs(mut self, class_attrs: ClassAttrs) -> Self {
        self.class_attrs = class_attrs;
        self
    }

    pub fn hparams(&self) -> &HyperParams {
        &self.hparams
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn network(&self) -> &TabNet {
        &self.network
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut RunLog {
        &mut self.log
    }

    pub fn train(&mut self) {
        self.network.train();
    }

    pub fn eval(&mut self) {
        self.network.eval();
    }

    pub fn is_training(&self) -> bool {
        self.network.is_training()
    }

    /// Names of attached live objects that cannot be written to an archive
    pub fn unserializable_params(&self) -> Vec<&'static str> {
        let mut dropped = Vec::new();
        if self.loss.is_some() {
            dropped.push("loss");
        }
        if self.optimizer_factory.is_some() {
            dropped.push("optimizer");
        }
        if self.scheduler_factory.is_some() {
            dropped.push("scheduler");
        }
        if self.custom_metrics {
            dropped.push("metrics");
        }
        dropped
    }

    /// Drop cached explanations; called whenever the weights change
    pub fn clear_caches(&mut self) {
        self.explain_cache = None;
        self.importance_cache = None;
    }

    pub fn explain_cache(&self) -> Option<&Explanation> {
        self.explain_cache.as_ref()
    }

    pub fn importance_cache(&self) -> Option<&[f32]> {
        self.importance_cache.as_deref()
    }

    /// Logits and sparsity term for a `(n, input_dim)` batch
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, cols) = xs.dims2()?;
        if cols != self.hparams.input_dim {
            return Err(Error::data(format!(
                "Expected {} input features, got {}",
                self.hparams.input_dim, cols
            )));
        }
        Ok(self.network.forward(xs)?)
    }

    /// Supervised loss minus `lambda_sparse` times the sparsity term
    pub fn compute_loss(&self, logits: &Tensor, targets: &Tensor, sparsity: &Tensor) -> Result<Tensor> {
        let loss_fn: &dyn LossFn = match &self.loss {
            Some(loss) => loss.as_ref(),
            None => &CrossEntropy,
        };
        let loss = loss_fn.compute(logits, targets, self.class_weights.as_ref())?;
        Ok(loss.broadcast_sub(&(sparsity * self.hparams.lambda_sparse)?)?)
    }

    fn step(&mut self, batch: &Batch, tag: Tag) -> Result<StepOutput> {
        let targets = batch
            .labels
            .as_ref()
            .ok_or_else(|| Error::data(format!("{} step needs a labelled batch", tag)))?;

        let (logits, sparsity) = self.forward(&batch.features)?;
        if self.network.is_training() {
            // batch norm running statistics moved
            self.clear_caches();
        }
        let loss = self.compute_loss(&logits, targets, &sparsity)?;

        let predictions = BatchPredictions::from_logits(&logits, targets)?;
        let loss_value = loss.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        self.log.log_step(&tag.key("loss"), loss_value);
        for (name, value) in self.metrics.compute(&predictions) {
            self.log.log_step(&tag.key(&name), value);
        }

        Ok(StepOutput {
            loss,
            stats: predictions.step_stats(),
        })
    }

    pub fn training_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        self.step(batch, Tag::Train)
    }

    pub fn validation_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        self.step(batch, Tag::Val)
    }

    pub fn test_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        self.step(batch, Tag::Test)
    }

    /// Sum the epoch's counts, log `{tag}_median_f1` plus the epoch means of the
    /// step values, and return the per-class F1 scores
    pub fn epoch_end(&mut self, tag: Tag, outputs: &[StepStats]) -> Vec<f64> {
        let totals = StepStats::sum(outputs);
        let f1 = per_class_f1(&totals);
        self.log.log_epoch(&tag.key("median_f1"), median(&f1));
        self.log.flush_epoch(tag);
        f1
    }

    /// Fresh optimizer (and scheduler) built from the stored settings
    pub fn configure_optimizers(&self) -> Result<OptimizerConfig> {
        build_optimizers(
            self.varmap.all_vars(),
            &self.hparams.optim_params,
            self.hparams.scheduler_params.as_ref(),
            self.optimizer_factory.as_ref(),
            self.scheduler_factory.as_ref(),
        )
    }

    /// Backpropagate `loss` and update the weights
    pub fn optimizer_step(&mut self, optimizer: &mut dyn ParamOptimizer, loss: &Tensor) -> Result<()> {
        optimizer.backward_step(loss)?;
        self.clear_caches();
        Ok(())
    }

    /// Run `f` with the network in eval mode, restoring the previous mode afterwards
    fn in_eval_mode<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let was_training = self.network.is_training();
        self.network.eval();
        let result = f(self);
        if was_training {
            self.network.train();
        }
        result
    }

    fn loader(
        &self,
        dataset: &MatrixDataset,
        rows: Option<&[usize]>,
        config: LoaderConfig,
    ) -> Result<CollateLoader> {
        let dataset = match rows {
            Some(rows) => dataset.select_rows(rows)?,
            None => dataset.clone(),
        };
        let loader = CollateLoader::new(dataset, config)?;
        if loader.n_features() != self.hparams.input_dim {
            return Err(Error::data(format!(
                "Dataset has {} features but the model expects {}",
                loader.n_features(),
                self.hparams.input_dim
            )));
        }
        Ok(loader)
    }

    /// Attention over the original input features for every row of `dataset`
    pub fn explain(&mut self, dataset: &MatrixDataset, options: &ExplainOptions) -> Result<Explanation> {
        if self.reducing_matrix.is_none() {
            return Err(Error::model(
                "explain is unavailable: the classifier was built with no_explain",
            ));
        }
        if options.cache {
            if let Some(cached) = &self.explain_cache {
                debug!("Returning cached explanation");
                return Ok(cached.clone());
            }
        }

        let loader = self.loader(
            dataset,
            options.rows.as_deref(),
            LoaderConfig::default()
                .with_batch_size(options.batch_size)
                .with_workers(options.num_workers)
                .with_alignment(options.alignment.clone()),
        )?;
        let explanation = self.in_eval_mode(|this| this.explain_batches(&loader))?;

        let explanation = if options.normalize {
            let sums = explanation.matrix.sum_keepdim(1)?;
            let empty_rows = sums.eq(&sums.zeros_like()?)?.to_dtype(sums.dtype())?;
            let matrix = explanation.matrix.broadcast_div(&(sums + empty_rows)?)?;
            Explanation {
                matrix,
                ..explanation
            }
        } else {
            explanation
        };

        info!(rows = loader.n_rows(), normalize = options.normalize, "Computed explanation");
        if options.cache {
            self.explain_cache = Some(explanation.clone());
        }
        Ok(explanation)
    }

    fn explain_batches(&self, loader: &CollateLoader) -> Result<Explanation> {
        let reducing = self
            .reducing_matrix
            .as_ref()
            .ok_or_else(|| Error::internal("explain matrix missing"))?;

        let mut matrices = Vec::with_capacity(loader.len());
        let mut step_masks: Vec<Vec<Tensor>> = vec![Vec::new(); self.hparams.n_steps];
        let mut labels = loader.has_labels().then(Vec::new);

        for batch in loader.batches(&self.device) {
            let batch = batch?;
            let (explain, masks) = self.network.forward_masks(&batch.features.detach())?;
            matrices.push(reducing.reduce(&explain.detach())?);
            for (collected, mask) in step_masks.iter_mut().zip(&masks) {
                collected.push(reducing.reduce(&mask.detach())?);
            }
            if let (Some(all), Some(batch_labels)) = (labels.as_mut(), &batch.labels) {
                all.extend(batch_labels.to_vec1::<u32>()?);
            }
        }

        let stack = |parts: &[Tensor]| -> Result<Tensor> {
            if parts.is_empty() {
                Ok(Tensor::zeros((0, self.hparams.input_dim), DType::F32, &self.device)?)
            } else {
                Ok(Tensor::cat(parts, 0)?)
            }
        };

        Ok(Explanation {
            matrix: stack(&matrices)?,
            masks: step_masks
                .iter()
                .map(|m| stack(m.as_slice()))
                .collect::<Result<_>>()?,
            labels,
        })
    }

    /// Share of total attention given to each input feature; sums to 1
    pub fn feature_importances(
        &mut self,
        dataset: &MatrixDataset,
        options: &ExplainOptions,
    ) -> Result<Vec<f32>> {
        if options.cache {
            if let Some(cached) = &self.importance_cache {
                return Ok(cached.clone());
            }
        }

        let raw = ExplainOptions {
            cache: false,
            normalize: false,
            ..options.clone()
        };
        let explanation = self.explain(dataset, &raw)?;
        let per_feature = explanation.matrix.sum(0)?;
        let total = per_feature.sum_all()?.to_scalar::<f32>()?;
        if total <= 0.0 || !total.is_finite() {
            return Err(Error::model(
                "Feature importances are undefined: total attention is zero",
            ));
        }
        let importances: Vec<f32> = per_feature
            .to_vec1::<f32>()?
            .into_iter()
            .map(|v| v / total)
            .collect();

        if options.cache {
            self.importance_cache = Some(importances.clone());
        }
        Ok(importances)
    }

    /// Top-ranked classes for every row of `dataset`
    pub fn predict(
        &mut self,
        dataset: &MatrixDataset,
        options: &PredictOptions,
        decoder: Option<&dyn LabelDecoder>,
    ) -> Result<PredictionFrame> {
        let loader = self.loader(
            dataset,
            options.rows.as_deref(),
            LoaderConfig::default()
                .with_batch_size(options.batch_size)
                .with_workers(options.num_workers)
                .with_alignment(options.alignment.clone()),
        )?;
        let frame = self.in_eval_mode(|this| this.predict_batches(&loader, decoder))?;
        info!(rows = frame.len(), "Predicted");
        Ok(frame)
    }

    fn predict_batches(
        &self,
        loader: &CollateLoader,
        decoder: Option<&dyn LabelDecoder>,
    ) -> Result<PredictionFrame> {
        let k = TOP_K.min(self.hparams.output_dim);
        let mut rows = Vec::with_capacity(loader.n_rows());

        for batch in loader.batches(&self.device) {
            let batch = batch?;
            let (logits, _) = self.forward(&batch.features.detach())?;
            let top = logits
                .contiguous()?
                .arg_sort_last_dim(false)?
                .narrow(D::Minus1, 0, k)?
                .to_vec2::<u32>()?;

            // column-major so each rank is decoded in one call
            let mut ranked: Vec<Vec<LabelValue>> = Vec::with_capacity(k);
            for rank in 0..k {
                let indices: Vec<u32> = top.iter().map(|row| row[rank]).collect();
                let values = match decoder {
                    Some(decoder) => decoder
                        .inverse_transform(&indices)?
                        .into_iter()
                        .map(LabelValue::Name)
                        .collect(),
                    None => indices.into_iter().map(LabelValue::Index).collect(),
                };
                ranked.push(values);
            }

            let actual = batch
                .labels
                .as_ref()
                .map(|labels| labels.to_vec1::<u32>())
                .transpose()?;

            for i in 0..top.len() {
                let at = |rank: usize| ranked.get(rank).map(|col| col[i].clone());
                let Some(first_prob) = at(0) else {
                    return Err(Error::internal("prediction without a top class"));
                };
                rows.push(PredictionRow {
                    first_prob,
                    second_prob: at(1),
                    third_prob: at(2),
                    actual_label: actual.as_ref().map(|a| a[i]),
                });
            }
        }

        Ok(PredictionFrame { rows })
    }

    /// `[true][pred]` counts over a labelled loader
    pub fn confusion_matrix(&mut self, loader: &CollateLoader) -> Result<ConfusionMatrix> {
        if !loader.has_labels() {
            return Err(Error::data("Confusion matrix needs a labelled loader"));
        }
        self.in_eval_mode(|this| {
            let mut matrix = ConfusionMatrix::new(this.hparams.output_dim);
            for batch in loader.batches(&this.device) {
                let batch = batch?;
                let (logits, _) = this.forward(&batch.features.detach())?;
                let preds = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
                if let Some(labels) = &batch.labels {
                    matrix.update(&preds, &labels.to_vec1::<u32>()?);
                }
            }
            Ok(matrix)
        })
    }
}
