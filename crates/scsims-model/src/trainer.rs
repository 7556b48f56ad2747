//! Minimal training loop driving a [`SimsClassifier`]

use crate::classifier::SimsClassifier;
use crate::data::CollateLoader;
use crate::metrics::{median, StepStats};
use crate::optim::OptimizerConfig;
use scsims_core::{Result, Tag};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Loop limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,

    /// Stop after this many optimizer steps, mid-epoch if needed
    #[serde(default)]
    pub max_steps: Option<usize>,
}

fn default_max_epochs() -> usize {
    10
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            max_steps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: Option<f64>,
    pub train_median_f1: f64,
    pub val_loss: Option<f64>,
    pub val_median_f1: Option<f64>,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitReport {
    pub epochs: Vec<EpochSummary>,
    pub steps: usize,
    pub final_learning_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Trainer {
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }

    fn steps_exhausted(&self, steps: usize) -> bool {
        self.config.max_steps.is_some_and(|max| steps >= max)
    }

    /// Train on `train`, validating on `val` after every epoch. The classifier is
    /// left in eval mode.
    pub fn fit(
        &self,
        classifier: &mut SimsClassifier,
        train: &CollateLoader,
        val: Option<&CollateLoader>,
    ) -> Result<FitReport> {
        let OptimizerConfig {
            mut optimizer,
            mut lr_scheduler,
            monitor,
        } = classifier.configure_optimizers()?;

        let mut report = FitReport::default();
        info!(
            max_epochs = self.config.max_epochs,
            batches = train.len(),
            "Starting training"
        );

        let device = classifier.device().clone();
        for epoch in 0..self.config.max_epochs {
            if self.steps_exhausted(report.steps) {
                break;
            }
            classifier.log_mut().set_epoch(epoch);
            classifier.train();

            let mut outputs: Vec<StepStats> = Vec::with_capacity(train.len());
            for batch in train.batches_for_epoch(epoch as u64, &device) {
                let batch = batch?;
                let output = classifier.training_step(&batch)?;
                classifier.optimizer_step(optimizer.as_mut(), &output.loss)?;
                outputs.push(output.stats);
                report.steps += 1;
                if self.steps_exhausted(report.steps) {
                    break;
                }
            }
            let train_f1 = classifier.epoch_end(Tag::Train, &outputs);
            let train_loss = classifier.log().last_epoch_value(&Tag::Train.key("loss"));

            if let Some(scheduler) = lr_scheduler.as_mut() {
                let value = monitor
                    .as_deref()
                    .and_then(|key| classifier.log().last_epoch_value(key));
                scheduler.step(value, optimizer.as_mut());
            }
            let learning_rate = optimizer.learning_rate();
            classifier
                .log_mut()
                .log_epoch(&Tag::Train.key("lr"), learning_rate);

            let (val_loss, val_median_f1) = match val {
                Some(loader) => {
                    let f1 = self.evaluate(classifier, loader, Tag::Val)?;
                    (
                        classifier.log().last_epoch_value(&Tag::Val.key("loss")),
                        Some(median(&f1)),
                    )
                }
                None => (None, None),
            };

            let summary = EpochSummary {
                epoch,
                train_loss,
                train_median_f1: median(&train_f1),
                val_loss,
                val_median_f1,
                learning_rate,
            };
            info!(
                epoch,
                train_loss = ?summary.train_loss,
                train_median_f1 = summary.train_median_f1,
                val_median_f1 = ?summary.val_median_f1,
                "Epoch finished"
            );
            report.epochs.push(summary);
        }

        classifier.eval();
        report.final_learning_rate = optimizer.learning_rate();
        Ok(report)
    }

    /// Run test steps over `loader` and return the test median F1
    pub fn test(&self, classifier: &mut SimsClassifier, loader: &CollateLoader) -> Result<f64> {
        let f1 = self.evaluate(classifier, loader, Tag::Test)?;
        Ok(median(&f1))
    }

    fn evaluate(
        &self,
        classifier: &mut SimsClassifier,
        loader: &CollateLoader,
        tag: Tag,
    ) -> Result<Vec<f64>> {
        classifier.eval();
        let device = classifier.device().clone();
        let mut outputs = Vec::with_capacity(loader.len());
        for batch in loader.batches(&device) {
            let batch = batch?;
            let output = match tag {
                Tag::Test => classifier.test_step(&batch)?,
                _ => classifier.validation_step(&batch)?,
            };
            outputs.push(output.stats);
        }
        Ok(classifier.epoch_end(tag, &outputs))
    }
}
