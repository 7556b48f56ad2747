//! Classification loss

use candle_core::{DType, Result, Tensor, D};
use std::fmt::Debug;

/// Supervised loss term of the training objective.
///
/// `weights`, when present, holds one weight per class.
pub trait LossFn: Send + Sync + Debug {
    fn compute(&self, logits: &Tensor, targets: &Tensor, weights: Option<&Tensor>)
        -> Result<Tensor>;

    /// Name used in logs and warnings
    fn name(&self) -> &str;
}

/// Cross-entropy over logits, optionally class-weighted.
///
/// With weights the loss is `sum(w[y_i] * nll_i) / sum(w[y_i])`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl LossFn for CrossEntropy {
    fn compute(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        weights: Option<&Tensor>,
    ) -> Result<Tensor> {
        let targets = targets.to_dtype(DType::U32)?;
        let Some(weights) = weights else {
            return candle_nn::loss::cross_entropy(logits, &targets);
        };

        let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
        let nll = log_probs
            .gather(&targets.unsqueeze(1)?, 1)?
            .squeeze(1)?
            .neg()?;
        let sample_weights = weights.to_dtype(logits.dtype())?.index_select(&targets, 0)?;
        let total = (&nll * &sample_weights)?.sum_all()?;
        total.broadcast_div(&sample_weights.sum_all()?)
    }

    fn name(&self) -> &str {
        "cross_entropy"
    }
}
