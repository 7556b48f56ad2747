//! Classification metrics
//!
//! Two layers live here. [`StepStats`] carries the raw per-class tp/fp/fn counts
//! that are summed across an epoch and reduced to a median F1. [`MetricSet`] is
//! the dictionary of batch-level scores (accuracy, precision, AUROC, ...) logged
//! on every step.

use candle_core::{Result, Tensor, D};
use std::fmt::Debug;

/// Per-class true positive, false positive and false negative counts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepStats {
    pub tp: Vec<u64>,
    pub fp: Vec<u64>,
    pub fn_: Vec<u64>,
}

impl StepStats {
    pub fn zeros(num_classes: usize) -> Self {
        Self {
            tp: vec![0; num_classes],
            fp: vec![0; num_classes],
            fn_: vec![0; num_classes],
        }
    }

    /// Classes covered by all three count vectors
    pub fn num_classes(&self) -> usize {
        self.tp.len().min(self.fp.len()).min(self.fn_.len())
    }

    /// Count predictions against targets. Indices outside `num_classes` are ignored.
    pub fn from_predictions(preds: &[u32], targets: &[u32], num_classes: usize) -> Self {
        let mut stats = Self::zeros(num_classes);
        for (&pred, &target) in preds.iter().zip(targets) {
            let (pred, target) = (pred as usize, target as usize);
            if pred >= num_classes || target >= num_classes {
                continue;
            }
            if pred == target {
                stats.tp[pred] += 1;
            } else {
                stats.fp[pred] += 1;
                stats.fn_[target] += 1;
            }
        }
        stats
    }

    /// Add another batch's counts into this one
    pub fn accumulate(&mut self, other: &StepStats) {
        let n = other.num_classes();
        for counts in [&mut self.tp, &mut self.fp, &mut self.fn_] {
            if counts.len() < n {
                counts.resize(n, 0);
            }
        }
        for c in 0..n {
            self.tp[c] += other.tp[c];
            self.fp[c] += other.fp[c];
            self.fn_[c] += other.fn_[c];
        }
    }

    /// Sum a sequence of step counts
    pub fn sum<'a>(steps: impl IntoIterator<Item = &'a StepStats>) -> StepStats {
        let mut total = StepStats::default();
        for step in steps {
            total.accumulate(step);
        }
        total
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    let r = num / den;
    if r.is_finite() {
        r
    } else {
        0.0
    }
}

/// Per-class F1 from summed counts; undefined ratios become 0
pub fn per_class_f1(stats: &StepStats) -> Vec<f64> {
    (0..stats.num_classes())
        .map(|c| {
            let tp = stats.tp[c] as f64;
            let precision = ratio(tp, tp + stats.fp[c] as f64);
            let recall = ratio(tp, tp + stats.fn_[c] as f64);
            ratio(2.0 * precision * recall, precision + recall)
        })
        .collect()
}

/// Median, averaging the two middle values for even lengths. Empty input gives 0.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Median per-class F1 over summed counts
pub fn median_f1(stats: &StepStats) -> f64 {
    median(&per_class_f1(stats))
}

/// `[true][pred]` count matrix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn update(&mut self, preds: &[u32], targets: &[u32]) {
        let n = self.num_classes();
        for (&pred, &target) in preds.iter().zip(targets) {
            if (pred as usize) < n && (target as usize) < n {
                self.counts[target as usize][pred as usize] += 1;
            }
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> u64 {
        self.counts[actual][predicted]
    }

    pub fn counts(&self) -> &[Vec<u64>] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    fn class_counts(&self, c: usize) -> ClassCounts {
        let tp = self.counts[c][c];
        let fp = (0..self.num_classes()).map(|t| self.counts[t][c]).sum::<u64>() - tp;
        let fn_ = self.counts[c].iter().sum::<u64>() - tp;
        let tn = self.total() - tp - fp - fn_;
        ClassCounts { tp, fp, fn_, tn }
    }
}

#[derive(Debug, Clone, Copy)]
struct ClassCounts {
    tp: u64,
    fp: u64,
    fn_: u64,
    tn: u64,
}

impl ClassCounts {
    fn present(&self) -> bool {
        self.tp + self.fp + self.fn_ > 0
    }
}

/// Host-side view of one batch, shared by every metric
#[derive(Debug, Clone)]
pub struct BatchPredictions {
    /// Row-major `(n, num_classes)` softmax probabilities
    pub probs: Vec<Vec<f32>>,
    pub preds: Vec<u32>,
    pub targets: Vec<u32>,
    pub confusion: ConfusionMatrix,
}

impl BatchPredictions {
    /// Softmax and argmax the logits, then pull everything to the host
    pub fn from_logits(logits: &Tensor, targets: &Tensor) -> Result<Self> {
        let num_classes = logits.dim(D::Minus1)?;
        let probs = candle_nn::ops::softmax_last_dim(&logits.detach().contiguous()?)?;
        let preds = probs.argmax(D::Minus1)?.to_vec1::<u32>()?;
        let targets = targets
            .detach()
            .to_dtype(candle_core::DType::U32)?
            .to_vec1::<u32>()?;
        let mut confusion = ConfusionMatrix::new(num_classes);
        confusion.update(&preds, &targets);
        Ok(Self {
            probs: probs.to_vec2::<f32>()?,
            preds,
            targets,
            confusion,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.confusion.num_classes()
    }

    pub fn step_stats(&self) -> StepStats {
        StepStats::from_predictions(&self.preds, &self.targets, self.num_classes())
    }
}

/// A named batch-level classification score
pub trait ClassificationMetric: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn compute(&self, batch: &BatchPredictions) -> f64;
}

/// Built-in metrics, macro variants averaged over classes seen in the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinMetric {
    MicroAccuracy,
    MacroAccuracy,
    WeightedAccuracy,
    Precision,
    Recall,
    F1,
    Specificity,
    Auroc,
}

impl BuiltinMetric {
    pub const ALL: [BuiltinMetric; 8] = [
        Self::MicroAccuracy,
        Self::MacroAccuracy,
        Self::WeightedAccuracy,
        Self::Precision,
        Self::Recall,
        Self::F1,
        Self::Specificity,
        Self::Auroc,
    ];
}

fn macro_average(confusion: &ConfusionMatrix, score: impl Fn(&ClassCounts) -> f64) -> f64 {
    let scores: Vec<f64> = (0..confusion.num_classes())
        .map(|c| confusion.class_counts(c))
        .filter(ClassCounts::present)
        .map(|counts| score(&counts))
        .collect();
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

fn recall(c: &ClassCounts) -> f64 {
    ratio(c.tp as f64, (c.tp + c.fn_) as f64)
}

fn precision(c: &ClassCounts) -> f64 {
    ratio(c.tp as f64, (c.tp + c.fp) as f64)
}

/// Rank-based one-vs-rest AUROC; `None` when the class has no positives or no negatives
fn binary_auroc(scores: &[f32], positive: &[bool]) -> Option<f64> {
    let n_pos = positive.iter().filter(|&&p| p).count();
    let n_neg = positive.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0f64; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // tied scores share the average of their 1-based ranks
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = ranks
        .iter()
        .zip(positive)
        .filter(|(_, p)| **p)
        .map(|(r, _)| r)
        .sum();
    let n_pos = n_pos as f64;
    Some((pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64))
}

impl ClassificationMetric for BuiltinMetric {
    fn name(&self) -> &str {
        match self {
            Self::MicroAccuracy => "micro_accuracy",
            Self::MacroAccuracy => "macro_accuracy",
            Self::WeightedAccuracy => "weighted_accuracy",
            Self::Precision => "precision",
            Self::Recall => "recall",
            Self::F1 => "f1",
            Self::Specificity => "specificity",
            Self::Auroc => "auroc",
        }
    }

    fn compute(&self, batch: &BatchPredictions) -> f64 {
        let confusion = &batch.confusion;
        match self {
            Self::MicroAccuracy => {
                let correct: u64 = (0..confusion.num_classes()).map(|c| confusion.get(c, c)).sum();
                ratio(correct as f64, confusion.total() as f64)
            }
            Self::MacroAccuracy | Self::Recall => macro_average(confusion, recall),
            Self::WeightedAccuracy => {
                let (weighted, support) = (0..confusion.num_classes())
                    .map(|c| confusion.class_counts(c))
                    .fold((0.0, 0.0), |(w, s), counts| {
                        let support = (counts.tp + counts.fn_) as f64;
                        (w + recall(&counts) * support, s + support)
                    });
                ratio(weighted, support)
            }
            Self::Precision => macro_average(confusion, precision),
            Self::F1 => macro_average(confusion, |c| {
                let (p, r) = (precision(c), recall(c));
                ratio(2.0 * p * r, p + r)
            }),
            Self::Specificity => {
                macro_average(confusion, |c| ratio(c.tn as f64, (c.tn + c.fp) as f64))
            }
            Self::Auroc => {
                let aucs: Vec<f64> = (0..batch.num_classes())
                    .filter_map(|c| {
                        let scores: Vec<f32> = batch.probs.iter().map(|row| row[c]).collect();
                        let positive: Vec<bool> =
                            batch.targets.iter().map(|&t| t as usize == c).collect();
                        binary_auroc(&scores, &positive)
                    })
                    .collect();
                if aucs.is_empty() {
                    0.0
                } else {
                    aucs.iter().sum::<f64>() / aucs.len() as f64
                }
            }
        }
    }
}

/// Named collection of metrics logged on every step
#[derive(Debug, Default)]
pub struct MetricSet {
    metrics: Vec<Box<dyn ClassificationMetric>>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metric(mut self, metric: impl ClassificationMetric + 'static) -> Self {
        self.metrics.push(Box::new(metric));
        self
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.metrics.iter().map(|m| m.name()).collect()
    }

    /// Score one batch with every metric, in insertion order
    pub fn compute(&self, batch: &BatchPredictions) -> Vec<(String, f64)> {
        self.metrics
            .iter()
            .map(|m| (m.name().to_string(), m.compute(batch)))
            .collect()
    }
}

/// The default metric dictionary for a `num_classes`-way problem
pub fn aggregate_metrics(num_classes: usize) -> MetricSet {
    tracing::debug!(num_classes, "Building default metric set");
    BuiltinMetric::ALL
        .into_iter()
        .fold(MetricSet::new(), |set, metric| set.with_metric(metric))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use proptest::prelude::*;

    fn batch(probs: Vec<Vec<f32>>, targets: Vec<u32>) -> BatchPredictions {
        let n = probs.len();
        let c = probs[0].len();
        let flat: Vec<f32> = probs.into_iter().flatten().collect();
        let logits = Tensor::from_vec(flat, (n, c), &Device::Cpu).unwrap().log().unwrap();
        let targets = Tensor::new(targets.as_slice(), &Device::Cpu).unwrap();
        BatchPredictions::from_logits(&logits, &targets).unwrap()
    }

    #[test]
    fn test_step_stats_counts() {
        let stats = StepStats::from_predictions(&[0, 1, 1, 2], &[0, 1, 2, 2], 3);
        assert_eq!(stats.tp, vec![1, 1, 1]);
        assert_eq!(stats.fp, vec![0, 1, 0]);
        assert_eq!(stats.fn_, vec![0, 0, 1]);
    }

    #[test]
    fn test_sum_then_ratio() {
        // class 0: batch A has tp=1 fp=0, batch B has tp=0 fp=3
        let a = StepStats {
            tp: vec![1],
            fp: vec![0],
            fn_: vec![0],
        };
        let b = StepStats {
            tp: vec![0],
            fp: vec![3],
            fn_: vec![0],
        };
        let total = StepStats::sum([&a, &b]);
        let f1 = per_class_f1(&total)[0];
        // precision 1/4, recall 1 => 2 * 0.25 / 1.25
        assert!((f1 - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_undefined_classes_score_zero() {
        let stats = StepStats {
            tp: vec![0, 0, 5],
            fp: vec![0, 2, 0],
            fn_: vec![3, 0, 0],
        };
        assert_eq!(per_class_f1(&stats), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_ragged_counts_do_not_panic() {
        let ragged = StepStats {
            tp: vec![2, 1, 4],
            fp: vec![0],
            fn_: vec![1, 1],
        };
        assert_eq!(ragged.num_classes(), 1);
        assert_eq!(per_class_f1(&ragged).len(), 1);

        let total = StepStats::sum([&StepStats::zeros(3), &ragged]);
        assert_eq!(total.num_classes(), 3);
        assert_eq!(total.tp, vec![2, 0, 0]);
        assert_eq!(per_class_f1(&total).len(), 3);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), 0.0);
        assert_eq!(median(&[0.3]), 0.3);
        assert_eq!(median(&[0.9, 0.1, 0.5]), 0.5);
        assert!((median(&[0.1, 0.9, 0.4, 0.6]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_confusion_matrix() {
        let mut cm = ConfusionMatrix::new(3);
        cm.update(&[0, 1, 1, 2], &[0, 1, 2, 2]);
        assert_eq!(cm.get(2, 1), 1);
        assert_eq!(cm.get(2, 2), 1);
        assert_eq!(cm.total(), 4);
    }

    #[test]
    fn test_builtin_metrics_perfect_batch() {
        let b = batch(
            vec![vec![0.8, 0.1, 0.1], vec![0.1, 0.8, 0.1], vec![0.1, 0.1, 0.8]],
            vec![0, 1, 2],
        );
        for metric in BuiltinMetric::ALL {
            let value = metric.compute(&b);
            assert!((value - 1.0).abs() < 1e-9, "{} = {}", metric.name(), value);
        }
    }

    #[test]
    fn test_micro_and_macro_accuracy() {
        // every row predicted as class 0; one class 1 sample is missed
        let b = batch(
            vec![
                vec![0.9, 0.1],
                vec![0.9, 0.1],
                vec![0.9, 0.1],
                vec![0.9, 0.1],
            ],
            vec![0, 0, 0, 1],
        );
        assert!((BuiltinMetric::MicroAccuracy.compute(&b) - 0.75).abs() < 1e-9);
        // class 0 recall 1, class 1 recall 0
        assert!((BuiltinMetric::MacroAccuracy.compute(&b) - 0.5).abs() < 1e-9);
        assert!((BuiltinMetric::WeightedAccuracy.compute(&b) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_auroc_ties() {
        let scores = [0.5f32, 0.5, 0.5, 0.5];
        let positive = [true, false, true, false];
        assert_eq!(binary_auroc(&scores, &positive), Some(0.5));
        assert_eq!(binary_auroc(&scores, &[true; 4]), None);
    }

    #[test]
    fn test_aggregate_metric_names() {
        let set = aggregate_metrics(4);
        assert_eq!(
            set.names(),
            vec![
                "micro_accuracy",
                "macro_accuracy",
                "weighted_accuracy",
                "precision",
                "recall",
                "f1",
                "specificity",
                "auroc"
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_median_f1_permutation_invariant(
            counts in prop::collection::vec((0u64..50, 0u64..50, 0u64..50), 1..12),
            rotate in 0usize..12,
        ) {
            let stats = StepStats {
                tp: counts.iter().map(|c| c.0).collect(),
                fp: counts.iter().map(|c| c.1).collect(),
                fn_: counts.iter().map(|c| c.2).collect(),
            };
            let mut rotated = counts.clone();
            rotated.rotate_left(rotate % counts.len());
            let permuted = StepStats {
                tp: rotated.iter().map(|c| c.0).collect(),
                fp: rotated.iter().map(|c| c.1).collect(),
                fn_: rotated.iter().map(|c| c.2).collect(),
            };
            prop_assert!((median_f1(&stats) - median_f1(&permuted)).abs() < 1e-12);
        }

        #[test]
        fn prop_f1_in_unit_interval(
            counts in prop::collection::vec((0u64..50, 0u64..50, 0u64..50), 1..12),
        ) {
            let stats = StepStats {
                tp: counts.iter().map(|c| c.0).collect(),
                fp: counts.iter().map(|c| c.1).collect(),
                fn_: counts.iter().map(|c| c.2).collect(),
            };
            for f1 in per_class_f1(&stats) {
                prop_assert!((0.0..=1.0).contains(&f1));
            }
            for (c, f1) in per_class_f1(&stats).into_iter().enumerate() {
                if stats.tp[c] == 0 {
                    prop_assert_eq!(f1, 0.0);
                }
            }
        }
    }
}
