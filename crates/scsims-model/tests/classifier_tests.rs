//! End-to-end tests for training, explanation and prediction

use candle_core::{DType, Device, Tensor};
use scsims_model::optim::{LrScheduler, StepDecay};
use scsims_model::prelude::*;
use scsims_model::{CrossEntropy, LabelValue, LossFn, OptimizerSpec, SchedulerFactory, SchedulerSpec};
use std::sync::Arc;

/// 10 cells x 5 genes, three roughly balanced classes with a visible signal
fn synthetic() -> (MatrixDataset, LabelEncoder) {
    let labels = [
        "alpha", "beta", "gamma", "alpha", "beta", "gamma", "alpha", "beta", "gamma", "alpha",
    ];
    let encoder = LabelEncoder::fit(&labels);
    let encoded = encoder.transform(&labels).unwrap();

    let mut rows = Vec::new();
    for (i, &class) in encoded.iter().enumerate() {
        let mut row = vec![0.1 * (i % 4) as f32; 5];
        row[class as usize] += 3.0;
        rows.push(row);
    }
    let dataset = MatrixDataset::from_rows(&rows)
        .unwrap()
        .with_labels(encoded)
        .unwrap();
    (dataset, encoder)
}

fn small_params() -> HyperParams {
    HyperParams::new(5, 3).with_virtual_batch_size(4)
}

fn trained() -> (SimsClassifier, MatrixDataset, LabelEncoder) {
    let (dataset, encoder) = synthetic();
    let mut clf = SimsClassifier::new(small_params()).unwrap();
    let loader = CollateLoader::new(
        dataset.clone(),
        LoaderConfig::default().with_batch_size(5).with_shuffle(3),
    )
    .unwrap();
    Trainer::new(TrainerConfig {
        max_epochs: 4,
        max_steps: Some(8),
    })
    .fit(&mut clf, &loader, None)
    .unwrap();
    (clf, dataset, encoder)
}

#[test]
fn test_train_then_predict_indices() {
    let (mut clf, dataset, _) = trained();
    let frame = clf
        .predict(&dataset, &PredictOptions::default(), None)
        .unwrap();

    assert_eq!(frame.len(), 10);
    assert_eq!(
        frame.columns(),
        vec!["first_prob", "second_prob", "third_prob", "actual_label"]
    );
    for row in &frame.rows {
        for value in [
            Some(&row.first_prob),
            row.second_prob.as_ref(),
            row.third_prob.as_ref(),
        ] {
            match value {
                Some(LabelValue::Index(i)) => assert!(*i < 3),
                other => panic!("unexpected prediction cell {:?}", other),
            }
        }
        assert!(row.actual_label.is_some());
    }
}

#[test]
fn test_predict_with_decoder_and_rows() {
    let (mut clf, dataset, encoder) = trained();
    let frame = clf
        .predict(
            &dataset,
            &PredictOptions::default().with_rows(vec![0, 2, 4]),
            Some(&encoder),
        )
        .unwrap();

    assert_eq!(frame.len(), 3);
    for row in &frame.rows {
        match &row.first_prob {
            LabelValue::Name(name) => assert!(encoder.classes().contains(name)),
            other => panic!("expected a decoded label, got {:?}", other),
        }
    }
}

#[test]
fn test_predict_restores_train_mode() {
    let (dataset, _) = synthetic();
    let mut clf = SimsClassifier::new(small_params()).unwrap();
    clf.train();
    clf.predict(&dataset, &PredictOptions::default(), None)
        .unwrap();
    assert!(clf.is_training());
}

#[test]
fn test_normalized_explanation_rows() {
    let (mut clf, dataset, _) = trained();
    let explanation = clf
        .explain(&dataset, &ExplainOptions::default().normalized())
        .unwrap();

    assert_eq!(explanation.matrix.dims(), &[10, 5]);
    assert_eq!(explanation.masks.len(), clf.hparams().n_steps);
    assert_eq!(explanation.labels.as_ref().map(Vec::len), Some(10));

    for row in explanation.matrix.to_vec2::<f32>().unwrap() {
        let sum: f32 = row.iter().sum();
        assert!(sum == 0.0 || (sum - 1.0).abs() < 1e-4, "row sum {}", sum);
    }
}

#[test]
fn test_explain_cache_is_reused() {
    let (mut clf, dataset, _) = trained();
    let options = ExplainOptions::default().cached();
    let first = clf.explain(&dataset, &options).unwrap();

    // a different row subset still hits the cache
    let second = clf
        .explain(&dataset, &options.clone().with_rows(vec![0]))
        .unwrap();
    assert_eq!(second.matrix.dims(), first.matrix.dims());
}

#[test]
fn test_feature_importances_sum_to_one() {
    let (mut clf, dataset, _) = trained();
    let importances = clf
        .feature_importances(&dataset, &ExplainOptions::default().cached())
        .unwrap();

    assert_eq!(importances.len(), 5);
    let total: f32 = importances.iter().sum();
    assert!((total - 1.0).abs() < 1e-4);
    assert!(importances.iter().all(|&v| v >= 0.0));
    assert_eq!(clf.importance_cache(), Some(importances.as_slice()));
}

#[test]
fn test_confusion_matrix_counts_every_row() {
    let (mut clf, dataset, _) = trained();
    let loader = CollateLoader::new(dataset, LoaderConfig::default()).unwrap();
    let matrix = clf.confusion_matrix(&loader).unwrap();
    assert_eq!(matrix.num_classes(), 3);
    assert_eq!(matrix.total(), 10);
    // row sums are the class supports 4, 3, 3
    let supports: Vec<u64> = matrix.counts().iter().map(|r| r.iter().sum()).collect();
    assert_eq!(supports, vec![4, 3, 3]);
}

#[test]
fn test_configure_optimizers_twice() {
    let (dataset, _) = synthetic();
    let mut clf = SimsClassifier::new(small_params()).unwrap();
    let mut first = clf.configure_optimizers().unwrap();
    let mut second = clf.configure_optimizers().unwrap();

    assert_eq!(first.monitor.as_deref(), Some("train_loss"));
    assert_eq!(
        first.optimizer.learning_rate(),
        second.optimizer.learning_rate()
    );

    let loader = CollateLoader::new(dataset, LoaderConfig::default()).unwrap();
    let batch = loader.batches(&Device::Cpu).next().unwrap().unwrap();
    for config in [&mut first, &mut second] {
        let output = clf.training_step(&batch).unwrap();
        clf.optimizer_step(config.optimizer.as_mut(), &output.loss)
            .unwrap();
    }

    // stored settings are untouched
    assert_eq!(clf.hparams().optim_params, OptimizerSpec::default());
}

#[test]
fn test_weighted_loss_and_sparsity_term() {
    let params = small_params()
        .with_weights(vec![1.0, 2.0, 0.5])
        .with_lambda_sparse(0.0);
    let clf = SimsClassifier::new(params).unwrap();

    let xs = Tensor::randn(0f32, 1., (6, 5), &Device::Cpu).unwrap();
    let targets = Tensor::new(&[0u32, 1, 2, 0, 1, 2], &Device::Cpu).unwrap();
    let (logits, sparsity) = clf.forward(&xs).unwrap();

    let total = clf
        .compute_loss(&logits, &targets, &sparsity)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    let weights = Tensor::new(&[1f32, 2.0, 0.5], &Device::Cpu).unwrap();
    let expected = CrossEntropy
        .compute(&logits, &targets, Some(&weights))
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!((total - expected).abs() < 1e-6);
}

#[derive(Debug)]
struct ScaledLoss(f64);

impl LossFn for ScaledLoss {
    fn compute(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        weights: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        CrossEntropy.compute(logits, targets, weights)? * self.0
    }

    fn name(&self) -> &str {
        "scaled"
    }
}

#[test]
fn test_custom_loss_and_scheduler_factory() {
    let factory: SchedulerFactory = Arc::new(|spec: Option<&SchedulerSpec>| {
        assert!(spec.is_some());
        Ok(Box::new(StepDecay::new(1, 0.5)) as Box<dyn LrScheduler>)
    });
    let mut clf = SimsClassifier::new(small_params())
        .unwrap()
        .with_loss(Arc::new(ScaledLoss(2.0)))
        .with_scheduler_factory(factory);

    let (dataset, _) = synthetic();
    let loader = CollateLoader::new(dataset, LoaderConfig::default()).unwrap();
    let report = Trainer::new(TrainerConfig {
        max_epochs: 2,
        max_steps: None,
    })
    .fit(&mut clf, &loader, None)
    .unwrap();

    assert!((report.final_learning_rate - 1e-3 * 0.25).abs() < 1e-12);
    assert_eq!(clf.unserializable_params(), vec!["loss", "scheduler"]);
}

#[test]
fn test_gene_alignment_in_predict() {
    let (dataset, _) = synthetic();
    let genes: Vec<String> = ["g0", "g1", "g2", "g3", "g4"].iter().map(|g| g.to_string()).collect();
    let mut clf = SimsClassifier::new(small_params()).unwrap();

    // dataset columns reversed relative to the training panel, one gene missing
    let reordered: Vec<String> = vec!["g4", "g3", "gX", "g1", "g0"]
        .into_iter()
        .map(String::from)
        .collect();
    let alignment = GeneAlignment::new(reordered, genes);
    let frame = clf
        .predict(
            &dataset,
            &PredictOptions::default().with_alignment(Some(alignment)),
            None,
        )
        .unwrap();
    assert_eq!(frame.len(), 10);

    let bad = GeneAlignment::new(
        (0..5).map(|i| format!("x{}", i)).collect(),
        (0..5).map(|i| format!("g{}", i)).collect(),
    );
    assert!(clf
        .predict(&dataset, &PredictOptions::default().with_alignment(Some(bad)), None)
        .is_err());
}

#[test]
fn test_zero_batch_forward_is_finite() {
    let mut clf = SimsClassifier::new(small_params()).unwrap();
    clf.eval();
    let zeros = Tensor::zeros((3, 5), DType::F32, &Device::Cpu).unwrap();
    let (logits, _) = clf.forward(&zeros).unwrap();
    let values = logits.to_vec2::<f32>().unwrap();
    assert!(values.iter().flatten().all(|v| v.is_finite()));
}
