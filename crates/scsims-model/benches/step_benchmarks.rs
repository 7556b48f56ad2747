//! Forward and training-step latency
//!
//! Run with: cargo bench -p scsims-model

use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use scsims_model::prelude::*;
use scsims_model::Batch;

fn batch(rows: usize, genes: usize) -> Batch {
    let features = Tensor::randn(0f32, 1., (rows, genes), &Device::Cpu).unwrap();
    let labels: Vec<u32> = (0..rows as u32).map(|i| i % 8).collect();
    Batch {
        features,
        labels: Some(Tensor::new(labels.as_slice(), &Device::Cpu).unwrap()),
    }
}

/// Inference forward pass over gene panels of increasing width
fn benchmark_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    group.sample_size(30);

    for genes in [500, 2000, 8000] {
        let mut clf = SimsClassifier::new(HyperParams::new(genes, 8)).unwrap();
        clf.eval();
        let input = batch(64, genes);
        group.bench_with_input(BenchmarkId::new("eval", genes), &input, |b, input| {
            b.iter(|| clf.forward(black_box(&input.features)).unwrap())
        });
    }

    group.finish();
}

/// Training step plus optimizer update
fn benchmark_training_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("training_step");
    group.sample_size(20);

    for genes in [500, 2000] {
        let mut clf = SimsClassifier::new(HyperParams::new(genes, 8)).unwrap();
        let mut config = clf.configure_optimizers().unwrap();
        let input = batch(128, genes);
        group.bench_with_input(BenchmarkId::new("step", genes), &input, |b, input| {
            b.iter(|| {
                let output = clf.training_step(black_box(input)).unwrap();
                clf.optimizer_step(config.optimizer.as_mut(), &output.loss)
                    .unwrap();
            })
        });
    }

    group.finish();
}

/// Explanation pass, which adds the mask reduction on top of the forward pass
fn benchmark_explain(c: &mut Criterion) {
    let genes = 2000;
    let mut clf = SimsClassifier::new(HyperParams::new(genes, 8)).unwrap();
    let data: Vec<f32> = (0..256 * genes).map(|v| (v % 13) as f32 / 13.0).collect();
    let dataset = MatrixDataset::new(256, genes, data).unwrap();
    let options = ExplainOptions::default().with_batch_size(64);

    c.bench_function("explain_256x2000", |b| {
        b.iter(|| clf.explain(black_box(&dataset), &options).unwrap())
    });
}

criterion_group!(
    benches,
    benchmark_forward,
    benchmark_training_step,
    benchmark_explain
);
criterion_main!(benches);
