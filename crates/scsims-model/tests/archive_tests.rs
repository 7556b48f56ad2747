//! Save/load round trips through model archives

use candle_core::{DType, Device, Tensor};
use scsims_model::archive::{PARAMS_FILE, WEIGHTS_FILE};
use scsims_model::prelude::*;
use scsims_model::{CatEmbDim, ClassAttrs, MaskType};
use std::fs::File;
use std::io::Write;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

fn logits(clf: &SimsClassifier, xs: &Tensor) -> Vec<Vec<f32>> {
    clf.forward(xs).unwrap().0.to_vec2::<f32>().unwrap()
}

fn assert_close(a: &[Vec<f32>], b: &[Vec<f32>]) {
    for (ra, rb) in a.iter().zip(b) {
        for (x, y) in ra.iter().zip(rb) {
            assert!((x - y).abs() < 1e-5, "{} != {}", x, y);
        }
    }
}

#[test]
fn test_untrained_round_trip_on_zero_batch() {
    let dir = TempDir::new().unwrap();
    let mut clf = SimsClassifier::new(HyperParams::new(6, 4)).unwrap();
    clf.eval();
    let zeros = Tensor::zeros((2, 6), DType::F32, &Device::Cpu).unwrap();
    let before = logits(&clf, &zeros);

    let archive = clf.save_model(dir.path().join("untrained")).unwrap();
    assert_eq!(archive, dir.path().join("untrained.zip"));

    let loaded = SimsClassifier::load(&archive, &Device::Cpu).unwrap();
    assert!(!loaded.is_training());
    assert_close(&before, &logits(&loaded, &zeros));
}

#[test]
fn test_trained_round_trip_keeps_running_stats() {
    let dir = TempDir::new().unwrap();
    let params = HyperParams::new(4, 3)
        .with_categorical(vec![3], vec![5], CatEmbDim::Single(2))
        .with_mask_type(MaskType::Entmax)
        .with_virtual_batch_size(4);
    let mut clf = SimsClassifier::new(params).unwrap();

    let rows: Vec<Vec<f32>> = (0..12)
        .map(|i| vec![i as f32 * 0.3, 1.0 - i as f32 * 0.1, (i % 3) as f32, (i % 5) as f32])
        .collect();
    let dataset = MatrixDataset::from_rows(&rows)
        .unwrap()
        .with_labels((0..12).map(|i| (i % 3) as u32).collect())
        .unwrap();
    let loader = CollateLoader::new(dataset, LoaderConfig::default().with_batch_size(6)).unwrap();
    Trainer::new(TrainerConfig {
        max_epochs: 3,
        max_steps: None,
    })
    .fit(&mut clf, &loader, None)
    .unwrap();

    clf.class_attrs = ClassAttrs {
        preds_mapper: Some(LabelEncoder::fit(&["a", "b", "c"]).to_mapper()),
        refgenes: Some(vec!["g0".into(), "g1".into(), "g2".into(), "g3".into()]),
    };

    let batch = Tensor::new(&[[0.5f32, 0.2, 1.0, 4.0], [2.0, -1.0, 0.0, 1.0]], &Device::Cpu)
        .unwrap();
    let before = logits(&clf, &batch);
    let archive = clf.save_model(dir.path().join("trained")).unwrap();

    let mut other = SimsClassifier::new(HyperParams::new(2, 2)).unwrap();
    other.load_model(&archive).unwrap();
    assert_eq!(other.hparams().input_dim, 4);
    assert_eq!(other.class_attrs, clf.class_attrs);
    assert_close(&before, &logits(&other, &batch));
}

#[test]
fn test_archive_without_weights_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("params_only.zip");
    let mut zip = ZipWriter::new(File::create(&path).unwrap());
    zip.start_file(PARAMS_FILE, SimpleFileOptions::default())
        .unwrap();
    zip.write_all(br#"{"init_params": {"input_dim": 3, "output_dim": 2}, "class_attrs": {}}"#)
        .unwrap();
    zip.finish().unwrap();

    let err = SimsClassifier::load(&path, &Device::Cpu).unwrap_err();
    assert!(err.is_archive(), "unexpected error {}", err);
}

#[test]
fn test_archive_without_params_fails() {
    let dir = TempDir::new().unwrap();
    let clf = SimsClassifier::new(HyperParams::new(3, 2)).unwrap();
    let saved = clf.save_model(dir.path().join("full")).unwrap();
    let weights = {
        let mut zip = zip::ZipArchive::new(File::open(&saved).unwrap()).unwrap();
        let mut member = zip.by_name(WEIGHTS_FILE).unwrap();
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut member, &mut bytes).unwrap();
        bytes
    };

    let path = dir.path().join("weights_only.zip");
    let mut zip = ZipWriter::new(File::create(&path).unwrap());
    zip.start_file(WEIGHTS_FILE, SimpleFileOptions::default())
        .unwrap();
    zip.write_all(&weights).unwrap();
    zip.finish().unwrap();

    let err = SimsClassifier::load(&path, &Device::Cpu).unwrap_err();
    assert!(err.is_archive(), "unexpected error {}", err);
    assert!(err.to_string().contains(PARAMS_FILE));
}

#[test]
fn test_archive_with_mismatched_weights_fails() {
    let dir = TempDir::new().unwrap();
    let small = SimsClassifier::new(HyperParams::new(3, 2)).unwrap();
    let archive = small.save_model(dir.path().join("small")).unwrap();

    // rewrite the params so they describe a wider network than the weights
    let wide = serde_json::json!({
        "init_params": HyperParams::new(7, 2),
        "class_attrs": {},
    });
    let weights = {
        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut member = zip.by_name(WEIGHTS_FILE).unwrap();
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut member, &mut bytes).unwrap();
        bytes
    };
    let path = dir.path().join("mismatched.zip");
    let mut zip = ZipWriter::new(File::create(&path).unwrap());
    zip.start_file(PARAMS_FILE, SimpleFileOptions::default())
        .unwrap();
    zip.write_all(wide.to_string().as_bytes()).unwrap();
    zip.start_file(WEIGHTS_FILE, SimpleFileOptions::default())
        .unwrap();
    zip.write_all(&weights).unwrap();
    zip.finish().unwrap();

    assert!(SimsClassifier::load(&path, &Device::Cpu).is_err());
}
