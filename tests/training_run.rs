use std::{collections::BTreeMap, fs, path::Path};

use burn::{
    backend::{Autodiff, NdArray},
    config::Config,
};
use image::{Rgb, RgbImage};
use tempfile::TempDir;
use waste_classifier::{
    artifact::{self, BEST_MODEL_FILE},
    augment::AugmentationConfig,
    labels::WASTE_LABELS,
    train,
    training::{StopReason, CONFIG_FILE, METRICS_FILE},
    unify::UnifiedSource,
    ConfigurationError, DatasetConfig, Error, Evaluator, LabelSpace, Predictor, RunConfig,
    TrainingReport,
};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<TestBackend>;

/// Solid-colour images, one hue per class, with a little per-file variation.
fn write_dataset(root: &Path, per_class: usize) {
    for (label, name) in WASTE_LABELS.iter().enumerate() {
        let folder = root.join(name);
        fs::create_dir_all(&folder).unwrap();
        for i in 0..per_class {
            let base = (label * 40) as u8;
            let pixel = Rgb([base, 255 - base, (i * 10) as u8]);
            RgbImage::from_pixel(30 + i as u32, 26, pixel)
                .save(folder.join(format!("{name}{i}.png")))
                .unwrap();
        }
    }
}

fn quick_config(datasets: Vec<DatasetConfig>) -> RunConfig {
    RunConfig::scratch(datasets)
        .with_img_dim(24)
        .with_batch_size(8)
        .with_validation_fraction(0.25)
        .with_max_epochs(3)
        .with_patience(2)
        .with_hidden_units(16)
        .with_augmentation(AugmentationConfig::disabled())
}

fn run(artifact_dir: &Path, config: RunConfig) -> waste_classifier::Result<TrainingReport> {
    train::<TestAutodiffBackend>(artifact_dir, config, Default::default())
}

fn dataset(dir: &TempDir, name: &str) -> DatasetConfig {
    let root = dir.path().join(name);
    write_dataset(&root, 4);
    DatasetConfig::new(name.to_string(), root)
}

#[test]
fn run_writes_artifact_metrics_and_config() {
    let dir = tempfile::tempdir().unwrap();
    let artifact_dir = dir.path().join("artifact");
    let config = quick_config(vec![dataset(&dir, "trashnet"), dataset(&dir, "garbage")]);

    let report = run(&artifact_dir, config).unwrap();

    assert!(!report.history.is_empty() && report.history.len() <= 3);
    assert_eq!(report.best_epoch, Some(report.improvements().last().unwrap().epoch));

    let losses: Vec<f64> = report.improvements().map(|record| record.val_loss).collect();
    assert!(losses.windows(2).all(|pair| pair[1] < pair[0]));

    let metrics = fs::read_to_string(artifact_dir.join(METRICS_FILE)).unwrap();
    assert_eq!(metrics.lines().count(), report.history.len());

    let saved = RunConfig::load(artifact_dir.join(CONFIG_FILE)).unwrap();
    assert_eq!(saved.datasets.len(), 2);
    assert_eq!(saved.img_dim, 24);

    let metadata = artifact::load_metadata(&artifact_dir.join(BEST_MODEL_FILE)).unwrap();
    assert_eq!(Some(metadata.epoch), report.best_epoch);
    assert!((metadata.val_loss - report.best_val_loss).abs() < 1e-9);
    assert_eq!(metadata.labels, LabelSpace::waste().names());
}

#[test]
fn frozen_weights_stop_after_patience() {
    let dir = tempfile::tempdir().unwrap();
    let artifact_dir = dir.path().join("artifact");
    // updates this small leave every f32 weight untouched, so validation loss is flat
    let config = quick_config(vec![dataset(&dir, "trashnet")])
        .with_learning_rate(1e-30)
        .with_max_epochs(10)
        .with_patience(2);

    let report = run(&artifact_dir, config).unwrap();

    assert_eq!(report.stop_reason, StopReason::NoImprovement);
    assert_eq!(report.history.len(), 3);
    assert_eq!(report.best_epoch, Some(1));
    assert_eq!(report.improvements().count(), 1);
}

#[test]
fn max_epochs_bounds_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = quick_config(vec![dataset(&dir, "trashnet")])
        .with_max_epochs(1)
        .with_patience(5);

    let report = run(&dir.path().join("artifact"), config).unwrap();

    assert_eq!(report.stop_reason, StopReason::MaxEpochs);
    assert_eq!(report.history.len(), 1);
}

#[test]
fn loaded_artifact_predicts_deterministically() {
    let dir = tempfile::tempdir().unwrap();
    let artifact_dir = dir.path().join("artifact");
    let config = quick_config(vec![dataset(&dir, "trashnet")]).with_max_epochs(1);
    run(&artifact_dir, config).unwrap();

    let image = dir.path().join("sample.png");
    RgbImage::from_pixel(320, 240, Rgb([80, 175, 20])).save(&image).unwrap();

    let path = artifact_dir.join(BEST_MODEL_FILE);
    let first = Predictor::<TestBackend>::load(&path, &LabelSpace::waste(), Default::default())
        .unwrap()
        .predict_path(&image)
        .unwrap();
    let second = Predictor::<TestBackend>::load(&path, &LabelSpace::waste(), Default::default())
        .unwrap()
        .predict_path(&image)
        .unwrap();

    assert_eq!(first.label_index, second.label_index);
    assert_eq!(first.confidence, second.confidence);
    assert_eq!(first.probabilities, second.probabilities);
}

#[test]
fn continuing_requires_a_matching_architecture() {
    let dir = tempfile::tempdir().unwrap();
    let first_dir = dir.path().join("first");
    let datasets = vec![dataset(&dir, "trashnet")];
    run(&first_dir, quick_config(datasets.clone()).with_max_epochs(1)).unwrap();

    let resumed = quick_config(datasets.clone())
        .with_max_epochs(1)
        .with_init_from(Some(first_dir.join(BEST_MODEL_FILE)));
    assert!(run(&dir.path().join("second"), resumed).is_ok());

    let mismatched = quick_config(datasets)
        .with_img_dim(32)
        .with_max_epochs(1)
        .with_init_from(Some(first_dir.join(BEST_MODEL_FILE)));
    let err = run(&dir.path().join("third"), mismatched).unwrap_err();
    assert!(matches!(err, Error::Artifact(_)));
}

#[test]
fn transfer_at_scratch_resolution_is_rejected_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig::transfer(vec![dataset(&dir, "trashnet")]).with_img_dim(100);

    let err = run(&dir.path().join("artifact"), config).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(!dir.path().join("artifact").join(BEST_MODEL_FILE).exists());
}

#[test]
fn transfer_without_backbone_weights_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig::transfer(vec![dataset(&dir, "trashnet")]);

    let err = run(&dir.path().join("artifact"), config).unwrap_err();
    assert!(matches!(
        err,
        Error::Configuration(ConfigurationError::InvalidValue {
            field: "backbone_weights",
            ..
        })
    ));
    assert!(!dir.path().join("artifact").join(BEST_MODEL_FILE).exists());
}

#[test]
fn evaluation_reuses_the_saved_run_config() {
    let dir = tempfile::tempdir().unwrap();
    let artifact_dir = dir.path().join("artifact");

    let mut taco = dataset(&dir, "taco");
    fs::rename(taco.root.join("plastic"), taco.root.join("bottle")).unwrap();
    taco.aliases = BTreeMap::from([("bottle".to_string(), "plastic".to_string())]);
    run(&artifact_dir, quick_config(vec![taco]).with_max_epochs(1)).unwrap();

    let labels = LabelSpace::waste();
    let config = RunConfig::load(artifact_dir.join(CONFIG_FILE)).unwrap();
    let evaluator = Evaluator::<TestBackend>::load(
        &artifact_dir.join(BEST_MODEL_FILE),
        &labels,
        Default::default(),
    )
    .unwrap();

    let options = config.evaluation_options(evaluator.metadata().img_dim);
    let source = UnifiedSource::open(&config.datasets, &labels, options).unwrap();
    let report = evaluator.evaluate(&source, None).unwrap();

    // one held-out image per class, the renamed folder included
    assert_eq!(report.samples, 6);
    assert!(report.per_class.iter().all(|class| class.samples == 1));
}
