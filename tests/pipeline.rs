//! 学習 → 変換 → 分類の一連の流れ（CPUバックエンド・縮小モデル）

#![recursion_limit = "256"]

mod common;

use common::{small_config, write_dataset, CLASSES};
use freshness_lib::backend::classify_with_float_model;
use freshness_lib::ml::dataset::ScannedDataset;
use freshness_lib::model::load_metadata;
use freshness_lib::quant::{DType, QuantizedClassifier, QuantizedModel};
use freshness_lib::{run_conversion, run_training, ClassIndex, FreshnessError};

#[test]
fn train_convert_and_classify() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    write_dataset(&config.paths.dataset_dir, 4);

    // === 学習 ===
    let mut reports = Vec::new();
    let training = run_training(&config, |r| reports.push(r.clone())).unwrap();
    assert_eq!(reports.len(), 2);
    assert!(training.model_path.exists());
    assert!(training.class_index_path.exists());

    let metadata = load_metadata(&training.model_path).unwrap();
    assert_eq!(metadata.model.num_classes, CLASSES.len());
    assert_eq!(metadata.class_labels, CLASSES.to_vec());
    assert_eq!(metadata.num_train_samples, 6);
    assert_eq!(metadata.num_val_samples, 2);
    assert_eq!(metadata.phases.len(), 2);

    // クラスインデックスはディレクトリ名と 0..n の全単射
    let index = ClassIndex::load(&training.class_index_path).unwrap();
    let scanned = ScannedDataset::scan(&config.paths.dataset_dir).unwrap();
    assert_eq!(index, scanned.class_index);
    for (i, class) in CLASSES.iter().enumerate() {
        assert_eq!(index.index_of(class), Some(i));
        assert_eq!(index.label(i), Some(*class));
    }

    // === 変換 ===
    let conversion = run_conversion(&config).unwrap();
    assert_eq!(conversion.num_calibration_images, 6);
    let quantized = QuantizedModel::load(&conversion.quantized_model_path).unwrap();
    assert_eq!(quantized.input_tensor().unwrap().dtype, DType::Uint8);
    assert_eq!(quantized.output_tensor().unwrap().dtype, DType::Uint8);
    assert_eq!(quantized.output_tensor().unwrap().shape, vec![1, CLASSES.len()]);

    // === 分類 ===
    let image = config.paths.dataset_dir.join(CLASSES[1]).join("img_3.png");
    let classifier =
        QuantizedClassifier::load(&config.paths.quantized_model_path, &config.paths.class_index_path).unwrap();
    let prediction = classifier.classify_image(&image).unwrap();
    assert!(CLASSES.contains(&prediction.label.as_str()));
    assert!(prediction.confidence >= 0.5 - 1.0 / 256.0);

    let float_predictions = classify_with_float_model(&config, &[image]).unwrap();
    assert_eq!(float_predictions.len(), 1);
}

#[test]
fn empty_dataset_fails_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    for class in CLASSES {
        std::fs::create_dir_all(config.paths.dataset_dir.join(class)).unwrap();
    }

    let mut epochs = 0;
    let err = run_training(&config, |_| epochs += 1).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FreshnessError>(),
        Some(FreshnessError::EmptyDataset(_))
    ));
    assert_eq!(epochs, 0);
    assert!(!config.paths.model_path.exists());
    assert!(!config.paths.class_index_path.exists());
}

#[test]
fn single_image_class_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    write_dataset(&config.paths.dataset_dir, 1);

    let err = run_training(&config, |_| {}).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FreshnessError>(),
        Some(FreshnessError::ClassTooSmall { count: 1, .. })
    ));
    assert!(!config.paths.model_path.exists());
}

#[test]
fn conversion_without_model_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    write_dataset(&config.paths.dataset_dir, 2);

    let err = run_conversion(&config).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FreshnessError>(),
        Some(FreshnessError::ModelNotFound(_))
    ));
    assert!(!config.paths.quantized_model_path.exists());
}
