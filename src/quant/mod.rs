//! 整数量子化（変換ジョブ）
//!
//! 学習済みモデルをキャリブレーション画像で計測し、int8 の整数演算グラフに変換して
//! FRQ8 形式で保存します。変換結果は同じモジュールのインタプリタで実行できます。

pub mod artifact;
pub mod calibration;
pub mod classifier;
pub mod interpreter;
pub mod kernels;
pub mod lowering;
pub mod params;

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use tracing::info;

use crate::error::FreshnessError;
use crate::ml::inference::load_trained_model;
use crate::model::config::AppConfig;
use crate::model::model_storage::{archive_path, log_metadata_info};

pub use artifact::{DType, QuantizedModel};
pub use calibration::{calibrate, load_calibration_images, CalibrationRanges};
pub use classifier::QuantizedClassifier;
pub use interpreter::Interpreter;
pub use lowering::lower_model;
pub use params::QuantParams;

/// 変換結果
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub quantized_model_path: PathBuf,
    pub num_calibration_images: usize,
    pub num_operators: usize,
    pub size_bytes: usize,
    pub class_labels: Vec<String>,
}

/// 学習済みモデルを int8 量子化モデルに変換して保存
///
/// # 処理の流れ
/// 1. モデルアーカイブ（メタデータ + 重み）を読み込む
/// 2. キャリブレーション画像で各量子化点の値域を計測
/// 3. バッチ正規化の畳み込み・量子化・固定小数点係数の計算
/// 4. 一時ファイル経由で書き出す
pub fn convert_model<B: Backend>(config: &AppConfig, device: &B::Device) -> Result<ConversionReport> {
    let model_path = archive_path(&config.paths.model_path);
    if !model_path.exists() {
        return Err(FreshnessError::ModelNotFound(model_path).into());
    }

    let (metadata, model) = load_trained_model::<B>(&model_path, device)
        .with_context(|| format!("Failed to load model: {}", model_path.display()))?;
    log_metadata_info(&metadata);

    let image_size = metadata.image_size();
    let images = load_calibration_images(
        &config.paths.dataset_dir,
        config.conversion.calibration_samples,
        image_size,
    )?;
    let ranges = calibrate(
        &model,
        &images,
        image_size,
        config.conversion.calibration_batch_size,
        device,
    );

    let spec = metadata.model.backbone_spec();
    let quantized = lower_model(&model, &spec, image_size, &ranges)?;
    if quantized.header.class_count != metadata.class_labels.len() {
        return Err(FreshnessError::InvalidClassIndex(format!(
            "quantized model outputs {} classes but the archive lists {}",
            quantized.header.class_count,
            metadata.class_labels.len()
        ))
        .into());
    }

    let bytes = quantized.to_bytes()?;
    crate::model::model_storage::write_atomically(&config.paths.quantized_model_path, &bytes)
        .with_context(|| {
            format!(
                "Failed to write quantized model: {}",
                config.paths.quantized_model_path.display()
            )
        })?;

    info!(
        "量子化モデルを保存しました: {} ({} バイト, 演算子 {})",
        config.paths.quantized_model_path.display(),
        bytes.len(),
        quantized.header.operators.len()
    );

    Ok(ConversionReport {
        quantized_model_path: config.paths.quantized_model_path.clone(),
        num_calibration_images: ranges.num_images,
        num_operators: quantized.header.operators.len(),
        size_bytes: bytes.len(),
        class_labels: metadata.class_labels,
    })
}
