//! キャリブレーション（アクティベーションの値域の計測）

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, ElementConversion, Tensor};
use image::imageops::FilterType;
use tracing::{debug, info, warn};

use crate::error::FreshnessError;
use crate::ml::dataset::list_images;
use crate::ml::ml_model::{load_and_normalize_image, FreshnessClassifier};
use crate::quant::params::RangeObserver;

/// 量子化点ごとの値域
///
/// `taps` の並びは `MobileNetV2::forward_with_taps` と同じです。
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRanges {
    pub taps: Vec<RangeObserver>,
    pub pooled: RangeObserver,
    pub hidden: RangeObserver,
    pub logits: RangeObserver,
    pub num_images: usize,
}

/// `<dataset>/*/*` に一致する画像ファイル（名前順）
pub fn calibration_files(dataset_dir: &Path) -> Result<Vec<PathBuf>> {
    if !dataset_dir.is_dir() {
        return Err(FreshnessError::DatasetNotFound(dataset_dir.to_path_buf()).into());
    }

    let mut class_dirs = Vec::new();
    for entry in std::fs::read_dir(dataset_dir)
        .with_context(|| format!("Failed to read {}", dataset_dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            class_dirs.push(path);
        }
    }
    class_dirs.sort();

    let mut files = Vec::new();
    for dir in class_dirs {
        files.extend(list_images(&dir)?);
    }
    files.sort();
    Ok(files)
}

/// キャリブレーション画像を最大 `limit` 枚読み込む
///
/// 読めない画像は警告を出して読み飛ばします。1枚も読めなければエラーです。
///
/// # 戻り値
/// - 正規化済み画像 (C, H, W) の一覧
pub fn load_calibration_images(dataset_dir: &Path, limit: usize, image_size: usize) -> Result<Vec<Vec<f32>>> {
    let files = calibration_files(dataset_dir)?;
    let selected = &files[..files.len().min(limit)];
    info!("キャリブレーション候補: {} 枚（上限 {}）", selected.len(), limit);

    let mut images = Vec::with_capacity(selected.len());
    for path in selected {
        match load_and_normalize_image(path, image_size, FilterType::CatmullRom) {
            Ok(image) => images.push(image),
            Err(e) => warn!("キャリブレーション画像をスキップ: {:#}", e),
        }
    }

    if images.is_empty() {
        return Err(FreshnessError::EmptyCalibrationSet {
            path: dataset_dir.to_path_buf(),
            requested: limit,
        }
        .into());
    }
    info!("キャリブレーション画像: {} 枚", images.len());
    Ok(images)
}

fn observe<B: Backend, const D: usize>(observer: &mut RangeObserver, tensor: &Tensor<B, D>) {
    let min = tensor.clone().min().into_scalar().elem::<f32>();
    let max = tensor.clone().max().into_scalar().elem::<f32>();
    observer.observe(min, max);
}

/// 浮動小数点モデルを実行して各量子化点の値域を記録
pub fn calibrate<B: Backend>(
    model: &FreshnessClassifier<B>,
    images: &[Vec<f32>],
    image_size: usize,
    batch_size: usize,
    device: &B::Device,
) -> CalibrationRanges {
    let mut ranges = CalibrationRanges {
        taps: Vec::new(),
        pooled: RangeObserver::default(),
        hidden: RangeObserver::default(),
        logits: RangeObserver::default(),
        num_images: images.len(),
    };

    for (i, chunk) in images.chunks(batch_size.max(1)).enumerate() {
        let flat: Vec<f32> = chunk.iter().flatten().copied().collect();
        let batch = Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([
            chunk.len(),
            3,
            image_size,
            image_size,
        ]);

        let (pooled, taps) = model.backbone.forward_with_taps(batch);
        if ranges.taps.is_empty() {
            ranges.taps = vec![RangeObserver::default(); taps.len()];
        }
        for (observer, tap) in ranges.taps.iter_mut().zip(&taps) {
            observe(observer, tap);
        }

        let hidden = model.head.hidden_features(pooled.clone());
        let logits = model.head.output.forward(hidden.clone());
        observe(&mut ranges.pooled, &pooled);
        observe(&mut ranges.hidden, &hidden);
        observe(&mut ranges.logits, &logits);
        debug!("キャリブレーション バッチ {} ({} 枚)", i + 1, chunk.len());
    }

    ranges
}
