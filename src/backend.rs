//! 計算バックエンドの選択
//!
//! 設定の `device_type` に応じて WGPU (GPU) か NdArray (CPU) で各ジョブを実行します。

use std::path::{Path, PathBuf};

use anyhow::Result;
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use tracing::info;

use crate::error::FreshnessError;
use crate::ml::inference::{InferenceEngine, Prediction};
use crate::ml::training::{train_model, EpochReport, TrainingReport};
use crate::model::model_storage::archive_path;
use crate::model::config::{AppConfig, DeviceType};
use crate::quant::{convert_model, ConversionReport};

pub type CpuBackend = NdArray<f32>;
pub type GpuBackend = Wgpu;

/// 学習ジョブ
pub fn run_training<F>(config: &AppConfig, progress_callback: F) -> Result<TrainingReport>
where
    F: FnMut(&EpochReport),
{
    info!("計算デバイス: {}", config.device_type);
    match config.device_type {
        DeviceType::Wgpu => {
            let device = WgpuDevice::default();
            info!("使用デバイス: {:?}", device);
            train_model::<Autodiff<GpuBackend>, _>(config, &device, progress_callback)
        }
        DeviceType::Cpu => {
            train_model::<Autodiff<CpuBackend>, _>(config, &NdArrayDevice::Cpu, progress_callback)
        }
    }
}

/// 変換ジョブ（キャリブレーションは勾配不要のためAutodiffなし）
pub fn run_conversion(config: &AppConfig) -> Result<ConversionReport> {
    info!("計算デバイス: {}", config.device_type);
    match config.device_type {
        DeviceType::Wgpu => {
            let device = WgpuDevice::default();
            info!("使用デバイス: {:?}", device);
            convert_model::<GpuBackend>(config, &device)
        }
        DeviceType::Cpu => convert_model::<CpuBackend>(config, &NdArrayDevice::Cpu),
    }
}

/// 浮動小数点モデル（学習済みアーカイブ）で画像を分類
pub fn classify_with_float_model(config: &AppConfig, images: &[PathBuf]) -> Result<Vec<Prediction>> {
    let model_path = archive_path(&config.paths.model_path);
    if !model_path.exists() {
        return Err(FreshnessError::ModelNotFound(model_path).into());
    }
    match config.device_type {
        DeviceType::Wgpu => classify_batch::<GpuBackend>(&model_path, WgpuDevice::default(), images),
        DeviceType::Cpu => classify_batch::<CpuBackend>(&model_path, NdArrayDevice::Cpu, images),
    }
}

fn classify_batch<B: burn::tensor::backend::Backend>(
    model_path: &Path,
    device: B::Device,
    images: &[PathBuf],
) -> Result<Vec<Prediction>> {
    InferenceEngine::<B>::load(model_path, device)?.classify_batch(images)
}
