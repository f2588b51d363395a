//! 鮮度分類モデルの学習
//!
//! データセット（クラスごとのサブディレクトリ）から2フェーズの転移学習を行い、
//! モデルアーカイブとクラスインデックスを書き出します。

#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use freshness_lib::{init_logging, run_training, AppConfig, DeviceType, LogLevel};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "train_freshness", about = "Train the produce freshness classifier")]
struct Args {
    /// 設定ファイル（存在しない場合は既定値）
    #[arg(long, default_value = "freshness.json")]
    config: PathBuf,

    /// データセットディレクトリ
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// 出力するモデルアーカイブ
    #[arg(long)]
    model: Option<PathBuf>,

    /// 出力するクラスインデックス
    #[arg(long)]
    class_index: Option<PathBuf>,

    /// 事前学習済みバックボーンの重み
    #[arg(long)]
    backbone_weights: Option<PathBuf>,

    #[arg(long, value_enum)]
    device: Option<DeviceType>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level)?;

    let mut config = AppConfig::load_or_default(&args.config)?;
    if let Some(dataset) = args.dataset {
        config.paths.dataset_dir = dataset;
    }
    if let Some(model) = args.model {
        config.paths.model_path = model;
    }
    if let Some(class_index) = args.class_index {
        config.paths.class_index_path = class_index;
    }
    if let Some(weights) = args.backbone_weights {
        config.paths.backbone_weights = Some(weights);
    }
    if let Some(device) = args.device {
        config.device_type = device;
    }
    config.log_summary();

    let mut epochs = 0;
    let report = run_training(&config, |_| epochs += 1)?;
    info!("学習完了: 合計 {} エポック", epochs);

    println!("{}", report.model_path.display());
    println!("{}", report.class_index_path.display());
    Ok(())
}
