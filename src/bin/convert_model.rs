//! 学習済みモデルを int8 量子化モデルに変換

#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use freshness_lib::{init_logging, run_conversion, AppConfig, DeviceType, LogLevel};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "convert_model", about = "Export the trained model as a full-integer int8 artifact")]
struct Args {
    /// 設定ファイル（存在しない場合は既定値）
    #[arg(long, default_value = "freshness.json")]
    config: PathBuf,

    /// キャリブレーション画像のデータセットディレクトリ
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// 入力するモデルアーカイブ
    #[arg(long)]
    model: Option<PathBuf>,

    /// 出力する量子化モデル
    #[arg(long)]
    output: Option<PathBuf>,

    /// キャリブレーション画像の上限枚数
    #[arg(long)]
    calibration_samples: Option<usize>,

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
    if let Some(output) = args.output {
        config.paths.quantized_model_path = output;
    }
    if let Some(samples) = args.calibration_samples {
        config.conversion.calibration_samples = samples;
    }
    if let Some(device) = args.device {
        config.device_type = device;
    }
    config.validate()?;

    let report = run_conversion(&config)?;
    info!(
        "キャリブレーション {} 枚, 演算子 {}, {} バイト",
        report.num_calibration_images, report.num_operators, report.size_bytes
    );

    println!("{}", report.quantized_model_path.display());
    Ok(())
}
