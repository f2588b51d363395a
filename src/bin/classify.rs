//! 画像の鮮度を分類する（量子化モデル、または浮動小数点モデル）

#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use freshness_lib::backend::classify_with_float_model;
use freshness_lib::quant::QuantizedClassifier;
use freshness_lib::{init_logging, AppConfig, DeviceType, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "classify", about = "Classify produce images as fresh or rotten")]
struct Args {
    /// 分類する画像
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// 設定ファイル（存在しない場合は既定値）
    #[arg(long, default_value = "freshness.json")]
    config: PathBuf,

    /// 量子化モデル
    #[arg(long)]
    model: Option<PathBuf>,

    /// クラスインデックス
    #[arg(long)]
    class_index: Option<PathBuf>,

    /// 学習済みアーカイブ（浮動小数点）で分類する
    #[arg(long)]
    float: bool,

    #[arg(long, value_enum)]
    device: Option<DeviceType>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level)?;

    let mut config = AppConfig::load_or_default(&args.config)?;
    if let Some(device) = args.device {
        config.device_type = device;
    }
    if let Some(class_index) = args.class_index {
        config.paths.class_index_path = class_index;
    }

    let predictions = if args.float {
        if let Some(model) = args.model {
            config.paths.model_path = model;
        }
        classify_with_float_model(&config, &args.images)?
    } else {
        if let Some(model) = args.model {
            config.paths.quantized_model_path = model;
        }
        let classifier =
            QuantizedClassifier::load(&config.paths.quantized_model_path, &config.paths.class_index_path)?;
        args.images
            .iter()
            .map(|path| classifier.classify_image(path))
            .collect::<Result<Vec<_>>>()?
    };

    for (path, prediction) in args.images.iter().zip(&predictions) {
        println!("{}\t{}", path.display(), prediction);
    }
    Ok(())
}
