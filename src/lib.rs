//! 青果の鮮度分類モデル
//!
//! - 学習ジョブ: MobileNetV2 の転移学習（ヘッド学習 → 末尾の微調整）
//! - 変換ジョブ: キャリブレーション付きの int8 量子化とモバイル向けファイルの出力
//! - 分類: 浮動小数点モデル・量子化モデルの両方で画像を分類

#![recursion_limit = "256"]

pub mod backend;
pub mod error;
pub mod logging;
pub mod ml;
pub mod model;
pub mod quant;

pub use backend::{run_conversion, run_training};
pub use error::FreshnessError;
pub use logging::{init_logging, LogLevel};
pub use model::{AppConfig, ClassIndex, DeviceType};
