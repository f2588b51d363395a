//! エラー型の定義
//!
//! データセット・設定・変換の各段階で発生するエラーを分類します。
//! 公開APIは `anyhow::Result` を返し、呼び出し側は `downcast_ref` で判別できます。

use std::path::PathBuf;

use thiserror::Error;

/// 学習・変換ジョブのエラー
#[derive(Error, Debug)]
pub enum FreshnessError {
    /// データセットディレクトリが存在しない
    #[error("dataset directory not found: {0}")]
    DatasetNotFound(PathBuf),

    /// クラスディレクトリが1つもない
    #[error("no class directories found in {0}")]
    NoClasses(PathBuf),

    /// 画像が1枚もない
    #[error("no images found in {0}")]
    EmptyDataset(PathBuf),

    /// 学習用・検証用の両方に割り当てられないクラス
    #[error("class '{class}' has {count} image(s); at least 2 are needed to populate both partitions")]
    ClassTooSmall { class: String, count: usize },

    /// 画像の読み込み失敗
    #[error("failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// モデルアーカイブが存在しない
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),

    /// 設定値の不整合
    #[error("configuration error: {0}")]
    Config(String),

    /// クラスインデックスが全単射になっていない
    #[error("invalid class index mapping: {0}")]
    InvalidClassIndex(String),

    /// キャリブレーション画像を1枚も読み込めなかった
    #[error("no calibration image could be read from {path} (requested up to {requested})")]
    EmptyCalibrationSet { path: PathBuf, requested: usize },

    /// 整数量子化できない演算
    #[error("operation '{op}' has no valid integer-quantized equivalent: {reason}")]
    UnsupportedOperation { op: String, reason: String },

    /// 量子化モデルファイルの形式エラー
    #[error("invalid quantized artifact: {0}")]
    InvalidArtifact(String),
}
