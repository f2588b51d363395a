//! アプリケーション設定管理モジュール
//!
//! データセット・出力ファイルのパスや学習・変換のハイパーパラメータを
//! JSON形式で保存・読み込みします。ファイルが無い場合は既定値を使用します。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::FreshnessError;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 入出力ファイルのパス
///
/// 2つのジョブはこれらのファイルだけで結合されます。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// データセット（クラスごとのサブディレクトリ）
    pub dataset_dir: PathBuf,
    /// 学習済みモデルアーカイブ（tar.gz）
    pub model_path: PathBuf,
    /// クラスインデックス（JSON）
    pub class_index_path: PathBuf,
    /// 量子化モデル
    pub quantized_model_path: PathBuf,
    /// 事前学習済みバックボーンの重み（burnレコード）
    #[serde(default)]
    pub backbone_weights: Option<PathBuf>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("../dataset"),
            model_path: PathBuf::from("model_freshness.tar.gz"),
            class_index_path: PathBuf::from("class_indices.json"),
            quantized_model_path: PathBuf::from("model_freshness_int8.frq8"),
            backbone_weights: None,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// バックボーンの幅係数 (alpha)
    pub width_multiplier: f64,
    /// ヘッドのドロップアウト率
    pub dropout: f64,
    /// ヘッドの中間層ユニット数
    pub hidden_units: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            image_size: 224,
            width_multiplier: 1.0,
            dropout: 0.3,
            hidden_units: 128,
        }
    }
}

/// 1フェーズ分の学習設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSettings {
    /// 最大エポック数
    pub epochs: usize,
    /// 学習率
    pub learning_rate: f64,
}

/// 検証損失が停滞したときの学習率減衰
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlateauSettings {
    pub factor: f64,
    pub patience: usize,
    pub min_delta: f64,
    pub cooldown: usize,
    pub min_lr: f64,
}

impl Default for PlateauSettings {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 3,
            min_delta: 1e-4,
            cooldown: 0,
            min_lr: 0.0,
        }
    }
}

/// 早期終了
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingSettings {
    pub patience: usize,
    pub min_delta: f64,
    pub restore_best_weights: bool,
}

impl Default for EarlyStoppingSettings {
    fn default() -> Self {
        Self {
            patience: 6,
            min_delta: 0.0,
            restore_best_weights: true,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// バッチサイズ
    pub batch_size: usize,
    /// 検証データの割合（クラスごとに適用）
    pub validation_split: f64,
    /// ランダムシード
    pub seed: u64,
    /// フェーズ1: ヘッドのみ学習
    pub head: PhaseSettings,
    /// フェーズ2: バックボーン上位層を含めて微調整
    pub fine_tune: PhaseSettings,
    /// フェーズ2で学習対象にするバックボーン末尾の層数
    pub fine_tune_layers: usize,
    pub plateau: PlateauSettings,
    pub early_stopping: EarlyStoppingSettings,
    /// 検証データにも拡張を適用するか
    #[serde(default = "default_true")]
    pub augment_validation: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            validation_split: 0.15,
            seed: 42,
            head: PhaseSettings {
                epochs: 12,
                learning_rate: 1e-3,
            },
            fine_tune: PhaseSettings {
                epochs: 6,
                learning_rate: 1e-5,
            },
            fine_tune_layers: 50,
            plateau: PlateauSettings::default(),
            early_stopping: EarlyStoppingSettings::default(),
            augment_validation: true,
        }
    }
}

/// データ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationSettings {
    /// 回転角の最大値（度）
    pub rotation_range: f64,
    /// 横方向シフトの最大値（画像幅に対する割合）
    pub width_shift_range: f64,
    /// 縦方向シフトの最大値（画像高さに対する割合）
    pub height_shift_range: f64,
    /// 明るさ係数の範囲
    pub brightness_range: (f64, f64),
    /// ランダム左右反転
    pub horizontal_flip: bool,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rotation_range: 15.0,
            width_shift_range: 0.08,
            height_shift_range: 0.08,
            brightness_range: (0.7, 1.2),
            horizontal_flip: true,
        }
    }
}

impl AugmentationSettings {
    /// 拡張なし
    pub fn disabled() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            brightness_range: (1.0, 1.0),
            horizontal_flip: false,
        }
    }
}

/// 量子化変換設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionSettings {
    /// キャリブレーションに使う画像の最大枚数
    pub calibration_samples: usize,
    /// キャリブレーション時のバッチサイズ（統計は画像単位と同一）
    pub calibration_batch_size: usize,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            calibration_samples: 150,
            calibration_batch_size: 16,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub augmentation: AugmentationSettings,
    #[serde(default)]
    pub conversion: ConversionSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("freshness.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合はデフォルト設定を返す
    ///
    /// ファイルが存在するのに読めない場合はエラーにします。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::load(path)?;
            info!("設定ファイルを読み込みました: {}", path.display());
            Ok(config)
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Ok(Self::default())
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 値の範囲チェック
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.training;
        if !(t.validation_split > 0.0 && t.validation_split < 1.0) {
            return Err(FreshnessError::Config(format!(
                "validation_split must be in (0, 1), got {}",
                t.validation_split
            ))
            .into());
        }
        if t.batch_size == 0 {
            return Err(FreshnessError::Config("batch_size must be positive".to_string()).into());
        }
        if self.model.image_size < 32 {
            return Err(FreshnessError::Config(format!(
                "image_size must be at least 32, got {}",
                self.model.image_size
            ))
            .into());
        }
        if self.model.width_multiplier <= 0.0 {
            return Err(FreshnessError::Config(
                "width_multiplier must be positive".to_string(),
            )
            .into());
        }
        let (lo, hi) = self.augmentation.brightness_range;
        if lo <= 0.0 || hi < lo {
            return Err(FreshnessError::Config(format!(
                "invalid brightness_range ({}, {})",
                lo, hi
            ))
            .into());
        }
        if self.conversion.calibration_samples == 0 {
            warn!("calibration_samples が 0 です。変換は失敗します");
        }
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!("データセット: {}", self.paths.dataset_dir.display());
        info!("モデル: {}", self.paths.model_path.display());
        info!("クラスインデックス: {}", self.paths.class_index_path.display());
        info!("量子化モデル: {}", self.paths.quantized_model_path.display());
        info!(
            "入力サイズ: {}x{}, alpha={}, dropout={}",
            self.model.image_size,
            self.model.image_size,
            self.model.width_multiplier,
            self.model.dropout
        );
        info!(
            "バッチサイズ: {}, 検証割合: {}, シード: {}",
            self.training.batch_size, self.training.validation_split, self.training.seed
        );
        info!(
            "フェーズ1: {}エポック lr={} / フェーズ2: {}エポック lr={} (末尾{}層)",
            self.training.head.epochs,
            self.training.head.learning_rate,
            self.training.fine_tune.epochs,
            self.training.fine_tune.learning_rate,
            self.training.fine_tune_layers
        );
    }
}
