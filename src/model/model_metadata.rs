//! モデルメタデータの定義と永続化
//!
//! モデルアーカイブ内の `metadata.json` に保存される情報です。
//! 重みだけではモデル構造を復元できないため、構造の設定とクラス順序を一緒に保存します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::ModelConfig;

/// フェーズごとの学習結果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSummary {
    /// フェーズ名（"head" / "fine_tune"）
    pub name: String,
    /// 実行したエポック数
    pub epochs_run: usize,
    /// 最良の検証損失（1エポックも実行しなかった場合や損失が有限でない場合は None）
    pub best_val_loss: Option<f64>,
    /// 早期終了したか
    pub stopped_early: bool,
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// モデル構造の設定（クラス数・入力サイズ・幅係数など）
    pub model: ModelConfig,

    /// インデックス順のクラス名
    pub class_labels: Vec<String>,

    /// 学習サンプル数
    pub num_train_samples: usize,

    /// 検証サンプル数
    pub num_val_samples: usize,

    /// フェーズごとの結果
    pub phases: Vec<PhaseSummary>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        model: ModelConfig,
        class_labels: Vec<String>,
        num_train_samples: usize,
        num_val_samples: usize,
        phases: Vec<PhaseSummary>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            model,
            class_labels,
            num_train_samples,
            num_val_samples,
            phases,
            trained_at,
        }
    }

    /// 入力画像サイズ
    pub fn image_size(&self) -> usize {
        self.model.image_size
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        if metadata.model.num_classes != metadata.class_labels.len() {
            anyhow::bail!(
                "metadata is inconsistent: {} classes configured but {} labels stored",
                metadata.model.num_classes,
                metadata.class_labels.len()
            );
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let metadata = ModelMetadata::new(
            ModelConfig::new(2).with_image_size(64),
            vec!["fresh".to_string(), "rotten".to_string()],
            10,
            2,
            vec![PhaseSummary {
                name: "head".to_string(),
                epochs_run: 3,
                best_val_loss: Some(0.25),
                stopped_early: false,
            }],
        );
        let json = metadata.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(restored.image_size(), 64);
        assert_eq!(restored.class_labels, metadata.class_labels);
        assert_eq!(restored.phases, metadata.phases);
    }

    #[test]
    fn test_inconsistent_class_count_rejected() {
        let metadata = ModelMetadata::new(
            ModelConfig::new(3),
            vec!["fresh".to_string(), "rotten".to_string()],
            0,
            0,
            vec![],
        );
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(ModelMetadata::from_json_string(&json).is_err());
    }
}
