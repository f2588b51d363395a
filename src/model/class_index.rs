//! クラス名とクラスインデックスの対応
//!
//! データセットを最初に走査した時点で決まり、学習結果を使うすべての処理で
//! 同一でなければなりません。JSONでは `{ "label": index }` 形式で保存します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::FreshnessError;
use crate::model::model_storage::write_atomically;

/// クラス名 → インデックスの全単射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, usize>", into = "BTreeMap<String, usize>")]
pub struct ClassIndex {
    /// インデックス順のクラス名
    labels: Vec<String>,
}

impl ClassIndex {
    /// クラス名一覧から作成（辞書順に並べ替えてインデックスを割り当て）
    pub fn from_labels<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        labels.sort();
        let before = labels.len();
        labels.dedup();
        if labels.len() != before {
            return Err(FreshnessError::InvalidClassIndex("duplicate class label".to_string()).into());
        }
        Ok(Self { labels })
    }

    /// インデックス順のクラス名
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// インデックスからクラス名を取得
    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// クラス名からインデックスを取得
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.binary_search_by(|l| l.as_str().cmp(label)).ok()
    }

    /// JSONファイルに保存（一時ファイル経由）
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize class index")?;
        write_atomically(path, json.as_bytes())
            .with_context(|| format!("Failed to write class index: {}", path.display()))
    }

    /// JSONファイルから読み込む
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read class index: {}", path.display()))?;
        let index: ClassIndex = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse class index: {}", path.display()))?;
        Ok(index)
    }
}

impl TryFrom<BTreeMap<String, usize>> for ClassIndex {
    type Error = FreshnessError;

    fn try_from(map: BTreeMap<String, usize>) -> std::result::Result<Self, Self::Error> {
        let n = map.len();
        let mut slots: Vec<Option<String>> = vec![None; n];
        for (label, index) in map {
            if index >= n {
                return Err(FreshnessError::InvalidClassIndex(format!(
                    "index {} for '{}' is out of range 0..{}",
                    index, label, n
                )));
            }
            if let Some(existing) = &slots[index] {
                return Err(FreshnessError::InvalidClassIndex(format!(
                    "index {} is assigned to both '{}' and '{}'",
                    index, existing, label
                )));
            }
            slots[index] = Some(label);
        }
        // 範囲内かつ重複なしなので全スロットが埋まっている
        let labels = slots.into_iter().flatten().collect();
        Ok(Self { labels })
    }
}

impl From<ClassIndex> for BTreeMap<String, usize> {
    fn from(index: ClassIndex) -> Self {
        index
            .labels
            .into_iter()
            .enumerate()
            .map(|(i, label)| (label, i))
            .collect()
    }
}
