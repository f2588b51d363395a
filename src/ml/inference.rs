//! モデル推論機能（浮動小数点版）

use std::path::Path;

use anyhow::Result;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use image::imageops::FilterType;
use serde::Serialize;

use crate::ml::ml_model::{load_and_normalize_image, FreshnessClassifier};
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::load_model_with_metadata;

/// 分類結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub index: usize,
    pub confidence: f32,
}

impl Prediction {
    /// 確率ベクトルの最大値から作成
    pub fn from_probabilities(probabilities: &[f32], labels: &[String]) -> Result<Self> {
        let (index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((i, p)),
            })
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))?;

        let label = labels
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", index))?
            .clone();

        Ok(Self {
            label,
            index,
            confidence,
        })
    }
}

impl std::fmt::Display for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:.2})", self.label, self.confidence)
    }
}

/// モデルアーカイブから学習済みモデルを復元
pub fn load_trained_model<B: Backend>(
    model_path: &Path,
    device: &B::Device,
) -> Result<(ModelMetadata, FreshnessClassifier<B>)> {
    let (metadata, model_binary) = load_model_with_metadata(model_path)?;

    let model = metadata.model.init::<B>(device);

    // モデルの重みを復元
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(model_binary, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok((metadata, model.load_record(record)))
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: FreshnessClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (metadata, model) = load_trained_model::<B>(model_path.as_ref(), &device)?;
        Ok(Self {
            model,
            metadata,
            device,
        })
    }

    pub fn model(&self) -> &FreshnessClassifier<B> {
        &self.model
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// 単一画像のクラス確率
    pub fn predict_probabilities<P: AsRef<Path>>(&self, image_path: P) -> Result<Vec<f32>> {
        let size = self.metadata.image_size();
        let image_data = load_and_normalize_image(image_path.as_ref(), size, FilterType::Triangle)?;

        // Tensorに変換 [1, 3, size, size]
        let tensor = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device)
            .reshape([1, 3, size, size]);

        self.model
            .forward_probabilities(tensor)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))
    }

    /// 単一画像を分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let probabilities = self.predict_probabilities(image_path)?;
        Prediction::from_probabilities(&probabilities, &self.metadata.class_labels)
    }

    /// 複数画像をバッチ分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        image_paths
            .iter()
            .map(|path| self.classify_image(path))
            .collect()
    }
}
