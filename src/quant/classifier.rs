//! 量子化モデルによる画像分類

use std::path::Path;

use anyhow::Result;
use image::imageops::FilterType;

use crate::error::FreshnessError;
use crate::ml::inference::Prediction;
use crate::ml::ml_model::{load_rgb_image, resize_square};
use crate::model::class_index::ClassIndex;
use crate::quant::interpreter::Interpreter;

/// 量子化モデル + クラスインデックス
pub struct QuantizedClassifier {
    interpreter: Interpreter,
    class_index: ClassIndex,
    image_size: usize,
}

impl QuantizedClassifier {
    pub fn load(model_path: &Path, class_index_path: &Path) -> Result<Self> {
        let interpreter = Interpreter::load(model_path)?;
        let class_index = ClassIndex::load(class_index_path)?;
        Self::new(interpreter, class_index)
    }

    pub fn new(interpreter: Interpreter, class_index: ClassIndex) -> Result<Self> {
        if interpreter.class_count() != class_index.num_classes() {
            return Err(FreshnessError::InvalidClassIndex(format!(
                "model outputs {} classes but the class index lists {}",
                interpreter.class_count(),
                class_index.num_classes()
            ))
            .into());
        }
        let image_size = match interpreter.input_shape()? {
            [1, h, w, 3] if h == w => *h,
            other => {
                return Err(FreshnessError::InvalidArtifact(format!(
                    "expected a square [1, H, W, 3] input, got {:?}",
                    other
                ))
                .into())
            }
        };
        Ok(Self {
            interpreter,
            class_index,
            image_size,
        })
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn class_index(&self) -> &ClassIndex {
        &self.class_index
    }

    /// 画像ファイルをモデル入力（uint8, HWC）に変換
    pub fn prepare_image(&self, image_path: &Path) -> Result<Vec<u8>> {
        let img = load_rgb_image(image_path)?;
        Ok(resize_square(&img, self.image_size, FilterType::Triangle).into_raw())
    }

    /// クラス確率（出力を逆量子化したもの）
    pub fn predict_probabilities(&self, pixels: &[u8]) -> Result<Vec<f32>> {
        let params = self.interpreter.output_params()?;
        Ok(self
            .interpreter
            .invoke(pixels)?
            .into_iter()
            .map(|q| params.dequantize(i32::from(q)))
            .collect())
    }

    pub fn classify_image(&self, image_path: &Path) -> Result<Prediction> {
        let pixels = self.prepare_image(image_path)?;
        let probabilities = self.predict_probabilities(&pixels)?;
        Prediction::from_probabilities(&probabilities, self.class_index.labels())
    }
}
