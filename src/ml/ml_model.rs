//! 機械学習モデルの共通定義
//!
//! MobileNetV2バックボーン + 分類ヘッドの鮮度分類モデルと、画像の読み込み処理を提供します。

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{loss::CrossEntropyLossConfig, Dropout, DropoutConfig, Linear, LinearConfig},
    tensor::{activation, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::{imageops::FilterType, RgbImage};

use crate::error::FreshnessError;
use crate::ml::backbone::{BackboneSpec, MobileNetV2};
use crate::model::config::ModelSettings;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// バックボーンの幅係数
    #[config(default = 1.0)]
    pub width_multiplier: f64,
    /// ドロップアウト率
    #[config(default = 0.3)]
    pub dropout: f64,
    /// ヘッドの中間層ユニット数
    #[config(default = 128)]
    pub hidden_units: usize,
}

impl ModelConfig {
    /// アプリケーション設定から作成
    pub fn from_settings(num_classes: usize, settings: &ModelSettings) -> Self {
        Self::new(num_classes)
            .with_image_size(settings.image_size)
            .with_width_multiplier(settings.width_multiplier)
            .with_dropout(settings.dropout)
            .with_hidden_units(settings.hidden_units)
    }

    /// バックボーンの構造
    pub fn backbone_spec(&self) -> BackboneSpec {
        BackboneSpec::new(self.width_multiplier)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> FreshnessClassifier<B> {
        let spec = self.backbone_spec();
        let features = spec.output_channels();

        tracing::debug!(
            "[Model] 入力 {}x{}, alpha={}, 特徴次元 {}, 最終特徴マップ {}x{}",
            self.image_size,
            self.image_size,
            self.width_multiplier,
            features,
            spec.feature_map_size(self.image_size),
            spec.feature_map_size(self.image_size)
        );
        tracing::debug!(
            "[Model] Head: Dropout({}) -> FC {} -> {} (ReLU) -> FC {} -> {}",
            self.dropout,
            features,
            self.hidden_units,
            self.hidden_units,
            self.num_classes
        );

        FreshnessClassifier {
            backbone: MobileNetV2::new(&spec, device),
            head: ClassifierHead {
                dropout: DropoutConfig::new(self.dropout).init(),
                hidden: LinearConfig::new(features, self.hidden_units).init(device),
                output: LinearConfig::new(self.hidden_units, self.num_classes).init(device),
            },
        }
    }
}

/// 分類ヘッド
///
/// Dropout → FC(ReLU) → FC。出力はロジットで、確率が必要な場合は softmax を適用します。
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub dropout: Dropout,
    pub hidden: Linear<B>,
    pub output: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    /// 中間層の出力（ReLU後）
    pub fn hidden_features(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(features);
        activation::relu(self.hidden.forward(x))
    }

    /// プーリング済み特徴 [batch_size, channels] からロジットを計算
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.output.forward(self.hidden_features(features))
    }
}

/// 鮮度分類モデル
///
/// # アーキテクチャ
/// - MobileNetV2（バッチ正規化は常に推論モード）
/// - グローバル平均プーリング
/// - Dropout → FC 128 + ReLU → FC num_classes
/// - Softmax（分類時）
#[derive(Module, Debug)]
pub struct FreshnessClassifier<B: Backend> {
    pub backbone: MobileNetV2<B>,
    pub head: ClassifierHead<B>,
}

impl<B: Backend> FreshnessClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]、値域 [0, 1]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// バックボーンの勾配を切って順伝播（ヘッドのみ学習するフェーズ用）
    pub fn forward_frozen_backbone(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images).detach())
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        activation::softmax(self.forward(images), 1)
    }

    /// 出力クラス数
    pub fn num_classes(&self) -> usize {
        let [_, num_classes] = self.head.output.weight.val().dims();
        num_classes
    }

    /// ロジットから損失を計算
    pub fn classification_output(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), targets.clone());

        ClassificationOutput::new(loss, logits, targets)
    }

    /// 順伝播と損失計算
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - `targets`: ターゲットラベル [batch_size]
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let logits = self.forward(images);
        self.classification_output(logits, targets)
    }
}

/// 画像を読み込んでRGBに変換
pub fn load_rgb_image(path: &Path) -> anyhow::Result<RgbImage> {
    let img = image::open(path)
        .map_err(|e| FreshnessError::ImageLoad(path.to_path_buf(), e.to_string()))?;
    Ok(img.to_rgb8())
}

/// 指定サイズの正方形にリサイズ（アスペクト比は保持しない）
pub fn resize_square(img: &RgbImage, size: usize, filter: FilterType) -> RgbImage {
    let size = size as u32;
    if img.width() == size && img.height() == size {
        return img.clone();
    }
    image::imageops::resize(img, size, size, filter)
}

/// RGB画像を [0,1] の浮動小数点に変換し (C, H, W) の順で平坦化
pub fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let pixel = img.get_pixel(x, y);
                data.push(pixel[channel] as f32 / 255.0);
            }
        }
    }

    data
}

/// 画像を読み込み、リサイズして正規化
///
/// # 戻り値
/// - 正規化されたRGB画像データ (C, H, W) の順で平坦化
pub fn load_and_normalize_image(
    path: &Path,
    image_size: usize,
    filter: FilterType,
) -> anyhow::Result<Vec<f32>> {
    let img = load_rgb_image(path)?;
    Ok(image_to_chw(&resize_square(&img, image_size, filter)))
}
