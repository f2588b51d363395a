//! 学習データセット
//!
//! クラスごとのサブディレクトリを走査し、クラス単位で学習用・検証用に分割します。
//! 画像はバッチ作成時にオンデマンドで読み込みます。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::FreshnessError;
use crate::ml::augmentation::Augmenter;
use crate::ml::ml_model::{image_to_chw, load_rgb_image, resize_square};
use crate::model::class_index::ClassIndex;

/// 画像として扱う拡張子
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// 拡張子が画像かどうか（大文字小文字は区別しない）
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// ディレクトリ内の画像ファイル（パス順）
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && is_image_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// 1サンプル（画像パスとクラスID）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSample {
    pub path: PathBuf,
    pub label: usize,
}

/// 走査結果
#[derive(Debug, Clone)]
pub struct ScannedDataset {
    pub root: PathBuf,
    pub class_index: ClassIndex,
    /// クラスIDごとの画像パス（パス順）
    pub images_per_class: Vec<Vec<PathBuf>>,
}

impl ScannedDataset {
    /// データセットディレクトリを走査
    ///
    /// クラス名は辞書順、ファイルはパス順に並べます。
    pub fn scan(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(FreshnessError::DatasetNotFound(root.to_path_buf()).into());
        }

        let mut class_names = Vec::new();
        for entry in std::fs::read_dir(root).with_context(|| format!("Failed to read {}", root.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| anyhow::anyhow!("Invalid directory name: {}", path.display()))?;
                class_names.push(name.to_string());
            }
        }

        if class_names.is_empty() {
            return Err(FreshnessError::NoClasses(root.to_path_buf()).into());
        }

        let class_index = ClassIndex::from_labels(class_names)?;
        let images_per_class = class_index
            .labels()
            .iter()
            .map(|label| list_images(&root.join(label)))
            .collect::<Result<Vec<_>>>()?;

        let dataset = Self {
            root: root.to_path_buf(),
            class_index,
            images_per_class,
        };
        if dataset.num_images() == 0 {
            return Err(FreshnessError::EmptyDataset(root.to_path_buf()).into());
        }

        tracing::info!(
            "{} クラス、{} 枚の画像を検出しました",
            dataset.class_index.num_classes(),
            dataset.num_images()
        );
        for (label, images) in dataset.class_index.labels().iter().zip(&dataset.images_per_class) {
            tracing::info!("  クラス '{}': {} 枚", label, images.len());
        }

        Ok(dataset)
    }

    pub fn num_images(&self) -> usize {
        self.images_per_class.iter().map(Vec::len).sum()
    }

    /// クラスごとに学習用と検証用に分割
    ///
    /// 各クラスの先頭 `v = clamp(floor(n * fraction), 1, n - 1)` 枚を検証用にします。
    pub fn split(&self, validation_fraction: f64) -> Result<DatasetSplit> {
        let mut train = Vec::new();
        let mut validation = Vec::new();

        for (label, images) in self.images_per_class.iter().enumerate() {
            let n = images.len();
            if n < 2 {
                return Err(FreshnessError::ClassTooSmall {
                    class: self.class_index.label(label).unwrap_or_default().to_string(),
                    count: n,
                }
                .into());
            }
            let v = validation_count(n, validation_fraction);
            for (i, path) in images.iter().enumerate() {
                let sample = ImageSample {
                    path: path.clone(),
                    label,
                };
                if i < v {
                    validation.push(sample);
                } else {
                    train.push(sample);
                }
            }
        }

        Ok(DatasetSplit {
            train: FreshnessDataset::new(train),
            validation: FreshnessDataset::new(validation),
        })
    }
}

/// 検証用に割り当てる枚数
pub fn validation_count(n: usize, fraction: f64) -> usize {
    if n < 2 {
        return 0;
    }
    ((n as f64 * fraction).floor() as usize).clamp(1, n - 1)
}

/// 学習用・検証用の組
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub train: FreshnessDataset,
    pub validation: FreshnessDataset,
}

/// 画像パスのリストのみ保持するデータセット
#[derive(Debug, Clone)]
pub struct FreshnessDataset {
    samples: Vec<ImageSample>,
}

impl FreshnessDataset {
    pub fn new(samples: Vec<ImageSample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }
}

impl Dataset<ImageSample> for FreshnessDataset {
    fn get(&self, index: usize) -> Option<ImageSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// 読み込み・拡張済みの1枚
#[derive(Clone, Debug)]
pub struct DecodedImage {
    /// (C, H, W) の順で平坦化した [0,1] の画素値
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// 画像の読み込みと拡張
///
/// 読み込み時のリサイズは最近傍補間です。拡張の乱数はサンプルごとのシードから作るため、
/// バッチの組み方に関係なく同じ結果になります。
#[derive(Debug, Clone)]
pub struct ImageLoader {
    image_size: usize,
    augmenter: Option<Augmenter>,
}

impl ImageLoader {
    pub fn new(image_size: usize, augmenter: Option<Augmenter>) -> Self {
        Self {
            image_size,
            augmenter,
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn load(&self, sample: &ImageSample, seed: u64) -> Result<DecodedImage> {
        let img = load_rgb_image(&sample.path)?;
        let mut img = resize_square(&img, self.image_size, FilterType::Nearest);
        if let Some(augmenter) = &self.augmenter {
            let mut rng = StdRng::seed_from_u64(seed);
            img = augmenter.augment(&img, &mut rng);
        }
        Ok(DecodedImage {
            pixels: image_to_chw(&img),
            label: sample.label,
        })
    }

    /// 複数枚をまとめて読み込む（1枚でも失敗したらエラー）
    pub fn load_all(&self, samples: &[ImageSample], seeds: &[u64]) -> Result<Vec<DecodedImage>> {
        samples
            .iter()
            .zip(seeds)
            .map(|(sample, &seed)| self.load(sample, seed))
            .collect()
    }
}

/// サンプル単位の拡張シード
pub fn sample_seed(base: u64, epoch: usize, index: usize) -> u64 {
    // SplitMix64 の混合関数
    let mut z = base
        .wrapping_add((epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add((index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// バッチャー
#[derive(Clone, Debug)]
pub struct FreshnessBatcher {
    image_size: usize,
}

impl FreshnessBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, DecodedImage, FreshnessBatch<B>> for FreshnessBatcher {
    fn batch(&self, items: Vec<DecodedImage>, device: &B::Device) -> FreshnessBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            targets.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), device);

        FreshnessBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct FreshnessBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}
