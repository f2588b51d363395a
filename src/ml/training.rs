//! モデル学習
//!
//! 2フェーズの転移学習を行います。
//! 1. ヘッドのみ学習（バックボーンの出力は勾配を切る）
//! 2. バックボーン末尾の層とヘッドを低い学習率で微調整
//!
//! モデルは各フェーズに値として渡され、学習後のモデルが返されます。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::ml::augmentation::Augmenter;
use crate::ml::backbone::{BackboneSpec, BackboneTail};
use crate::ml::callbacks::{EarlyStopping, ReduceLrOnPlateau};
use crate::ml::dataset::{
    sample_seed, DatasetSplit, DecodedImage, FreshnessBatch, FreshnessBatcher, ImageLoader, ImageSample,
    ScannedDataset,
};
use crate::ml::ml_model::{ClassifierHead, FreshnessClassifier, ModelConfig};
use crate::model::class_index::ClassIndex;
use crate::model::config::AppConfig;
use crate::model::model_metadata::{ModelMetadata, PhaseSummary};
use crate::model::model_storage::{log_metadata_info, save_model_with_metadata};

/// 検証データ拡張用のシードをずらす値
const VALIDATION_SEED_SALT: u64 = 0x5641_4C49_4441_5445;

/// 学習フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    /// ヘッドのみ学習
    Head,
    /// バックボーン末尾を含めて微調整
    FineTune,
}

impl TrainingPhase {
    pub fn name(&self) -> &'static str {
        match self {
            TrainingPhase::Head => "head",
            TrainingPhase::FineTune => "fine_tune",
        }
    }
}

impl std::fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 1フェーズ分の計画
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhasePlan {
    pub phase: TrainingPhase,
    pub epochs: usize,
    pub learning_rate: f64,
    /// 学習対象にするバックボーン末尾の層数（0ならバックボーンは凍結）
    pub trainable_backbone_layers: usize,
}

impl PhasePlan {
    /// 設定から2フェーズ分の計画を作る
    pub fn from_config(config: &AppConfig) -> [PhasePlan; 2] {
        let t = &config.training;
        [
            PhasePlan {
                phase: TrainingPhase::Head,
                epochs: t.head.epochs,
                learning_rate: t.head.learning_rate,
                trainable_backbone_layers: 0,
            },
            PhasePlan {
                phase: TrainingPhase::FineTune,
                epochs: t.fine_tune.epochs,
                learning_rate: t.fine_tune.learning_rate,
                trainable_backbone_layers: t.fine_tune_layers,
            },
        ]
    }
}

/// エポックごとの結果
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub phase: TrainingPhase,
    /// フェーズ内のエポック番号（0始まり）
    pub epoch: usize,
    pub epochs: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    /// このエポックで使った学習率
    pub learning_rate: f64,
}

/// 1フェーズの結果
pub struct PhaseOutcome<B: AutodiffBackend> {
    pub model: FreshnessClassifier<B>,
    pub history: Vec<EpochReport>,
    pub summary: PhaseSummary,
}

/// 学習全体の結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// 書き込んだモデルアーカイブ
    pub model_path: PathBuf,
    /// 書き込んだクラスインデックス
    pub class_index_path: PathBuf,
    pub class_index: ClassIndex,
    pub metadata: ModelMetadata,
    pub history: Vec<EpochReport>,
}

/// 微調整フェーズで勾配を取り出す対象
#[derive(Module, Debug)]
struct TrainableParams<B: Backend> {
    head: ClassifierHead<B>,
    tail: BackboneTail<B>,
}

/// 正解数を数える
fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size] = targets.dims();
    let predictions = logits.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

/// 事前学習済みのバックボーンの重みを読み込む（無ければランダム初期化のまま）
pub fn load_pretrained_backbone<B: Backend>(
    model: FreshnessClassifier<B>,
    weights: Option<&Path>,
    device: &B::Device,
) -> Result<FreshnessClassifier<B>> {
    let path = match weights {
        Some(path) if path.exists() => path,
        Some(path) => {
            tracing::warn!(
                "バックボーンの重みが見つかりません: {}。ランダム初期化で学習します",
                path.display()
            );
            return Ok(model);
        }
        None => {
            tracing::warn!("バックボーンの重みが指定されていません。ランダム初期化で学習します");
            return Ok(model);
        }
    };

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let backbone = model
        .backbone
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| anyhow::anyhow!("バックボーンの重みの読み込みエラー: {:?}", e))?;
    tracing::info!("バックボーンの重みを読み込みました: {}", path.display());

    Ok(FreshnessClassifier {
        backbone,
        head: model.head,
    })
}

/// フェーズ実行に必要な共通の状態
struct PhaseRunner<'a, B: AutodiffBackend> {
    config: &'a AppConfig,
    device: B::Device,
    split: &'a DatasetSplit,
    spec: BackboneSpec,
    train_loader: ImageLoader,
    val_loader: ImageLoader,
    batcher: FreshnessBatcher,
    /// 全フェーズ通算のエポック数（拡張の乱数に使う）
    epochs_done: usize,
}

impl<'a, B: AutodiffBackend> PhaseRunner<'a, B> {
    fn new(config: &'a AppConfig, split: &'a DatasetSplit, spec: BackboneSpec, device: B::Device) -> Self {
        let image_size = config.model.image_size;
        let augmenter = Augmenter::new(config.augmentation.clone());
        let val_augmenter = config.training.augment_validation.then(|| augmenter.clone());
        Self {
            config,
            device,
            split,
            spec,
            train_loader: ImageLoader::new(image_size, Some(augmenter)),
            val_loader: ImageLoader::new(image_size, val_augmenter),
            batcher: FreshnessBatcher::new(image_size),
            epochs_done: 0,
        }
    }

    fn load_batch<BB: Backend<Device = B::Device>>(
        &self,
        loader: &ImageLoader,
        samples: &[ImageSample],
        seeds: &[u64],
    ) -> Result<FreshnessBatch<BB>> {
        let decoded = loader.load_all(samples, seeds)?;
        Ok(Batcher::<BB, DecodedImage, FreshnessBatch<BB>>::batch(
            &self.batcher,
            decoded,
            &self.device,
        ))
    }

    /// 1フェーズ分の学習
    fn run_phase<F>(
        &mut self,
        mut model: FreshnessClassifier<B>,
        plan: PhasePlan,
        progress_callback: &mut F,
    ) -> Result<PhaseOutcome<B>>
    where
        F: FnMut(&EpochReport),
    {
        let t = &self.config.training;
        let batch_size = t.batch_size;
        let train_samples = self.split.train.samples();

        let boundary = (plan.trainable_backbone_layers > 0)
            .then(|| self.spec.freeze_boundary(plan.trainable_backbone_layers));
        match boundary {
            Some(b) => {
                let tail = model.backbone.tail(&self.spec, b);
                tracing::info!(
                    "=== フェーズ {}: バックボーン末尾{}層 + ヘッドを学習 (畳み込み・BN {} 個), {}エポック, lr={} ===",
                    plan.phase,
                    plan.trainable_backbone_layers,
                    tail.num_layers(),
                    plan.epochs,
                    plan.learning_rate
                );
            }
            None => tracing::info!(
                "=== フェーズ {}: ヘッドのみ学習, {}エポック, lr={} ===",
                plan.phase,
                plan.epochs,
                plan.learning_rate
            ),
        }

        // Keras の Adam と同じ epsilon
        let mut optimizer = AdamConfig::new()
            .with_epsilon(1e-7)
            .init::<B, FreshnessClassifier<B>>();
        let mut plateau = ReduceLrOnPlateau::new(t.plateau.clone());
        let mut early_stopping = EarlyStopping::new(t.early_stopping.clone());
        let mut lr = plan.learning_rate;
        let mut history = Vec::new();
        let mut stopped_early = false;

        let mut order: Vec<usize> = (0..train_samples.len()).collect();
        let mut shuffle_rng = StdRng::seed_from_u64(t.seed.wrapping_add(self.epochs_done as u64));

        for epoch in 0..plan.epochs {
            let global_epoch = self.epochs_done;
            order.shuffle(&mut shuffle_rng);

            let mut loss_sum = 0.0;
            let mut correct = 0;
            let mut seen = 0;

            for chunk in order.chunks(batch_size) {
                let samples: Vec<ImageSample> =
                    chunk.iter().map(|&i| train_samples[i].clone()).collect();
                let seeds: Vec<u64> = chunk
                    .iter()
                    .map(|&i| sample_seed(t.seed, global_epoch, i))
                    .collect();
                let batch: FreshnessBatch<B> =
                    self.load_batch(&self.train_loader, &samples, &seeds)?;
                let batch_len = samples.len();

                let logits = match boundary {
                    Some(_) => model.forward(batch.images),
                    None => model.forward_frozen_backbone(batch.images),
                };
                let output = model.classification_output(logits, batch.targets);

                let loss_value: f64 = output.loss.clone().into_scalar().elem();
                loss_sum += loss_value * batch_len as f64;
                correct += count_correct(output.output.clone(), output.targets.clone());
                seen += batch_len;

                // 学習対象のパラメータの勾配だけを取り出す
                let mut grads = output.loss.backward();
                let grads = match boundary {
                    Some(b) => {
                        let trainable = TrainableParams {
                            head: model.head.clone(),
                            tail: model.backbone.tail(&self.spec, b),
                        };
                        GradientsParams::from_module(&mut grads, &trainable)
                    }
                    None => GradientsParams::from_module(&mut grads, &model.head),
                };

                model = optimizer.step(lr, model, grads);
            }

            let loss = loss_sum / seen.max(1) as f64;
            let accuracy = correct as f64 / seen.max(1) as f64;
            let (val_loss, val_accuracy) = self.evaluate(&model.valid(), global_epoch)?;

            let report = EpochReport {
                phase: plan.phase,
                epoch,
                epochs: plan.epochs,
                loss,
                accuracy,
                val_loss,
                val_accuracy,
                learning_rate: lr,
            };
            tracing::info!(
                "[{}] Epoch {}/{}: loss={:.4} acc={:.2}% val_loss={:.4} val_acc={:.2}% lr={:.3e}",
                plan.phase,
                epoch + 1,
                plan.epochs,
                loss,
                accuracy * 100.0,
                val_loss,
                val_accuracy * 100.0,
                lr
            );
            progress_callback(&report);
            history.push(report);
            self.epochs_done += 1;

            if early_stopping.on_epoch_end(epoch, val_loss, &model) {
                tracing::info!(
                    "[{}] 検証損失が改善しないため Epoch {} で早期終了します",
                    plan.phase,
                    epoch + 1
                );
                stopped_early = true;
                if let Some(best) = early_stopping.take_best_model() {
                    tracing::info!(
                        "最良エポック ({}) の重みに戻します",
                        early_stopping.best_epoch().map(|e| e + 1).unwrap_or(1)
                    );
                    model = best;
                }
                break;
            }
            lr = plateau.on_epoch_end(val_loss, lr);
        }

        let best = early_stopping.best();
        let summary = PhaseSummary {
            name: plan.phase.name().to_string(),
            epochs_run: history.len(),
            best_val_loss: best.is_finite().then_some(best),
            stopped_early,
        };

        Ok(PhaseOutcome {
            model,
            history,
            summary,
        })
    }

    /// 検証データで損失と正解率を計算（サンプル数で重み付け）
    fn evaluate(
        &self,
        model: &FreshnessClassifier<B::InnerBackend>,
        global_epoch: usize,
    ) -> Result<(f64, f64)> {
        let batch_size = self.config.training.batch_size;
        let val_seed = self.config.training.seed ^ VALIDATION_SEED_SALT;
        let samples = self.split.validation.samples();

        let mut loss_sum = 0.0;
        let mut correct = 0;
        for (chunk_index, chunk) in samples.chunks(batch_size).enumerate() {
            let offset = chunk_index * batch_size;
            let seeds: Vec<u64> = (0..chunk.len())
                .map(|i| sample_seed(val_seed, global_epoch, offset + i))
                .collect();
            let batch: FreshnessBatch<B::InnerBackend> =
                self.load_batch(&self.val_loader, chunk, &seeds)?;

            let output = model.forward_classification(batch.images, batch.targets);
            let loss_value: f64 = output.loss.into_scalar().elem();
            loss_sum += loss_value * chunk.len() as f64;
            correct += count_correct(output.output, output.targets);
        }

        let n = samples.len().max(1) as f64;
        Ok((loss_sum / n, correct as f64 / n))
    }
}

/// 2フェーズの学習を実行し、モデルアーカイブとクラスインデックスを保存
///
/// データセットの問題は学習ループに入る前に検出され、その場合は何も書き込みません。
///
/// # 引数
/// - `config`: アプリケーション設定
/// - `device`: 学習に使うデバイス
/// - `progress_callback`: エポックごとに呼ばれるコールバック
pub fn train_model<B, F>(
    config: &AppConfig,
    device: &B::Device,
    mut progress_callback: F,
) -> Result<TrainingReport>
where
    B: AutodiffBackend,
    F: FnMut(&EpochReport),
{
    config.validate()?;

    // === データセットの検証 ===
    let scanned = ScannedDataset::scan(&config.paths.dataset_dir)?;
    let split = scanned.split(config.training.validation_split)?;
    let class_index = scanned.class_index.clone();
    tracing::info!("学習データ: {} 枚", split.train.len());
    tracing::info!("検証データ: {} 枚", split.validation.len());
    tracing::info!(
        "クラス順序 ({}個): {}",
        class_index.num_classes(),
        class_index.labels().join(", ")
    );

    // === モデル構築 ===
    let model_config = ModelConfig::from_settings(class_index.num_classes(), &config.model);
    let spec = model_config.backbone_spec();
    tracing::info!(
        "モデル設定: {} クラス, 入力サイズ: {}x{}, alpha={}, バックボーン {} 層",
        model_config.num_classes,
        model_config.image_size,
        model_config.image_size,
        model_config.width_multiplier,
        spec.layers().len()
    );
    // 初期値・dropout の乱数もシードで固定
    B::seed(device, config.training.seed);
    let model = model_config.init::<B>(device);
    let model = load_pretrained_backbone(model, config.paths.backbone_weights.as_deref(), device)?;

    // === 学習 ===
    let mut runner = PhaseRunner::<B>::new(config, &split, spec, device.clone());
    let mut model = model;
    let mut history = Vec::new();
    let mut summaries = Vec::new();
    for plan in PhasePlan::from_config(config) {
        let outcome = runner.run_phase(model, plan, &mut progress_callback)?;
        model = outcome.model;
        history.extend(outcome.history);
        summaries.push(outcome.summary);
    }

    // === 保存 ===
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = recorder
        .record(model.valid().into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))?;
    tracing::info!(
        "モデルバイナリサイズ: {} バイト ({:.2} MB)",
        model_binary.len(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );

    let metadata = ModelMetadata::new(
        model_config,
        class_index.labels().to_vec(),
        split.train.len(),
        split.validation.len(),
        summaries,
    );
    let model_path = save_model_with_metadata(&config.paths.model_path, &metadata, &model_binary)?;
    class_index
        .save(&config.paths.class_index_path)
        .context("Failed to save class index")?;
    log_metadata_info(&metadata);

    Ok(TrainingReport {
        model_path,
        class_index_path: config.paths.class_index_path.clone(),
        class_index,
        metadata,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    use crate::model::config::EarlyStoppingSettings;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_phase_plan_defaults() {
        let [head, fine_tune] = PhasePlan::from_config(&AppConfig::default());
        assert_eq!(head.phase, TrainingPhase::Head);
        assert_eq!(head.trainable_backbone_layers, 0);
        assert_eq!(head.epochs, 12);
        assert_eq!(fine_tune.phase, TrainingPhase::FineTune);
        assert_eq!(fine_tune.trainable_backbone_layers, 50);
        assert_eq!(fine_tune.epochs, 6);
    }

    #[test]
    fn test_count_correct() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.1, 0.9], [0.8, 0.2], [0.3, 0.7]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([1, 1, 1], &device);
        assert_eq!(count_correct(logits, targets), 2);
    }

    #[test]
    fn test_missing_backbone_weights_keeps_model() {
        let device = Default::default();
        let model = ModelConfig::new(2)
            .with_image_size(32)
            .with_width_multiplier(0.35)
            .init::<TestBackend>(&device);
        let model =
            load_pretrained_backbone(model, Some(Path::new("/nonexistent/backbone.mpk")), &device)
                .unwrap();
        assert_eq!(model.num_classes(), 2);
    }

    #[test]
    fn test_head_phase_only_updates_head() {
        type B = Autodiff<TestBackend>;
        let device = Default::default();
        let model = ModelConfig::new(2)
            .with_image_size(32)
            .with_width_multiplier(0.35)
            .init::<B>(&device);
        let before_stem: Vec<f32> = model.backbone.stem.conv.weight.val().into_data().to_vec().unwrap();
        let before_head: Vec<f32> = model.head.output.weight.val().into_data().to_vec().unwrap();

        let images = Tensor::<B, 4>::ones([2, 3, 32, 32], &device);
        let targets = Tensor::<B, 1, Int>::from_ints([0, 1], &device);
        let logits = model.forward_frozen_backbone(images);
        let output = model.classification_output(logits, targets);
        let mut grads = output.loss.backward();
        let grads = GradientsParams::from_module(&mut grads, &model.head);

        let mut optimizer = AdamConfig::new().init::<B, FreshnessClassifier<B>>();
        let model = optimizer.step(1e-2, model, grads);

        let after_stem: Vec<f32> = model.backbone.stem.conv.weight.val().into_data().to_vec().unwrap();
        let after_head: Vec<f32> = model.head.output.weight.val().into_data().to_vec().unwrap();
        assert_eq!(before_stem, after_stem);
        assert_ne!(before_head, after_head);
    }

    fn write_tiny_dataset(root: &Path) {
        for (c, class) in ["fresh", "rotten"].iter().enumerate() {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..3u8 {
                let color = if c == 0 { [30 + i * 10, 160, 40] } else { [120, 60 + i * 10, 20] };
                image::RgbImage::from_pixel(36, 36, image::Rgb(color))
                    .save(dir.join(format!("{}.png", i)))
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_early_stop_restores_best_epoch_weights() {
        type B = Autodiff<TestBackend>;
        let dir = tempfile::tempdir().unwrap();
        write_tiny_dataset(dir.path());

        let mut config = AppConfig::default();
        config.model.image_size = 32;
        config.model.width_multiplier = 0.35;
        config.model.hidden_units = 8;
        config.model.dropout = 0.0;
        config.training.batch_size = 2;
        // 2エポック目以降は改善扱いにならず、patience 1 で打ち切り
        config.training.early_stopping = EarlyStoppingSettings {
            patience: 1,
            min_delta: 1e9,
            restore_best_weights: true,
        };

        let split = ScannedDataset::scan(dir.path()).unwrap().split(0.3).unwrap();
        let model_config = ModelConfig::from_settings(2, &config.model);
        let device: <B as Backend>::Device = Default::default();
        let initial = model_config.init::<B>(&device);
        let plan = |epochs| PhasePlan {
            phase: TrainingPhase::Head,
            epochs,
            learning_rate: 5e-2,
            trainable_backbone_layers: 0,
        };
        let head_weights = |model: &FreshnessClassifier<B>| -> Vec<f32> {
            model.head.output.weight.val().into_data().to_vec().unwrap()
        };

        // 1エポックだけ学習した結果が最良エポックの重み
        let mut runner = PhaseRunner::<B>::new(&config, &split, model_config.backbone_spec(), device.clone());
        let best = runner
            .run_phase(initial.clone(), plan(1), &mut |_: &EpochReport| {})
            .unwrap();
        assert!(!best.summary.stopped_early);

        let mut runner = PhaseRunner::<B>::new(&config, &split, model_config.backbone_spec(), device);
        let mut reports = Vec::new();
        let outcome = runner
            .run_phase(initial, plan(5), &mut |r: &EpochReport| reports.push(r.clone()))
            .unwrap();
        assert!(outcome.summary.stopped_early);
        assert_eq!(outcome.history.len(), 2);
        assert_eq!(reports.len(), 2);
        assert_eq!(outcome.summary.best_val_loss, Some(reports[0].val_loss));
        assert_eq!(head_weights(&outcome.model), head_weights(&best.model));
    }

    #[test]
    fn test_fine_tune_updates_only_tail() {
        type B = Autodiff<TestBackend>;
        let device = Default::default();
        let config = ModelConfig::new(2).with_image_size(32).with_width_multiplier(0.35);
        let spec = config.backbone_spec();
        let model = config.init::<B>(&device);
        let boundary = spec.freeze_boundary(50);

        let stem_before: Vec<f32> = model.backbone.stem.conv.weight.val().into_data().to_vec().unwrap();
        let last_before: Vec<f32> = model.backbone.last.conv.weight.val().into_data().to_vec().unwrap();

        let images = Tensor::<B, 4>::ones([2, 3, 32, 32], &device);
        let targets = Tensor::<B, 1, Int>::from_ints([0, 1], &device);
        let output = model.forward_classification(images, targets);
        let mut grads = output.loss.backward();
        let trainable = TrainableParams {
            head: model.head.clone(),
            tail: model.backbone.tail(&spec, boundary),
        };
        let grads = GradientsParams::from_module(&mut grads, &trainable);

        let mut optimizer = AdamConfig::new().init::<B, FreshnessClassifier<B>>();
        let model = optimizer.step(1e-2, model, grads);

        let stem_after: Vec<f32> = model.backbone.stem.conv.weight.val().into_data().to_vec().unwrap();
        let last_after: Vec<f32> = model.backbone.last.conv.weight.val().into_data().to_vec().unwrap();
        assert_eq!(stem_before, stem_after);
        assert_ne!(last_before, last_after);
    }
}
