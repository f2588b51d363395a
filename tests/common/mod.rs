//! 結合テスト共通の小さなデータセットと設定

#![allow(dead_code)]

use std::path::Path;

use freshness_lib::{AppConfig, DeviceType};

pub const CLASSES: [&str; 2] = ["freshapples", "rottenapples"];

pub fn write_dataset(root: &Path, images_per_class: u32) {
    for (c, class) in CLASSES.iter().enumerate() {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..images_per_class {
            let base = if c == 0 { [40u8, 180, 60] } else { [120u8, 70, 30] };
            let img = image::RgbImage::from_fn(36, 36, |x, y| {
                let v = ((x + y + i * 7) % 32) as u8;
                image::Rgb([base[0] + v, base[1] + v, base[2] + v])
            });
            img.save(dir.join(format!("img_{}.png", i))).unwrap();
        }
    }
}

/// CPU・32px・alpha 0.35 の縮小設定（各フェーズ1エポック）
pub fn small_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.device_type = DeviceType::Cpu;
    config.paths.dataset_dir = root.join("dataset");
    config.paths.model_path = root.join("out").join("model_freshness.tar.gz");
    config.paths.class_index_path = root.join("out").join("class_indices.json");
    config.paths.quantized_model_path = root.join("out").join("model_freshness_int8.frq8");
    config.model.image_size = 32;
    config.model.width_multiplier = 0.35;
    config.model.hidden_units = 16;
    config.training.batch_size = 4;
    config.training.validation_split = 0.25;
    config.training.head.epochs = 1;
    config.training.fine_tune.epochs = 1;
    config.conversion.calibration_samples = 6;
    config.conversion.calibration_batch_size = 3;
    config
}
