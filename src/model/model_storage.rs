//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（モデル構造、クラス順序、学習結果）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::error::FreshnessError;
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 一時ファイルに書き込んでからリネームする
///
/// 途中で失敗しても出力先に不完全なファイルが残りません。
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .context(format!("Failed to create parent directory: {:?}", parent))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .context(format!("Failed to create temporary file in {:?}", parent))?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("Failed to persist {:?}: {}", path, e.error))?;
    Ok(())
}

/// 保存先のパスを決定（.gzで終わらない場合は拡張子を付け替え）
pub fn archive_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 実際に書き込んだパスを返します。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = archive_path(output_path);

    // Gzip圧縮したtarをメモリ上で組み立てる
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())
        .context("Failed to add metadata.json to tar")?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)
        .context("Failed to add model.bin to tar")?;

    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?;
    let bytes = encoder.finish().context("Failed to finish gzip stream")?;

    write_atomically(&tar_gz_path, &bytes)?;
    Ok(tar_gz_path)
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(())
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    if !tar_gz_path.exists() {
        return Err(FreshnessError::ModelNotFound(tar_gz_path.to_path_buf()).into());
    }
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut archive = open_archive(tar_gz_path)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        if path.to_str() == Some(METADATA_ENTRY) {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return ModelMetadata::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// メタデータをログに出力
pub fn log_metadata_info(metadata: &ModelMetadata) {
    tracing::info!("=== モデルメタデータ ===");
    tracing::info!("クラス: {}", metadata.class_labels.join(", "));
    tracing::info!(
        "入力サイズ: {}x{}, alpha={}",
        metadata.model.image_size,
        metadata.model.image_size,
        metadata.model.width_multiplier
    );
    tracing::info!(
        "学習/検証サンプル: {} / {}",
        metadata.num_train_samples,
        metadata.num_val_samples
    );
    for phase in &metadata.phases {
        let best = phase
            .best_val_loss
            .map(|v| format!("{:.4}", v))
            .unwrap_or_else(|| "-".to_string());
        tracing::info!(
            "フェーズ {}: {}エポック, best val_loss={}{}",
            phase.name,
            phase.epochs_run,
            best,
            if phase.stopped_early { " (早期終了)" } else { "" }
        );
    }
    tracing::info!("学習日時: {}", metadata.trained_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ModelConfig;

    fn sample_metadata() -> ModelMetadata {
        ModelMetadata::new(
            ModelConfig::new(2),
            vec!["fresh".to_string(), "rotten".to_string()],
            8,
            2,
            vec![],
        )
    }

    #[test]
    fn test_archive_path_extension() {
        assert_eq!(
            archive_path(Path::new("out/model_freshness")),
            PathBuf::from("out/model_freshness.tar.gz")
        );
        assert_eq!(
            archive_path(Path::new("out/model.tar.gz")),
            PathBuf::from("out/model.tar.gz")
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/model_freshness.tar.gz");
        let written = save_model_with_metadata(&path, &sample_metadata(), &[1, 2, 3, 4]).unwrap();
        assert_eq!(written, path);

        let (metadata, binary) = load_model_with_metadata(&path).unwrap();
        assert_eq!(metadata.class_labels.len(), 2);
        assert_eq!(binary, vec![1, 2, 3, 4]);
        assert_eq!(load_metadata(&path).unwrap().model.num_classes, 2);
    }

    #[test]
    fn test_missing_archive_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_model_with_metadata(&dir.path().join("absent.tar.gz")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FreshnessError>(),
            Some(FreshnessError::ModelNotFound(_))
        ));
    }
}
