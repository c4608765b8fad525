use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::fingerprint::path_key;
use crate::metadata::VideoMetadata;
use crate::store::MetadataStore;
use crate::thumbnail_files::ThumbnailFiles;

const MANIFEST_NAME: &str = "metadata.json";
const THUMBNAIL_PREFIX: &str = "thumbnails/";

/// ZIP 备份中 `metadata.json` 的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupEntry {
    path: String,
    last_modified: i64,
    duration_millis: Option<i64>,
    width: Option<i32>,
    height: Option<i32>,
    /// `thumbnails/` 下的文件名，没有缩略图时为 null
    thumbnail_filename: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupManifest {
    video_metadata: Vec<BackupEntry>,
}

/// 默认导出文件名：`video_thumbnails_<yyyy-MM-dd_HH-mm-ss>.zip`
pub fn default_export_file_name() -> String {
    chrono::Local::now()
        .format("video_thumbnails_%Y-%m-%d_%H-%M-%S.zip")
        .to_string()
}

/// 以 JSON 数组导出全部元数据记录，返回记录数
pub fn export_json<W: Write>(store: &MetadataStore, writer: W) -> Result<usize> {
    let records = store.get_all()?;
    serde_json::to_writer_pretty(writer, &records)?;
    info!("📤 [备份] 导出 {} 条元数据 (JSON)", records.len());
    Ok(records.len())
}

/// 导入 JSON 数组，已有记录按路径覆盖
pub fn import_json<R: Read>(store: &MetadataStore, reader: R) -> Result<usize> {
    let records: Vec<VideoMetadata> = serde_json::from_reader(reader)?;
    for record in &records {
        store.insert_or_replace(record)?;
    }
    info!("📥 [备份] 导入 {} 条元数据 (JSON)", records.len());
    Ok(records.len())
}

/// 导出为 ZIP：`metadata.json` + `thumbnails/<序号>.jpg`（原样复制）
pub fn export_zip(store: &MetadataStore, target: &Path) -> Result<usize> {
    let records = store.get_all()?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut zip = ZipWriter::new(BufWriter::new(File::create(target)?));

    let mut entries = Vec::with_capacity(records.len());
    let mut thumbnail_count = 0usize;
    for record in records {
        let mut thumbnail_filename = None;
        if let Some(source) = record
            .thumbnail_path
            .as_deref()
            .and_then(|p| ThumbnailFiles::existing(p))
        {
            let name = format!("{}.jpg", thumbnail_count);
            // JPEG 已经压缩过，直接存储
            let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
            zip.start_file(format!("{}{}", THUMBNAIL_PREFIX, name), stored)?;
            std::io::copy(&mut File::open(&source)?, &mut zip)?;
            thumbnail_count += 1;
            thumbnail_filename = Some(name);
        } else if let Some(missing) = &record.thumbnail_path {
            debug!("[备份] 缩略图文件不存在，跳过: {}", missing);
        }

        entries.push(BackupEntry {
            path: record.path,
            last_modified: record.last_modified,
            duration_millis: record.duration_millis,
            width: record.width,
            height: record.height,
            thumbnail_filename,
        });
    }

    let manifest = BackupManifest {
        video_metadata: entries,
    };
    zip.start_file(MANIFEST_NAME, SimpleFileOptions::default())?;
    zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
    zip.finish()?.flush()?;

    info!(
        "📤 [备份] 导出 {} 条元数据，{} 张缩略图: {}",
        manifest.video_metadata.len(),
        thumbnail_count,
        target.display()
    );
    Ok(manifest.video_metadata.len())
}

/// 从 ZIP 恢复：缩略图写回 `<sha256>.jpg`，记录指向新位置
pub fn import_zip(store: &MetadataStore, files: &ThumbnailFiles, source: &Path) -> Result<usize> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(source)?))?;

    let mut manifest = None;
    let mut thumbnails: HashMap<String, Vec<u8>> = HashMap::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name == MANIFEST_NAME {
            let mut json = String::new();
            entry.read_to_string(&mut json)?;
            manifest = Some(serde_json::from_str::<BackupManifest>(&json)?);
        } else if let Some(file_name) = name.strip_prefix(THUMBNAIL_PREFIX) {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            thumbnails.insert(file_name.to_string(), bytes);
        }
    }

    let manifest =
        manifest.ok_or_else(|| Error::InvalidBackup(format!("缺少 {}", MANIFEST_NAME)))?;

    let mut imported = 0usize;
    for entry in manifest.video_metadata {
        let mut thumbnail_path = None;
        if let Some(file_name) = &entry.thumbnail_filename {
            match thumbnails.get(file_name) {
                Some(bytes) => {
                    let restored = files.import_bytes(&entry.path, bytes)?;
                    thumbnail_path = Some(path_key(&restored));
                }
                None => warn!("⚠️  [备份] 备份中缺少缩略图 {}，跳过 {}", file_name, entry.path),
            }
            if thumbnail_path.is_none() {
                continue;
            }
        }

        store.insert_or_replace(&VideoMetadata {
            path: entry.path,
            last_modified: entry.last_modified,
            duration_millis: entry.duration_millis,
            thumbnail_path,
            width: entry.width,
            height: entry.height,
        })?;
        imported += 1;
    }

    info!("📥 [备份] 从 {} 导入 {} 条元数据", source.display(), imported);
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, thumbnail: Option<String>) -> VideoMetadata {
        VideoMetadata {
            path: path.to_string(),
            last_modified: 1_650_000_000_000,
            duration_millis: Some(61_500),
            thumbnail_path: thumbnail,
            width: Some(1920),
            height: Some(1080),
        }
    }

    #[test]
    fn test_default_export_file_name() {
        let name = default_export_file_name();
        assert!(name.starts_with("video_thumbnails_"));
        assert!(name.ends_with(".zip"));
        assert_eq!(name.len(), "video_thumbnails_".len() + 19 + 4);
    }

    #[test]
    fn test_json_round_trip() {
        let source = MetadataStore::open_in_memory().unwrap();
        source.insert_or_replace(&record("/v/a.mp4", Some("/t/a.jpg".into()))).unwrap();
        let mut sparse = VideoMetadata::new("/v/b.mp4", 5);
        sparse.duration_millis = None;
        source.insert_or_replace(&sparse).unwrap();

        let mut buffer = Vec::new();
        assert_eq!(export_json(&source, &mut buffer).unwrap(), 2);

        let json: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["durationMillis"], 61_500);
        assert_eq!(json[0]["lastModified"], 1_650_000_000_000i64);

        let target = MetadataStore::open_in_memory().unwrap();
        assert_eq!(import_json(&target, buffer.as_slice()).unwrap(), 2);
        assert_eq!(target.get_all().unwrap(), source.get_all().unwrap());
    }

    #[test]
    fn test_zip_round_trip_restores_images() {
        let dir = tempfile::tempdir().unwrap();
        let original_thumb = dir.path().join("orig.jpg");
        let jpeg_bytes: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        std::fs::write(&original_thumb, &jpeg_bytes).unwrap();

        let source = MetadataStore::open_in_memory().unwrap();
        source
            .insert_or_replace(&record("/v/a.mp4", Some(path_key(&original_thumb))))
            .unwrap();
        source.insert_or_replace(&record("/v/b.mp4", None)).unwrap();

        let archive = dir.path().join("out").join(default_export_file_name());
        assert_eq!(export_zip(&source, &archive).unwrap(), 2);

        let target = MetadataStore::open_in_memory().unwrap();
        let files = ThumbnailFiles::new(dir.path().join("restored"));
        assert_eq!(import_zip(&target, &files, &archive).unwrap(), 2);

        let restored = target.get_by_path("/v/a.mp4").unwrap().unwrap();
        let expected_path = files.path_for("/v/a.mp4");
        assert_eq!(restored.thumbnail_path, Some(path_key(&expected_path)));
        assert_eq!(std::fs::read(&expected_path).unwrap(), jpeg_bytes);
        assert_eq!(
            VideoMetadata {
                thumbnail_path: None,
                ..restored
            },
            record("/v/a.mp4", None)
        );

        assert_eq!(target.get_by_path("/v/b.mp4").unwrap().unwrap(), record("/v/b.mp4", None));
    }

    #[test]
    fn test_zip_without_manifest_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("empty.zip");
        let mut zip = ZipWriter::new(File::create(&archive).unwrap());
        zip.start_file("thumbnails/0.jpg", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"jpeg").unwrap();
        zip.finish().unwrap();

        let store = MetadataStore::open_in_memory().unwrap();
        let files = ThumbnailFiles::new(dir.path().join("restored"));
        assert!(matches!(
            import_zip(&store, &files, &archive),
            Err(Error::InvalidBackup(_))
        ));
    }
}
