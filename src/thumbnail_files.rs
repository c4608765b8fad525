use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;
pub const CUSTOM_JPEG_QUALITY: u8 = 100;
const CUSTOM_SUFFIX: &str = "_custom";

/// 缩略图文件管理：由视频路径推导确定的文件名，负责写入、查找和清理
#[derive(Debug, Clone)]
pub struct ThumbnailFiles {
    dir: PathBuf,
    quality: u8,
    custom_quality: u8,
}

impl ThumbnailFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quality: DEFAULT_JPEG_QUALITY,
            custom_quality: CUSTOM_JPEG_QUALITY,
        }
    }

    pub fn with_quality(mut self, quality: u8, custom_quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self.custom_quality = custom_quality.clamp(1, 100);
        self
    }

    /// 视频路径字符串的 SHA-256（小写十六进制）
    pub fn hash_name(video_path: &str) -> String {
        let digest = Sha256::digest(video_path.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn path_for(&self, video_path: &str) -> PathBuf {
        self.dir.join(format!("{}.jpg", Self::hash_name(video_path)))
    }

    pub fn custom_path_for(&self, video_path: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}.jpg", Self::hash_name(video_path), CUSTOM_SUFFIX))
    }

    pub fn is_custom(path: &Path) -> bool {
        path.file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.ends_with(CUSTOM_SUFFIX))
    }

    /// 写入自动生成的缩略图，并清理同一视频的旧文件
    pub fn write(&self, video_path: &str, image: &DynamicImage) -> Result<PathBuf> {
        let target = self.path_for(video_path);
        encode_jpeg(image, &target, self.quality)?;
        self.cleanup_stale(video_path, &target);
        Ok(target)
    }

    /// 写入用户自定义缩略图
    pub fn write_custom(&self, video_path: &str, image: &DynamicImage) -> Result<PathBuf> {
        let target = self.custom_path_for(video_path);
        encode_jpeg(image, &target, self.custom_quality)?;
        Ok(target)
    }

    /// 按原样写入已编码的 JPEG（备份导入）
    pub fn import_bytes(&self, video_path: &str, bytes: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let target = self.path_for(video_path);
        fs::write(&target, bytes)?;
        Ok(target)
    }

    /// 文件存在且非空时才返回路径；不存在不算错误
    pub fn existing(path: impl AsRef<Path>) -> Option<PathBuf> {
        let path = path.as_ref();
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path.to_path_buf()),
            _ => None,
        }
    }

    /// 删除同一视频哈希前缀下除 `keep` 和自定义缩略图以外的文件
    fn cleanup_stale(&self, video_path: &str, keep: &Path) {
        let prefix = Self::hash_name(video_path);
        for stale in self.files_with_prefix(&prefix) {
            if stale == keep || Self::is_custom(&stale) {
                continue;
            }
            match fs::remove_file(&stale) {
                Ok(()) => debug!("🗑️  [缩略图] 清理旧文件: {}", stale.display()),
                Err(e) => warn!("⚠️  [缩略图] 清理旧文件失败 {}: {}", stale.display(), e),
            }
        }
    }

    /// 删除该视频的全部缩略图文件（包括自定义），返回删除数量
    pub fn remove_all_for(&self, video_path: &str) -> usize {
        let prefix = Self::hash_name(video_path);
        self.files_with_prefix(&prefix)
            .into_iter()
            .filter(|file| fs::remove_file(file).is_ok())
            .count()
    }

    fn files_with_prefix(&self, prefix: &str) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(prefix))
            })
            .collect()
    }
}

/// JPEG 编码到文件，父目录按需创建
pub fn encode_jpeg(image: &DynamicImage, target: &Path, quality: u8) -> Result<()> {
    let start = Instant::now();
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    // JPEG 不支持透明通道
    let rgb = image.to_rgb8();
    let file = fs::File::create(target)?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality).encode_image(&rgb)?;
    debug!(
        "💾 [缩略图] 写入 {} ({}x{}, q={})，耗时: {}ms",
        target.display(),
        rgb.width(),
        rgb.height(),
        quality,
        start.elapsed().as_millis()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn sample() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 18, Rgb([10, 120, 200])))
    }

    #[test]
    fn test_hash_name_is_stable_sha256() {
        assert_eq!(
            ThumbnailFiles::hash_name("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(ThumbnailFiles::hash_name("/v/a.mp4").len(), 64);
    }

    #[test]
    fn test_write_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let files = ThumbnailFiles::new(dir.path().join("thumbs"));

        let written = files.write("/v/a.mp4", &sample()).unwrap();
        assert_eq!(written, files.path_for("/v/a.mp4"));
        assert!(ThumbnailFiles::existing(&written).is_some());
        assert!(ThumbnailFiles::existing(files.path_for("/v/b.mp4")).is_none());

        let decoded = image::open(&written).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 18));
    }

    #[test]
    fn test_write_removes_stale_variants_but_keeps_custom() {
        let dir = tempfile::tempdir().unwrap();
        let files = ThumbnailFiles::new(dir.path());
        let hash = ThumbnailFiles::hash_name("/v/a.mp4");

        let old = dir.path().join(format!("{}_old.jpg", hash));
        fs::write(&old, b"stale").unwrap();
        let custom = files.write_custom("/v/a.mp4", &sample()).unwrap();
        let other = files.write("/v/b.mp4", &sample()).unwrap();

        files.write("/v/a.mp4", &sample()).unwrap();

        assert!(!old.exists());
        assert!(custom.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_remove_all_for() {
        let dir = tempfile::tempdir().unwrap();
        let files = ThumbnailFiles::new(dir.path());
        files.write("/v/a.mp4", &sample()).unwrap();
        files.write_custom("/v/a.mp4", &sample()).unwrap();
        files.write("/v/b.mp4", &sample()).unwrap();

        assert_eq!(files.remove_all_for("/v/a.mp4"), 2);
        assert!(files.path_for("/v/b.mp4").exists());
    }

    #[test]
    fn test_empty_file_is_not_a_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.jpg");
        fs::write(&empty, b"").unwrap();
        assert!(ThumbnailFiles::existing(&empty).is_none());
    }
}
