use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fingerprint::{path_key, Fingerprint};
use crate::metadata::{VideoMetadata, VideoThumbnail};
use crate::repository::VideoMetadataRepository;
use crate::thumbnail_files::{encode_jpeg, CUSTOM_JPEG_QUALITY};

/// 一个视频的多张幻灯片缩略图（`video_thumbnails` 表）
pub struct ThumbnailSet {
    repository: Arc<VideoMetadataRepository>,
    dir: PathBuf,
}

impl ThumbnailSet {
    pub fn new(repository: Arc<VideoMetadataRepository>, dir: impl Into<PathBuf>) -> Self {
        Self {
            repository,
            dir: dir.into(),
        }
    }

    /// 按显示顺序排列
    pub fn thumbnails_for_video(&self, video: &Path) -> Result<Vec<VideoThumbnail>> {
        self.repository.store().thumbnails_for_video(&path_key(video))
    }

    /// 默认缩略图，没有设置时取第一张
    pub fn default_thumbnail(&self, video: &Path) -> Result<Option<VideoThumbnail>> {
        let key = path_key(video);
        let store = self.repository.store();
        match store.default_thumbnail(&key)? {
            Some(thumbnail) => Ok(Some(thumbnail)),
            None => store.first_thumbnail(&key),
        }
    }

    /// 复制一张图片作为新的缩略图，排在最后
    pub fn add_thumbnail(
        &self,
        video: &Path,
        image: &Path,
        timestamp_ms: i64,
        is_default: bool,
    ) -> Result<VideoThumbnail> {
        let target = self.new_file_name(video, timestamp_ms);
        fs::create_dir_all(&self.dir)?;
        fs::copy(image, &target)?;
        self.insert(video, target, timestamp_ms, is_default)
    }

    /// 从视频中截取 `timestamp_ms` 处的帧作为新的缩略图
    pub fn capture_thumbnail(&self, video: &Path, timestamp_ms: i64, is_default: bool) -> Result<VideoThumbnail> {
        let frame = self
            .repository
            .extractor()
            .frame_at_timestamp(video, timestamp_ms)?
            .ok_or_else(|| Error::extraction(video, format!("{}ms 处没有可用的帧", timestamp_ms)))?;

        let target = self.new_file_name(video, timestamp_ms);
        encode_jpeg(&frame, &target, CUSTOM_JPEG_QUALITY)?;
        self.insert(video, target, timestamp_ms, is_default)
    }

    /// 设为默认；重复设置同一张结果不变
    pub fn set_default(&self, thumbnail: &VideoThumbnail) -> Result<bool> {
        self.repository
            .store()
            .set_default_thumbnail(&thumbnail.video_path, thumbnail.id)
    }

    /// 把不晚于 `position_ms` 的最近一张设为默认
    pub fn set_default_at(&self, video: &Path, position_ms: i64) -> Result<Option<VideoThumbnail>> {
        let key = path_key(video);
        let store = self.repository.store();
        let Some(mut nearest) = store.nearest_thumbnail(&key, position_ms)? else {
            return Ok(None);
        };
        store.set_default_thumbnail(&key, nearest.id)?;
        nearest.is_default = true;
        Ok(Some(nearest))
    }

    /// 删除缩略图记录和图片文件
    pub fn delete_thumbnail(&self, thumbnail: &VideoThumbnail) -> Result<bool> {
        remove_image(&thumbnail.thumbnail_path);
        self.repository.store().delete_thumbnail(thumbnail.id)
    }

    pub fn delete_thumbnail_at(&self, video: &Path, position_ms: i64) -> Result<bool> {
        let nearest = self
            .repository
            .store()
            .nearest_thumbnail(&path_key(video), position_ms)?;
        match nearest {
            Some(thumbnail) => self.delete_thumbnail(&thumbnail),
            None => Ok(false),
        }
    }

    pub fn delete_all_thumbnails(&self, video: &Path) -> Result<usize> {
        let key = path_key(video);
        let store = self.repository.store();
        for thumbnail in store.thumbnails_for_video(&key)? {
            remove_image(&thumbnail.thumbnail_path);
        }
        let deleted = store.delete_all_thumbnails(&key)?;
        info!("🗑️  [幻灯片] 删除 {} 的 {} 张缩略图", key, deleted);
        Ok(deleted)
    }

    pub fn update_interval(&self, thumbnail: &VideoThumbnail, interval_ms: i64) -> Result<VideoThumbnail> {
        let mut updated = thumbnail.clone();
        updated.display_interval_ms = interval_ms.max(0);
        self.repository.store().update_thumbnail(&updated)?;
        Ok(updated)
    }

    /// 按给定顺序重新编号
    pub fn reorder(&self, thumbnails: &[VideoThumbnail]) -> Result<Vec<VideoThumbnail>> {
        let updated: Vec<VideoThumbnail> = thumbnails
            .iter()
            .enumerate()
            .map(|(index, t)| VideoThumbnail {
                display_order: index as i32,
                ..t.clone()
            })
            .collect();
        self.repository.store().update_thumbnails(&updated)?;
        Ok(updated)
    }

    fn insert(&self, video: &Path, target: PathBuf, timestamp_ms: i64, is_default: bool) -> Result<VideoThumbnail> {
        let key = self.ensure_record(video)?;
        let store = self.repository.store();

        let mut thumbnail = VideoThumbnail::new(key.clone(), path_key(&target), timestamp_ms);
        thumbnail.display_order = store.thumbnail_count(&key)? as i32;
        thumbnail.is_default = is_default;
        thumbnail.id = store.insert_thumbnail(&thumbnail)?;

        info!(
            "✅ [幻灯片] 添加缩略图 #{} ({}ms): {}",
            thumbnail.id,
            timestamp_ms,
            target.display()
        );
        Ok(thumbnail)
    }

    /// 缩略图行依赖 `video_metadata` 中的父记录
    fn ensure_record(&self, video: &Path) -> Result<String> {
        let key = path_key(video);
        let store = self.repository.store();
        if store.get_by_path(&key)?.is_some() {
            return Ok(key);
        }
        if let Err(e) = self.repository.probe(video) {
            warn!("⚠️  [幻灯片] 读取视频信息失败，写入空记录: {}", e);
            let last_modified = Fingerprint::of(video).map(|fp| fp.last_modified).unwrap_or(0);
            store.insert_or_replace(&VideoMetadata::new(key.clone(), last_modified))?;
        }
        Ok(key)
    }

    /// `<文件名>_<秒数:06>_<uuid 前 8 位>.jpg`
    fn new_file_name(&self, video: &Path, timestamp_ms: i64) -> PathBuf {
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.dir
            .join(format!("{}_{:06}_{}.jpg", stem, timestamp_ms / 1000, &id[..8]))
    }
}

fn remove_image(path: &str) {
    if let Err(e) = fs::remove_file(path) {
        debug!("[幻灯片] 删除图片失败 {}: {}", path, e);
    }
}
