use image::{ColorType, DynamicImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::extractor::{resample_to_fill, ExtractRequest, FrameExtractor, VideoProbe};
use crate::fingerprint::{path_key, Fingerprint};
use crate::metadata::VideoMetadata;
use crate::store::MetadataStore;
use crate::thumbnail_files::ThumbnailFiles;

/// 默认缩略图最大宽度
pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 1920;

/// 视频元数据仓库：以指纹判断存储记录是否有效，失效或缺失时调用取帧器重新计算并写回。
///
/// 所有方法都是阻塞的，异步调用方应在工作线程上使用（见 `cache`）。
pub struct VideoMetadataRepository {
    store: Arc<MetadataStore>,
    extractor: FrameExtractor,
    files: ThumbnailFiles,
    thumbnail_width: u32,
}

impl VideoMetadataRepository {
    pub fn new(store: Arc<MetadataStore>, extractor: FrameExtractor, files: ThumbnailFiles) -> Self {
        Self {
            store,
            extractor,
            files,
            thumbnail_width: DEFAULT_THUMBNAIL_WIDTH,
        }
    }

    pub fn with_thumbnail_width(mut self, width: u32) -> Self {
        self.thumbnail_width = width.max(1);
        self
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn extractor(&self) -> &FrameExtractor {
        &self.extractor
    }

    pub fn files(&self) -> &ThumbnailFiles {
        &self.files
    }

    /// 视频时长（毫秒）
    pub fn video_duration(&self, path: &Path) -> Result<Option<i64>> {
        Ok(self.probe(path)?.duration_ms)
    }

    /// 视频尺寸（已按旋转校正）
    pub fn video_dimensions(&self, path: &Path) -> Result<Option<(u32, u32)>> {
        Ok(self.probe(path)?.dimensions())
    }

    /// 宽高比，高度为 0 时返回 None
    pub fn video_aspect_ratio(&self, path: &Path) -> Result<Option<f32>> {
        Ok(self
            .video_dimensions(path)?
            .and_then(|(w, h)| (h > 0).then(|| w as f32 / h as f32)))
    }

    /// 时长和尺寸。指纹一致时直接使用存储记录（包括缺失值），否则重新探测。
    pub fn probe(&self, path: &Path) -> Result<VideoProbe> {
        let (fp, valid) = self.lookup(path)?;
        let record = match valid {
            Some(record) => record,
            None => self.refresh(path, fp)?,
        };
        Ok(VideoProbe {
            duration_ms: record.duration_millis,
            width: record.width.map(|w| w as u32),
            height: record.height.map(|h| h as u32),
            rotation: 0,
        })
    }

    /// 缩略图文件路径。
    ///
    /// 指纹一致且文件仍存在时直接返回（自定义缩略图始终优先）；否则重新取帧、写入文件并更新记录。
    /// 解码不到可用帧时返回 None。
    pub fn thumbnail_path(&self, path: &Path) -> Result<Option<PathBuf>> {
        let (fp, valid) = self.lookup(path)?;

        if let Some(existing) = valid
            .as_ref()
            .and_then(|r| r.thumbnail_path.as_deref())
            .and_then(|p| ThumbnailFiles::existing(p))
        {
            if ThumbnailFiles::is_custom(&existing) {
                debug!("[缩略图] 使用自定义缩略图: {}", existing.display());
            }
            return Ok(Some(existing));
        }

        let start = Instant::now();
        info!("🎞️  [缩略图] 生成缩略图: {}", path.display());

        let request = ExtractRequest::default().with_color(ColorType::Rgb8);
        let (frame, probe) = self.extractor.thumbnail_source(path, &request)?;

        let mut record = VideoMetadata::new(fp.path.clone(), fp.last_modified);
        record.duration_millis = probe.duration_ms;
        record.width = probe.width.map(|w| w as i32);
        record.height = probe.height.map(|h| h as i32);

        if frame.is_placeholder {
            warn!("⚠️  [缩略图] 没有可用的帧: {}", path.display());
            self.store.insert_or_replace(&record)?;
            return Ok(None);
        }

        let image = self.fit_width(frame.image);
        let written = self.files.write(&fp.path, &image)?;
        record.thumbnail_path = Some(path_key(&written));
        self.store.insert_or_replace(&record)?;

        info!(
            "✅ [缩略图] 完成 {} ({}x{})，耗时: {:.2}s",
            written.display(),
            image.width(),
            image.height(),
            start.elapsed().as_secs_f64()
        );
        Ok(Some(written))
    }

    /// 更新缩略图路径，修改时间取文件当前值；没有记录时返回 false
    pub fn update_thumbnail_path(&self, path: &Path, thumbnail_path: Option<&Path>) -> Result<bool> {
        let key = path_key(path);
        let Some(record) = self.store.get_by_path(&key)? else {
            return Ok(false);
        };
        let last_modified = Fingerprint::of(path)
            .map(|fp| fp.last_modified)
            .unwrap_or(record.last_modified);
        let thumbnail = thumbnail_path.map(path_key);
        self.store
            .update_thumbnail_path(&key, thumbnail.as_deref(), last_modified)
    }

    /// 文件移动或重命名后迁移记录
    pub fn update_path_for_file(&self, old_path: &Path, new_path: &Path) -> Result<bool> {
        let moved = self
            .store
            .rename_path(&path_key(old_path), &path_key(new_path))?;
        if moved {
            debug!(
                "[元数据] 路径迁移: {} -> {}",
                old_path.display(),
                new_path.display()
            );
        }
        Ok(moved)
    }

    /// 保存用户选择的缩略图，之后不会被自动生成的缩略图覆盖
    pub fn set_custom_thumbnail(&self, path: &Path, image: &DynamicImage) -> Result<PathBuf> {
        let (fp, valid) = self.lookup(path)?;
        let written = self.files.write_custom(&fp.path, image)?;

        let mut record = match valid {
            Some(record) => record,
            None => match self.refresh(path, fp.clone()) {
                Ok(record) => record,
                Err(e) => {
                    warn!("⚠️  [缩略图] 读取视频信息失败，仅保存自定义缩略图: {}", e);
                    VideoMetadata::new(fp.path.clone(), fp.last_modified)
                }
            },
        };
        record.thumbnail_path = Some(path_key(&written));
        self.store.insert_or_replace(&record)?;

        info!("✅ [缩略图] 已设置自定义缩略图: {}", written.display());
        Ok(written)
    }

    /// 删除记录（级联删除幻灯片缩略图记录）以及该视频的全部缩略图文件
    pub fn forget(&self, path: &Path) -> Result<bool> {
        let key = path_key(path);
        let deleted = self.store.delete_by_path(&key)?;
        let removed = self.files.remove_all_for(&key);
        debug!("[元数据] 删除 {}：记录 {}，文件 {}", key, deleted, removed);
        Ok(deleted || removed > 0)
    }

    /// 当前指纹，以及与之匹配的存储记录
    fn lookup(&self, path: &Path) -> Result<(Fingerprint, Option<VideoMetadata>)> {
        let fp = Fingerprint::of(path)?;
        let record = self.store.get_by_path(&fp.path)?;
        match record {
            Some(record) if fp.matches(&record) => Ok((fp, Some(record))),
            Some(_) => {
                debug!("[元数据] 文件已修改，记录失效: {}", fp.path);
                Ok((fp, None))
            }
            None => Ok((fp, None)),
        }
    }

    fn refresh(&self, path: &Path, fp: Fingerprint) -> Result<VideoMetadata> {
        let start = Instant::now();
        let probe = self.extractor.probe(path)?;
        let record = VideoMetadata {
            path: fp.path,
            last_modified: fp.last_modified,
            duration_millis: probe.duration_ms,
            thumbnail_path: None,
            width: probe.width.map(|w| w as i32),
            height: probe.height.map(|h| h as i32),
        };
        self.store.insert_or_replace(&record)?;
        debug!(
            "[元数据] 探测完成 {}：时长 {:?}ms，尺寸 {:?}，耗时: {}ms",
            record.path,
            record.duration_millis,
            record.dimensions(),
            start.elapsed().as_millis()
        );
        Ok(record)
    }

    fn fit_width(&self, image: DynamicImage) -> DynamicImage {
        let (w, h) = (image.width(), image.height());
        if w <= self.thumbnail_width {
            return image;
        }
        let height = ((h as f64 * self.thumbnail_width as f64 / w as f64).round() as u32).max(1);
        resample_to_fill(&image, self.thumbnail_width, height, ColorType::Rgb8)
    }
}
