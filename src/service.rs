use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::backup;
use crate::cache::MetadataCache;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::extractor::FrameExtractor;
use crate::repository::VideoMetadataRepository;
use crate::retriever::{FfmpegBackend, MediaBackend};
use crate::slideshow::ThumbnailSet;
use crate::store::MetadataStore;
use crate::thumbnail_files::ThumbnailFiles;

/// 组装好的缓存子系统：存储、仓库、异步缓存和幻灯片缩略图共享同一个数据库
pub struct ThumbnailService {
    cache: Arc<MetadataCache>,
    slideshow: ThumbnailSet,
}

impl ThumbnailService {
    /// 使用 ffmpeg 解码器打开配置中的数据库
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let store = MetadataStore::open(&config.database_path)?;
        let backend = Arc::new(FfmpegBackend::new()?);
        Ok(Self::with_backend(config, store, backend))
    }

    pub fn with_backend(config: &CacheConfig, store: MetadataStore, backend: Arc<dyn MediaBackend>) -> Self {
        let store = Arc::new(store);
        let extractor = FrameExtractor::new(backend, config.extractor_options());
        let files = ThumbnailFiles::new(&config.thumbnail_dir)
            .with_quality(config.jpeg_quality, config.custom_jpeg_quality);
        let repository = Arc::new(
            VideoMetadataRepository::new(store, extractor, files).with_thumbnail_width(config.thumbnail_width),
        );
        let cache = Arc::new(MetadataCache::new(Arc::clone(&repository), config.worker_threads));
        let slideshow = ThumbnailSet::new(repository, &config.slideshow_dir);

        info!(
            "🚀 [服务] 缩略图目录: {}，工作线程: {}",
            config.thumbnail_dir.display(),
            config.worker_threads
        );
        Self {
            cache,
            slideshow,
        }
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn repository(&self) -> &Arc<VideoMetadataRepository> {
        self.cache.repository()
    }

    pub fn store(&self) -> &MetadataStore {
        self.repository().store()
    }

    pub fn slideshow(&self) -> &ThumbnailSet {
        &self.slideshow
    }

    /// 删除一个视频的全部记录、缩略图和内存结果
    pub fn forget(&self, video: &Path) -> Result<bool> {
        let slides = self.slideshow.delete_all_thumbnails(video)?;
        let forgotten = self.repository().forget(video)?;
        self.cache.invalidate(video);
        Ok(forgotten || slides > 0)
    }

    /// 文件重命名或移动后迁移记录
    pub fn rename(&self, old_path: &Path, new_path: &Path) -> Result<bool> {
        let moved = self.repository().update_path_for_file(old_path, new_path)?;
        self.cache.invalidate(old_path);
        self.cache.invalidate(new_path);
        Ok(moved)
    }

    pub fn export_zip(&self, target: &Path) -> Result<usize> {
        backup::export_zip(self.store(), target)
    }

    pub fn import_zip(&self, source: &Path) -> Result<usize> {
        let imported = backup::import_zip(self.store(), self.repository().files(), source)?;
        self.cache.clear();
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Lookup;
    use crate::fingerprint::path_key;
    use crate::testing::{self, FakeBackend};

    fn service(dir: &Path, backend: &FakeBackend) -> ThumbnailService {
        let config = CacheConfig {
            database_path: dir.join("db").join("video_metadata.db"),
            thumbnail_dir: dir.join("thumbs"),
            slideshow_dir: dir.join("slides"),
            ..CacheConfig::default()
        };
        let store = MetadataStore::open(&config.database_path).unwrap();
        ThumbnailService::with_backend(&config, store, Arc::new(backend.clone()))
    }

    #[tokio::test]
    async fn test_forget_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let clip = testing::write_video(dir.path(), "clip.mp4", &backend, 20_000);
        let svc = service(dir.path(), &backend);

        let thumb = svc.cache().thumbnail(&clip).await.found().unwrap();
        let slide = svc.slideshow().capture_thumbnail(&clip, 1_000, true).unwrap();

        assert!(svc.forget(&clip).unwrap());
        assert!(!thumb.exists());
        assert!(!Path::new(&slide.thumbnail_path).exists());
        assert_eq!(svc.store().count().unwrap(), 0);
        assert!(svc.cache().is_empty());
    }

    #[tokio::test]
    async fn test_rename_keeps_slides() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let clip = testing::write_video(dir.path(), "clip.mp4", &backend, 20_000);
        let svc = service(dir.path(), &backend);

        assert_eq!(svc.cache().duration(&clip).await, Lookup::Found(20_000));
        svc.slideshow().capture_thumbnail(&clip, 1_000, false).unwrap();

        let moved = dir.path().join("moved.mp4");
        assert!(svc.rename(&clip, &moved).unwrap());
        assert!(svc.cache().is_empty());

        let slides = svc.slideshow().thumbnails_for_video(&moved).unwrap();
        assert_eq!(slides.len(), 1);
        assert_eq!(slides[0].video_path, path_key(&moved));
    }

    #[tokio::test]
    async fn test_export_then_import_into_fresh_service() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let clip = testing::write_video(dir.path(), "clip.mp4", &backend, 20_000);
        let svc = service(dir.path(), &backend);
        let thumb = svc.cache().thumbnail(&clip).await.found().unwrap();
        let archive = dir.path().join("backup.zip");
        assert_eq!(svc.export_zip(&archive).unwrap(), 1);

        let other_dir = tempfile::tempdir().unwrap();
        let fresh = service(other_dir.path(), &backend);
        assert_eq!(fresh.import_zip(&archive).unwrap(), 1);

        let restored = fresh.store().get_by_path(&path_key(&clip)).unwrap().unwrap();
        let restored_thumb = restored.thumbnail_path.unwrap();
        assert_eq!(std::fs::read(&restored_thumb).unwrap(), std::fs::read(&thumb).unwrap());

        // 指纹未变，导入后直接命中，不再解码
        let opens = backend.opens();
        assert_eq!(
            fresh.cache().thumbnail(&clip).await,
            Lookup::Found(restored_thumb.into())
        );
        assert_eq!(backend.opens(), opens);
    }
}
