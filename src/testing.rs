//! 测试用的假解码器，记录打开次数和取帧参数

use image::{DynamicImage, Rgba, RgbaImage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retriever::{MediaBackend, MediaInfo, MediaRetriever, SeekMode};

#[derive(Debug, Clone)]
pub struct FakeVideo {
    pub info: MediaInfo,
    /// 解码器实际返回的帧尺寸（缩放解码时也忽略请求的尺寸），None 时按请求或 info 中的尺寸
    pub frame_size: Option<(u32, u32)>,
    pub has_frames: bool,
    pub embedded: Option<(u32, u32)>,
    pub fail_open: bool,
}

impl FakeVideo {
    pub fn new(info: MediaInfo) -> Self {
        Self {
            info,
            frame_size: None,
            has_frames: true,
            embedded: None,
            fail_open: false,
        }
    }

    pub fn returning_frame(mut self, width: u32, height: u32) -> Self {
        self.frame_size = Some((width, height));
        self
    }

    pub fn without_frames(mut self) -> Self {
        self.has_frames = false;
        self
    }

    pub fn with_embedded_picture(mut self, width: u32, height: u32) -> Self {
        self.info.has_embedded_picture = true;
        self.embedded = Some((width, height));
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameCall {
    pub path: PathBuf,
    pub time_us: i64,
    pub mode: SeekMode,
    pub size: Option<(u32, u32)>,
}

#[derive(Default)]
struct State {
    videos: Mutex<HashMap<PathBuf, FakeVideo>>,
    calls: Mutex<Vec<FrameCall>>,
    opens: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<State>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_video(&self, path: impl Into<PathBuf>, video: FakeVideo) -> PathBuf {
        let path = path.into();
        self.state.videos.lock().insert(path.clone(), video);
        path
    }

    /// 每次打开时阻塞一段时间，用于制造并发重叠
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = Some(delay);
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn frame_requests(&self) -> Vec<FrameCall> {
        self.state.calls.lock().clone()
    }
}

impl MediaBackend for FakeBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn MediaRetriever>> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let video = self
            .state
            .videos
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::extraction(path, "无法打开文件"))?;
        if video.fail_open {
            return Err(Error::extraction(path, "不支持的编码"));
        }

        Ok(Box::new(FakeRetriever {
            path: path.to_path_buf(),
            video,
            state: self.state.clone(),
        }))
    }
}

struct FakeRetriever {
    path: PathBuf,
    video: FakeVideo,
    state: Arc<State>,
}

impl FakeRetriever {
    fn record(&self, time_us: i64, mode: SeekMode, size: Option<(u32, u32)>) {
        self.state.calls.lock().push(FrameCall {
            path: self.path.clone(),
            time_us,
            mode,
            size,
        });
    }
}

fn solid(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255])))
}

impl MediaRetriever for FakeRetriever {
    fn info(&self) -> &MediaInfo {
        &self.video.info
    }

    fn frame_at(&mut self, time_us: i64, mode: SeekMode) -> Result<Option<DynamicImage>> {
        self.record(time_us, mode, None);
        if !self.video.has_frames {
            return Ok(None);
        }
        let (w, h) = self.video.frame_size.unwrap_or((
            self.video.info.width.unwrap_or(16),
            self.video.info.height.unwrap_or(16),
        ));
        Ok(Some(solid(w, h)))
    }

    fn scaled_frame_at(
        &mut self,
        time_us: i64,
        mode: SeekMode,
        width: u32,
        height: u32,
    ) -> Result<Option<DynamicImage>> {
        self.record(time_us, mode, Some((width, height)));
        if !self.video.has_frames {
            return Ok(None);
        }
        let (w, h) = self.video.frame_size.unwrap_or((width, height));
        Ok(Some(solid(w, h)))
    }

    fn embedded_picture(&mut self) -> Result<Option<DynamicImage>> {
        Ok(self.video.embedded.map(|(w, h)| solid(w, h)))
    }
}

/// 内存数据库 + 假解码器组成的仓库，缩略图写入 `dir/thumbs`
pub fn repository(dir: &Path, backend: &FakeBackend) -> crate::repository::VideoMetadataRepository {
    use crate::extractor::{ExtractorOptions, FrameExtractor};
    use crate::store::MetadataStore;
    use crate::thumbnail_files::ThumbnailFiles;

    let store = Arc::new(MetadataStore::open_in_memory().expect("内存数据库"));
    let extractor = FrameExtractor::new(Arc::new(backend.clone()), ExtractorOptions::default());
    crate::repository::VideoMetadataRepository::new(store, extractor, ThumbnailFiles::new(dir.join("thumbs")))
}

/// 在磁盘上创建一个占位视频文件并注册到假解码器（640x360）
pub fn write_video(dir: &Path, name: &str, backend: &FakeBackend, duration_ms: i64) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"not really a video").expect("写入测试文件");
    backend.add_video(
        path,
        FakeVideo::new(MediaInfo {
            duration_ms: Some(duration_ms),
            width: Some(640),
            height: Some(360),
            ..MediaInfo::default()
        }),
    )
}
