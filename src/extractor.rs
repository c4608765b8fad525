use image::imageops::FilterType;
use image::{ColorType, DynamicImage, RgbaImage};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::retriever::{MediaBackend, MediaRetriever, SeekMode};

/// 解码前缩放系数的下限（允许非精确尺寸时）
pub const MIN_DECODE_SCALE: f64 = 0.85;
/// 解码后尺寸校验使用的缩放系数下限（允许非精确尺寸时）
pub const MIN_OUTPUT_SCALE: f64 = 0.8;
/// 解码时请求尺寸的最小边长
pub const MIN_DECODE_EDGE: u32 = 480;
/// 默认截取位置：时长的 1/3（totem-video-thumbnailer 最先尝试的位置）
pub const DEFAULT_FRAME_FRACTION: f64 = 1.0 / 3.0;

/// 目标框的填充方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scale {
    /// 铺满目标框，超出部分裁掉
    #[default]
    Fill,
    /// 完整放入目标框
    Fit,
}

/// 单次取帧请求
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractRequest {
    /// 调用方声明的逻辑尺寸，None 表示使用视频原始尺寸
    pub target: Option<(u32, u32)>,
    /// 截取位置占时长的比例，None 使用默认值
    pub frame_fraction: Option<f64>,
    /// 定位策略，None 使用默认值
    pub seek_mode: Option<SeekMode>,
    /// 是否允许输出尺寸与目标不完全一致
    pub allow_inexact_size: bool,
    pub scale: Scale,
    /// 期望的像素格式
    pub color: ColorType,
}

impl Default for ExtractRequest {
    fn default() -> Self {
        Self {
            target: None,
            frame_fraction: None,
            seek_mode: None,
            allow_inexact_size: true,
            scale: Scale::Fill,
            color: ColorType::Rgba8,
        }
    }
}

impl ExtractRequest {
    pub fn with_target(mut self, width: u32, height: u32) -> Self {
        self.target = Some((width.max(1), height.max(1)));
        self
    }

    /// 要求输出严格等于目标尺寸
    pub fn exact(mut self) -> Self {
        self.allow_inexact_size = false;
        self
    }

    pub fn with_color(mut self, color: ColorType) -> Self {
        self.color = color;
        self
    }
}

/// 取帧结果
#[derive(Debug, Clone)]
pub struct ExtractedFrame {
    pub image: DynamicImage,
    /// 输出是否相对源尺寸缩小过
    pub is_sampled: bool,
    /// 解码失败时的透明占位图
    pub is_placeholder: bool,
    /// 来自容器内嵌封面而不是视频帧
    pub from_embedded: bool,
}

/// 视频的基本信息（尺寸已按旋转校正）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoProbe {
    pub duration_ms: Option<i64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub rotation: i32,
}

impl VideoProbe {
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        }
    }
}

/// 取帧默认参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractorOptions {
    pub frame_fraction: f64,
    pub seek_mode: SeekMode,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            frame_fraction: DEFAULT_FRAME_FRACTION,
            seek_mode: SeekMode::ClosestSync,
        }
    }
}

/// 帧提取器：打开解码器，按请求截取并规整一帧
#[derive(Clone)]
pub struct FrameExtractor {
    backend: Arc<dyn MediaBackend>,
    options: ExtractorOptions,
}

impl FrameExtractor {
    pub fn new(backend: Arc<dyn MediaBackend>, options: ExtractorOptions) -> Self {
        Self { backend, options }
    }

    /// 读取时长和尺寸，不解码帧
    pub fn probe(&self, path: &Path) -> Result<VideoProbe> {
        let retriever = self.backend.open(path)?;
        Ok(probe_of(retriever.as_ref()))
    }

    /// 按请求截取一帧。打开失败时直接返回错误，不重试；解码不到帧时返回透明占位图。
    pub fn extract(&self, path: &Path, request: &ExtractRequest) -> Result<ExtractedFrame> {
        let mut retriever = self.backend.open(path)?;
        self.decode_frame(retriever.as_mut(), request)
    }

    /// 生成缩略图用的源图：优先使用内嵌封面，失败时退回视频帧。同时返回探测信息，避免重复打开。
    pub fn thumbnail_source(&self, path: &Path, request: &ExtractRequest) -> Result<(ExtractedFrame, VideoProbe)> {
        let mut retriever = self.backend.open(path)?;
        let probe = probe_of(retriever.as_ref());

        if retriever.info().has_embedded_picture {
            match retriever.embedded_picture() {
                Ok(Some(picture)) => {
                    debug!("🖼️  [取帧] 使用内嵌封面: {}", path.display());
                    let (w, h) = (picture.width(), picture.height());
                    let mut frame = normalize(picture, w, h, request);
                    frame.from_embedded = true;
                    return Ok((frame, probe));
                }
                Ok(None) => {}
                Err(e) if e.is_benign() => debug!("[取帧] 内嵌封面不可用: {}", e),
                Err(e) => warn!("⚠️  [取帧] 读取内嵌封面失败，改用视频帧: {}", e),
            }
        }

        let frame = self.decode_frame(retriever.as_mut(), request)?;
        Ok((frame, probe))
    }

    /// 精确截取某一时间点（毫秒）的帧，原始尺寸
    pub fn frame_at_timestamp(&self, path: &Path, timestamp_ms: i64) -> Result<Option<DynamicImage>> {
        let mut retriever = self.backend.open(path)?;
        retriever.frame_at(timestamp_ms.max(0).saturating_mul(1000), SeekMode::Closest)
    }

    fn decode_frame(&self, retriever: &mut dyn MediaRetriever, request: &ExtractRequest) -> Result<ExtractedFrame> {
        let start = Instant::now();
        let probe = probe_of(retriever);
        let (mut src_w, mut src_h) = (probe.width.unwrap_or(0), probe.height.unwrap_or(0));

        let fraction = request
            .frame_fraction
            .unwrap_or(self.options.frame_fraction)
            .clamp(0.0, 1.0);
        let frame_us = capture_offset_us(probe.duration_ms.unwrap_or(0), fraction);
        let mode = request.seek_mode.unwrap_or(self.options.seek_mode);

        let decoded = if retriever.supports_scaled_frames() && src_w > 0 && src_h > 0 {
            let (dst_w, dst_h) = request.target.unwrap_or((src_w, src_h));
            let raw = size_multiplier(src_w, src_h, dst_w, dst_h, request.scale);
            let scale = if request.allow_inexact_size {
                raw.max(MIN_DECODE_SCALE)
            } else {
                raw
            };
            let width = scaled(src_w, scale).max(MIN_DECODE_EDGE);
            let height = scaled(src_h, scale).max(MIN_DECODE_EDGE);
            retriever.scaled_frame_at(frame_us, mode, width, height)?
        } else {
            let frame = retriever.frame_at(frame_us, mode)?;
            if let Some(frame) = &frame {
                src_w = frame.width();
                src_h = frame.height();
            }
            frame
        };

        let Some(decoded) = decoded else {
            warn!("⚠️  [取帧] 在 {}us 处没有解码到帧，返回占位图", frame_us);
            return Ok(placeholder(request));
        };

        // 元数据缺失尺寸时以解码结果为准
        if src_w == 0 || src_h == 0 {
            src_w = decoded.width();
            src_h = decoded.height();
        }

        let frame = normalize(decoded, src_w, src_h, request);
        debug!(
            "✅ [取帧] {}x{} @ {}us，耗时: {:.0}ms",
            frame.image.width(),
            frame.image.height(),
            frame_us,
            start.elapsed().as_millis()
        );
        Ok(frame)
    }
}

fn probe_of(retriever: &dyn MediaRetriever) -> VideoProbe {
    let info = retriever.info();
    let rotation = info.rotation.unwrap_or(0).rem_euclid(360);
    let (width, height) = match rotation {
        90 | 270 => (info.height, info.width),
        _ => (info.width, info.height),
    };
    VideoProbe {
        duration_ms: info.duration_ms,
        width,
        height,
        rotation,
    }
}

/// 截取位置（微秒）：时长（毫秒）乘以比例后取整
pub fn capture_offset_us(duration_ms: i64, fraction: f64) -> i64 {
    if duration_ms <= 0 {
        return 0;
    }
    ((fraction * duration_ms as f64).round() as i64).saturating_mul(1000)
}

/// 源尺寸到目标尺寸的缩放系数
pub fn size_multiplier(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32, scale: Scale) -> f64 {
    let width_percent = dst_w as f64 / src_w.max(1) as f64;
    let height_percent = dst_h as f64 / src_h.max(1) as f64;
    match scale {
        Scale::Fill => width_percent.max(height_percent),
        Scale::Fit => width_percent.min(height_percent),
    }
}

fn scaled(edge: u32, scale: f64) -> u32 {
    ((edge as f64 * scale).round() as u32).max(1)
}

/// 解码后的尺寸/格式校验，不符合时重新铺满到新画布
fn normalize(decoded: DynamicImage, src_w: u32, src_h: u32, request: &ExtractRequest) -> ExtractedFrame {
    let (dst_w, dst_h) = request.target.unwrap_or((src_w, src_h));
    let raw = size_multiplier(src_w, src_h, dst_w, dst_h, request.scale);

    let (scale, out_w, out_h) = if request.allow_inexact_size {
        let scale = raw.max(MIN_OUTPUT_SCALE);
        (scale, scaled(src_w, scale), scaled(src_h, scale))
    } else {
        (raw, dst_w, dst_h)
    };

    let valid_size = if request.allow_inexact_size {
        decoded.width() <= out_w && decoded.height() <= out_h
    } else {
        decoded.width() == out_w && decoded.height() == out_h
    };

    let image = if !valid_size {
        resample_to_fill(&decoded, out_w, out_h, request.color)
    } else if decoded.color() != request.color {
        convert_color(decoded, request.color)
    } else {
        decoded
    };

    ExtractedFrame {
        image,
        is_sampled: scale < 1.0,
        is_placeholder: false,
        from_embedded: false,
    }
}

/// 等比缩放铺满 `width`x`height`，居中裁掉溢出部分，不留黑边
pub fn resample_to_fill(image: &DynamicImage, width: u32, height: u32, color: ColorType) -> DynamicImage {
    let filled = image.resize_to_fill(width.max(1), height.max(1), FilterType::Triangle);
    convert_color(filled, color)
}

fn convert_color(image: DynamicImage, color: ColorType) -> DynamicImage {
    match color {
        ColorType::Rgb8 => DynamicImage::ImageRgb8(image.to_rgb8()),
        ColorType::L8 => DynamicImage::ImageLuma8(image.to_luma8()),
        _ => DynamicImage::ImageRgba8(image.to_rgba8()),
    }
}

fn placeholder(request: &ExtractRequest) -> ExtractedFrame {
    let (w, h) = request.target.unwrap_or((1, 1));
    ExtractedFrame {
        image: DynamicImage::ImageRgba8(RgbaImage::new(w.max(1), h.max(1))),
        is_sampled: false,
        is_placeholder: true,
        from_embedded: false,
    }
}
