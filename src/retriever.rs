use ffmpeg_next as ffmpeg;
use image::{DynamicImage, RgbImage};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Once;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// 取帧时的定位策略，对应原生取帧接口的四种选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekMode {
    /// 目标时间之前（含）最近的关键帧
    PreviousSync,
    /// 目标时间之后（含）最近的关键帧
    NextSync,
    /// 离目标时间最近的关键帧
    #[default]
    ClosestSync,
    /// 离目标时间最近的任意帧（需要从关键帧开始逐帧解码）
    Closest,
}

impl FromStr for SeekMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "previous_sync" => Ok(SeekMode::PreviousSync),
            "next_sync" => Ok(SeekMode::NextSync),
            "closest_sync" => Ok(SeekMode::ClosestSync),
            "closest" => Ok(SeekMode::Closest),
            other => Err(format!("未知的定位策略: {}", other)),
        }
    }
}

/// 容器/流级别的基本信息，缺失字段为 None
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub duration_ms: Option<i64>,
    /// 编码宽度（未按旋转校正）
    pub width: Option<u32>,
    /// 编码高度（未按旋转校正）
    pub height: Option<u32>,
    /// 旋转角度（度）
    pub rotation: Option<i32>,
    /// 容器中是否带有封面图
    pub has_embedded_picture: bool,
}

/// 绑定到单个视频文件的取帧器
pub trait MediaRetriever: Send {
    fn info(&self) -> &MediaInfo;

    /// 是否支持解码时直接缩放
    fn supports_scaled_frames(&self) -> bool {
        true
    }

    /// 在 `time_us` 附近解码一帧，原始尺寸；解码不到帧时返回 None
    fn frame_at(&mut self, time_us: i64, mode: SeekMode) -> Result<Option<DynamicImage>>;

    /// 在 `time_us` 附近解码一帧并缩放到 `width`x`height`
    fn scaled_frame_at(
        &mut self,
        time_us: i64,
        mode: SeekMode,
        width: u32,
        height: u32,
    ) -> Result<Option<DynamicImage>>;

    /// 容器内嵌的封面图
    fn embedded_picture(&mut self) -> Result<Option<DynamicImage>>;
}

/// 原生解码器入口
pub trait MediaBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn MediaRetriever>>;
}

static FFMPEG_INIT: Once = Once::new();

/// 基于 FFmpeg 的解码器后端
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Result<Self> {
        let mut init_error = None;
        FFMPEG_INIT.call_once(|| {
            if let Err(e) = ffmpeg::init() {
                init_error = Some(e);
                return;
            }
            // 只保留错误级别日志，抑制警告和信息消息
            unsafe {
                ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
            }
        });
        match init_error {
            Some(e) => Err(Error::extraction("ffmpeg", format!("初始化 FFmpeg 失败: {}", e))),
            None => Ok(Self),
        }
    }
}

impl MediaBackend for FfmpegBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn MediaRetriever>> {
        Ok(Box::new(FfmpegRetriever::open(path)?))
    }
}

/// FFmpeg 取帧器。
///
/// 每次取帧都重新打开输入，所以实例本身只保存路径和流信息。
/// 返回的帧已按显示矩阵（或 `rotate` 标签）转正。
pub struct FfmpegRetriever {
    path: PathBuf,
    video_stream: usize,
    cover_stream: Option<usize>,
    info: MediaInfo,
}

impl FfmpegRetriever {
    pub fn open(path: &Path) -> Result<Self> {
        let ictx = ffmpeg::format::input(&path).map_err(|e| Error::extraction(path, e))?;

        let mut video_stream = None;
        let mut cover_stream = None;
        for stream in ictx.streams() {
            if stream.parameters().medium() != ffmpeg::media::Type::Video {
                continue;
            }
            if stream
                .disposition()
                .contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC)
            {
                cover_stream.get_or_insert(stream.index());
            } else if video_stream.is_none() {
                video_stream = Some(stream.index());
            }
        }
        let video_stream = video_stream.ok_or_else(|| Error::NoVideoStream(path.to_path_buf()))?;

        let stream = ictx
            .stream(video_stream)
            .ok_or_else(|| Error::NoVideoStream(path.to_path_buf()))?;
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| Error::extraction(path, format!("无法创建视频解码器: {}", e)))?;

        // 新版 FFmpeg 把旋转放在显示矩阵里，旧文件可能只有 rotate 标签
        let rotation = display_matrix_rotation(&stream).or_else(|| {
            stream
                .metadata()
                .get("rotate")
                .and_then(|v| v.trim().parse::<i32>().ok())
                .map(|degrees| degrees.rem_euclid(360))
        });

        // 容器时长以 AV_TIME_BASE（微秒）为单位，缺失时退回流时长
        let duration_ms = if ictx.duration() > 0 {
            Some(ictx.duration() / 1000)
        } else if stream.duration() > 0 {
            let tb = stream.time_base();
            Some(stream.duration() * 1000 * tb.numerator() as i64 / tb.denominator().max(1) as i64)
        } else {
            None
        };

        let info = MediaInfo {
            duration_ms,
            width: Some(decoder.width()).filter(|w| *w > 0),
            height: Some(decoder.height()).filter(|h| *h > 0),
            rotation,
            has_embedded_picture: cover_stream.is_some(),
        };
        debug!("🎞️  [解码器] {} -> {:?}", path.display(), info);

        Ok(Self {
            path: path.to_path_buf(),
            video_stream,
            cover_stream,
            info,
        })
    }

    fn decode_at(&self, time_us: i64, mode: SeekMode, size: Option<(u32, u32)>) -> Result<Option<DynamicImage>> {
        let mut ictx = ffmpeg::format::input(&self.path).map_err(|e| Error::extraction(&self.path, e))?;

        let stream = ictx
            .stream(self.video_stream)
            .ok_or_else(|| Error::NoVideoStream(self.path.clone()))?;
        let time_base = stream.time_base();
        let mut decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| Error::extraction(&self.path, format!("无法创建视频解码器: {}", e)))?;

        if time_us > 0 {
            if let Err(e) = ictx.seek(time_us, seek_window(mode, time_us)) {
                // 定位失败时从头解码
                warn!("⚠️  [解码器] 定位到 {}us 失败: {}", time_us, e);
            }
        }

        let target_secs = time_us as f64 / 1_000_000.0;
        let frame_secs = |frame: &ffmpeg::frame::Video| {
            frame
                .timestamp()
                .map(|ts| ts as f64 * time_base.numerator() as f64 / time_base.denominator().max(1) as f64)
                .unwrap_or(0.0)
        };

        let mut picked: Option<ffmpeg::frame::Video> = None;
        let mut decoded = ffmpeg::frame::Video::empty();

        'packets: for (stream, packet) in ictx.packets() {
            if stream.index() != self.video_stream {
                continue;
            }
            if decoder.send_packet(&packet).is_err() {
                continue;
            }
            while decoder.receive_frame(&mut decoded).is_ok() {
                let reached = mode != SeekMode::Closest || frame_secs(&decoded) >= target_secs;
                picked = Some(std::mem::replace(&mut decoded, ffmpeg::frame::Video::empty()));
                if reached {
                    break 'packets;
                }
            }
        }

        // 目标时间在最后一个关键帧之后时，冲洗解码器取剩余帧
        if mode == SeekMode::Closest && picked.as_ref().map_or(true, |f| frame_secs(f) < target_secs) {
            if decoder.send_eof().is_ok() {
                while decoder.receive_frame(&mut decoded).is_ok() {
                    picked = Some(std::mem::replace(&mut decoded, ffmpeg::frame::Video::empty()));
                }
            }
        }

        let Some(frame) = picked else {
            return Ok(None);
        };

        // 缩放在编码方向上进行，之后再按旋转角度转正
        let rotation = self.info.rotation.unwrap_or(0).rem_euclid(360);
        let (width, height) = match size {
            Some((w, h)) if rotation == 90 || rotation == 270 => (h, w),
            Some(size) => size,
            None => (frame.width(), frame.height()),
        };
        let mut scaler = ffmpeg::software::scaling::Context::get(
            frame.format(),
            frame.width(),
            frame.height(),
            ffmpeg::format::Pixel::RGB24,
            width,
            height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| Error::extraction(&self.path, format!("无法创建缩放器: {}", e)))?;

        let mut rgb_frame = ffmpeg::frame::Video::empty();
        scaler
            .run(&frame, &mut rgb_frame)
            .map_err(|e| Error::extraction(&self.path, format!("缩放失败: {}", e)))?;

        let image = frame_to_image(&rgb_frame);
        Ok(Some(match rotation {
            90 => image.rotate90(),
            180 => image.rotate180(),
            270 => image.rotate270(),
            _ => image,
        }))
    }
}

impl MediaRetriever for FfmpegRetriever {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn frame_at(&mut self, time_us: i64, mode: SeekMode) -> Result<Option<DynamicImage>> {
        self.decode_at(time_us, mode, None)
    }

    fn scaled_frame_at(
        &mut self,
        time_us: i64,
        mode: SeekMode,
        width: u32,
        height: u32,
    ) -> Result<Option<DynamicImage>> {
        self.decode_at(time_us, mode, Some((width.max(1), height.max(1))))
    }

    fn embedded_picture(&mut self) -> Result<Option<DynamicImage>> {
        let Some(cover_stream) = self.cover_stream else {
            return Ok(None);
        };

        let mut ictx = ffmpeg::format::input(&self.path).map_err(|e| Error::extraction(&self.path, e))?;
        for (stream, packet) in ictx.packets() {
            if stream.index() != cover_stream {
                continue;
            }
            let Some(data) = packet.data() else {
                continue;
            };
            return image::load_from_memory(data)
                .map(Some)
                .map_err(|e| Error::extraction(&self.path, format!("attached picture 解码失败: {}", e)));
        }
        Ok(None)
    }
}

/// 各定位策略允许落点的时间范围（微秒），FFmpeg 在范围内选离 `time_us` 最近的关键帧
fn seek_window(mode: SeekMode, time_us: i64) -> std::ops::Range<i64> {
    match mode {
        SeekMode::PreviousSync => i64::MIN..time_us,
        SeekMode::NextSync => time_us..i64::MAX,
        SeekMode::ClosestSync => i64::MIN..i64::MAX,
        // 逐帧解码必须从目标之前的关键帧开始
        SeekMode::Closest => i64::MIN..time_us,
    }
}

/// 从流的显示矩阵读取顺时针旋转角度
fn display_matrix_rotation(stream: &ffmpeg::format::stream::Stream) -> Option<i32> {
    let side_data = stream
        .side_data()
        .find(|data| data.kind() == ffmpeg::codec::packet::side_data::Type::DisplayMatrix)?;
    let matrix = display_matrix(side_data.data())?;
    let counter_clockwise = unsafe { ffmpeg::sys::av_display_rotation_get(matrix.as_ptr()) };
    clockwise_degrees(counter_clockwise)
}

/// 9 个本机字节序的 32 位定点数
fn display_matrix(data: &[u8]) -> Option<[i32; 9]> {
    if data.len() < 36 {
        return None;
    }
    let mut matrix = [0i32; 9];
    for (value, bytes) in matrix.iter_mut().zip(data.chunks_exact(4)) {
        *value = i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    Some(matrix)
}

/// `av_display_rotation_get` 给出逆时针角度，转换为顺时针并取整到 0/90/180/270
fn clockwise_degrees(counter_clockwise: f64) -> Option<i32> {
    if !counter_clockwise.is_finite() {
        return None;
    }
    let quarter_turns = (-counter_clockwise / 90.0).round() as i32;
    Some((quarter_turns * 90).rem_euclid(360))
}

/// 将 RGB24 帧转换为 DynamicImage（按行拷贝，跳过行尾填充）
fn frame_to_image(frame: &ffmpeg::frame::Video) -> DynamicImage {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut buf = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let start = y * stride;
        let end = (start + width * 3).min(data.len());
        if start >= end {
            break;
        }
        buf.extend_from_slice(&data[start..end]);
    }
    buf.resize(width * height * 3, 0);

    // 缓冲区长度与尺寸一致，from_raw 不会失败
    let image = RgbImage::from_raw(width as u32, height as u32, buf).unwrap_or_else(|| RgbImage::new(1, 1));
    DynamicImage::ImageRgb8(image)
}
