use serde::{Deserialize, Serialize};

/// 单个视频文件的持久化元数据（`video_metadata` 表的一行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    /// 视频文件路径（主键）
    pub path: String,
    /// 生成记录时文件的最后修改时间（毫秒），用于判断是否过期
    pub last_modified: i64,
    /// 视频时长（毫秒）
    pub duration_millis: Option<i64>,
    /// 本地缩略图文件路径
    pub thumbnail_path: Option<String>,
    /// 视频宽度（像素，已按旋转校正）
    pub width: Option<i32>,
    /// 视频高度（像素，已按旋转校正）
    pub height: Option<i32>,
}

impl VideoMetadata {
    pub fn new(path: impl Into<String>, last_modified: i64) -> Self {
        Self {
            path: path.into(),
            last_modified,
            duration_millis: None,
            thumbnail_path: None,
            width: None,
            height: None,
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w as u32, h as u32)),
            _ => None,
        }
    }
}

/// 幻灯片缩略图（`video_thumbnails` 表的一行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoThumbnail {
    /// 自增 ID，未插入时为 0
    pub id: i64,
    /// 所属视频路径（外键，级联删除/更新）
    pub video_path: String,
    /// 缩略图图片路径
    pub thumbnail_path: String,
    /// 缩略图对应的视频时间点（毫秒）
    pub timestamp_ms: i64,
    /// 显示顺序
    pub display_order: i32,
    /// 是否为默认缩略图，每个视频至多一个
    pub is_default: bool,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    /// 幻灯片中的显示时长（毫秒）
    pub display_interval_ms: i64,
}

impl VideoThumbnail {
    pub const DEFAULT_INTERVAL_MS: i64 = 1000;

    pub fn new(video_path: impl Into<String>, thumbnail_path: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            id: 0,
            video_path: video_path.into(),
            thumbnail_path: thumbnail_path.into(),
            timestamp_ms,
            display_order: 0,
            is_default: false,
            created_at: chrono::Utc::now().timestamp_millis(),
            display_interval_ms: Self::DEFAULT_INTERVAL_MS,
        }
    }
}
