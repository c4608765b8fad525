use std::path::PathBuf;

/// 库内统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 解码器打开或读取失败（文件损坏、编码不支持、无权限）
    #[error("解码失败: {path}: {message}")]
    Extraction { path: PathBuf, message: String },

    #[error("未找到视频流: {0}")]
    NoVideoStream(PathBuf),

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("图像编码失败: {0}")]
    Image(#[from] image::ImageError),

    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ZIP 错误: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// 备份文件结构不正确
    #[error("备份文件无效: {0}")]
    InvalidBackup(String),

    #[error("记录不存在: {0}")]
    NotFound(String),
}

impl Error {
    pub fn extraction(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Error::Extraction {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// 已知的无害解码器消息（例如探测内嵌封面失败），只记 debug 日志
    pub fn is_benign(&self) -> bool {
        const SUPPRESSED: &[&str] = &[
            "getEmbeddedPicture",
            "attached picture",
        ];
        match self {
            Error::Extraction { message, .. } => SUPPRESSED.iter().any(|s| message.contains(s)),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
