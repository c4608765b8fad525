use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::Result;
use crate::metadata::VideoMetadata;

/// 视频文件版本标识：(路径, 最后修改时间毫秒)
///
/// 只比较修改时间，不比较内容；修改时间不变但内容被替换的文件会被视为未变化。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub path: String,
    pub last_modified: i64,
}

impl Fingerprint {
    pub fn new(path: impl Into<String>, last_modified: i64) -> Self {
        Self {
            path: path.into(),
            last_modified,
        }
    }

    /// 读取文件系统上的修改时间生成指纹
    pub fn of(path: &Path) -> Result<Self> {
        let modified = std::fs::metadata(path)?.modified()?;
        let last_modified = match modified.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            // 1970 年之前的时间戳
            Err(e) => -(e.duration().as_millis() as i64),
        };
        Ok(Self::new(path_key(path), last_modified))
    }

    /// 存储记录是否仍然对应当前文件版本
    pub fn matches(&self, record: &VideoMetadata) -> bool {
        self.path == record.path && self.last_modified == record.last_modified
    }
}

/// 数据库、内存缓存和缩略图文件名统一使用的路径键。
///
/// 相对路径按当前目录转为绝对路径，并按字面消去 `.` 和 `..`（不解析符号链接），
/// 同一文件的不同写法得到同一个键。
pub fn path_key(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized.to_string_lossy().into_owned()
}
