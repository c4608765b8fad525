use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

use crate::cache::DEFAULT_WORKERS;
use crate::extractor::{ExtractorOptions, DEFAULT_FRAME_FRACTION};
use crate::repository::DEFAULT_THUMBNAIL_WIDTH;
use crate::retriever::SeekMode;
use crate::thumbnail_files::{CUSTOM_JPEG_QUALITY, DEFAULT_JPEG_QUALITY};

const SECTION: &str = "video_thumbs";
const APP_DIR: &str = "video-thumbs";

/// 缓存子系统的完整配置
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// SQLite 数据库文件
    pub database_path: PathBuf,
    /// 自动/自定义缩略图目录
    pub thumbnail_dir: PathBuf,
    /// 幻灯片缩略图目录
    pub slideshow_dir: PathBuf,
    /// 同时运行的解码任务数
    pub worker_threads: usize,
    /// 截取位置占时长的比例
    pub frame_fraction: f64,
    pub seek_mode: SeekMode,
    /// 缩略图最大宽度
    pub thumbnail_width: u32,
    pub jpeg_quality: u8,
    pub custom_jpeg_quality: u8,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let cache = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self {
            database_path: data.join("video_metadata.db"),
            thumbnail_dir: data.join("video_thumbnails"),
            slideshow_dir: cache.join("video_thumbnails"),
            worker_threads: DEFAULT_WORKERS,
            frame_fraction: DEFAULT_FRAME_FRACTION,
            seek_mode: SeekMode::default(),
            thumbnail_width: DEFAULT_THUMBNAIL_WIDTH,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            custom_jpeg_quality: CUSTOM_JPEG_QUALITY,
            log_level: "info".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn extractor_options(&self) -> ExtractorOptions {
        ExtractorOptions {
            frame_fraction: self.frame_fraction,
            seek_mode: self.seek_mode,
        }
    }
}

/// 单个来源（命令行、环境变量、配置文件）给出的部分配置
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialConfig {
    pub database_path: Option<PathBuf>,
    pub thumbnail_dir: Option<PathBuf>,
    pub slideshow_dir: Option<PathBuf>,
    pub worker_threads: Option<usize>,
    pub frame_fraction: Option<f64>,
    pub seek_mode: Option<SeekMode>,
    pub thumbnail_width: Option<u32>,
    pub jpeg_quality: Option<u8>,
    pub custom_jpeg_quality: Option<u8>,
    pub log_level: Option<String>,
}

impl PartialConfig {
    /// `self` 中已有的值优先，缺失的从 `lower` 补齐
    fn or(self, lower: PartialConfig) -> PartialConfig {
        PartialConfig {
            database_path: self.database_path.or(lower.database_path),
            thumbnail_dir: self.thumbnail_dir.or(lower.thumbnail_dir),
            slideshow_dir: self.slideshow_dir.or(lower.slideshow_dir),
            worker_threads: self.worker_threads.or(lower.worker_threads),
            frame_fraction: self.frame_fraction.or(lower.frame_fraction),
            seek_mode: self.seek_mode.or(lower.seek_mode),
            thumbnail_width: self.thumbnail_width.or(lower.thumbnail_width),
            jpeg_quality: self.jpeg_quality.or(lower.jpeg_quality),
            custom_jpeg_quality: self.custom_jpeg_quality.or(lower.custom_jpeg_quality),
            log_level: self.log_level.or(lower.log_level),
        }
    }

    fn resolve(self) -> CacheConfig {
        let defaults = CacheConfig::default();
        CacheConfig {
            database_path: self.database_path.unwrap_or(defaults.database_path),
            thumbnail_dir: self.thumbnail_dir.unwrap_or(defaults.thumbnail_dir),
            slideshow_dir: self.slideshow_dir.unwrap_or(defaults.slideshow_dir),
            worker_threads: self.worker_threads.filter(|n| *n > 0).unwrap_or(defaults.worker_threads),
            frame_fraction: self
                .frame_fraction
                .filter(|f| (0.0..=1.0).contains(f))
                .unwrap_or(defaults.frame_fraction),
            seek_mode: self.seek_mode.unwrap_or(defaults.seek_mode),
            thumbnail_width: self.thumbnail_width.filter(|w| *w > 0).unwrap_or(defaults.thumbnail_width),
            jpeg_quality: self.jpeg_quality.unwrap_or(defaults.jpeg_quality).clamp(1, 100),
            custom_jpeg_quality: self
                .custom_jpeg_quality
                .unwrap_or(defaults.custom_jpeg_quality)
                .clamp(1, 100),
            log_level: self.log_level.unwrap_or(defaults.log_level),
        }
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load(config_file: Option<&Path>, overrides: PartialConfig) -> Result<CacheConfig> {
        Self::load_with_env(config_file, overrides, |key| env::var(key).ok())
    }

    pub fn load_with_env(
        config_file: Option<&Path>,
        overrides: PartialConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<CacheConfig> {
        // 显式指定的配置文件必须能读取，默认位置找不到时忽略
        let file_config = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations().unwrap_or_default(),
        };
        let env_config = Self::load_from_env(env);

        Ok(overrides.or(env_config).or(file_config).resolve())
    }

    /// 从环境变量加载配置
    fn load_from_env(env: impl Fn(&str) -> Option<String>) -> PartialConfig {
        let parse = |key: &str| env(key).filter(|v| !v.is_empty());
        PartialConfig {
            database_path: parse("VIDEO_THUMBS_DATABASE").map(PathBuf::from),
            thumbnail_dir: parse("VIDEO_THUMBS_THUMBNAIL_DIR").map(PathBuf::from),
            slideshow_dir: parse("VIDEO_THUMBS_SLIDESHOW_DIR").map(PathBuf::from),
            worker_threads: parse("VIDEO_THUMBS_WORKERS").and_then(|v| v.parse().ok()),
            frame_fraction: parse("VIDEO_THUMBS_FRAME_FRACTION").and_then(|v| v.parse().ok()),
            seek_mode: parse("VIDEO_THUMBS_SEEK_MODE").and_then(|v| v.parse().ok()),
            thumbnail_width: parse("VIDEO_THUMBS_THUMBNAIL_WIDTH").and_then(|v| v.parse().ok()),
            jpeg_quality: parse("VIDEO_THUMBS_JPEG_QUALITY").and_then(|v| v.parse().ok()),
            custom_jpeg_quality: None,
            log_level: parse("LOG_LEVEL"),
        }
    }

    /// 从INI配置文件加载配置
    fn load_from_file(config_path: &Path) -> Result<PartialConfig> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut ini = configparser::ini::Ini::new();
        ini.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        // 先读 [video_thumbs] 节，没有则使用 [DEFAULT] 节
        let get = |key: &str| {
            ini.get(SECTION, key)
                .or_else(|| ini.get("DEFAULT", key))
                .filter(|v| !v.is_empty())
        };

        let seek_mode = match get("seek_mode") {
            Some(v) => Some(v.parse::<SeekMode>().map_err(|e| {
                anyhow::anyhow!("配置文件 {} 中的 seek_mode 无效: {}", config_path.display(), e)
            })?),
            None => None,
        };

        Ok(PartialConfig {
            database_path: get("database_path").map(PathBuf::from),
            thumbnail_dir: get("thumbnail_dir").map(PathBuf::from),
            slideshow_dir: get("slideshow_dir").map(PathBuf::from),
            worker_threads: get("worker_threads").and_then(|v| v.parse().ok()),
            frame_fraction: get("frame_fraction").and_then(|v| v.parse().ok()),
            seek_mode,
            thumbnail_width: get("thumbnail_width").and_then(|v| v.parse().ok()),
            jpeg_quality: get("jpeg_quality").and_then(|v| v.parse().ok()),
            custom_jpeg_quality: get("custom_jpeg_quality").and_then(|v| v.parse().ok()),
            log_level: ini
                .get("logging", "level")
                .or_else(|| get("log_level"))
                .filter(|v| !v.is_empty()),
        })
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<PartialConfig> {
        let mut candidates = vec![
            PathBuf::from("video-thumbs.ini"),
            PathBuf::from(".video-thumbs.ini"),
        ];
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".video-thumbs.ini"));
        }
        candidates.push(PathBuf::from("/etc/video-thumbs.ini"));

        match candidates.iter().find(|p| p.exists()) {
            Some(path) => Self::load_from_file(path),
            None => Err(anyhow::anyhow!("未找到配置文件")),
        }
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = CacheConfig::default();
        let mut ini = configparser::ini::Ini::new();
        let mut set = |section: &str, key: &str, value: String| {
            ini.set(section, key, Some(value));
        };
        set(SECTION, "database_path", defaults.database_path.display().to_string());
        set(SECTION, "thumbnail_dir", defaults.thumbnail_dir.display().to_string());
        set(SECTION, "slideshow_dir", defaults.slideshow_dir.display().to_string());
        set(SECTION, "worker_threads", defaults.worker_threads.to_string());
        set(SECTION, "frame_fraction", format!("{:.10}", defaults.frame_fraction));
        set(SECTION, "seek_mode", "closest_sync".to_string());
        set(SECTION, "thumbnail_width", defaults.thumbnail_width.to_string());
        set(SECTION, "jpeg_quality", defaults.jpeg_quality.to_string());
        set(SECTION, "custom_jpeg_quality", defaults.custom_jpeg_quality.to_string());
        set("logging", "level", defaults.log_level.clone());

        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建目录失败: {}", parent.display()))?;
        }
        ini.write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.ini");
        assert!(ConfigLoader::load_with_env(Some(&missing), PartialConfig::default(), no_env).is_err());

        let config = PartialConfig::default().resolve();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.seek_mode, SeekMode::ClosestSync);
        assert_eq!(config.jpeg_quality, 90);
        assert_eq!(config.custom_jpeg_quality, 100);
        assert_eq!(config.thumbnail_width, 1920);
        assert!((config.frame_fraction - 1.0 / 3.0).abs() < 1e-9);
        assert!(config.database_path.ends_with("video-thumbs/video_metadata.db"));
    }

    #[test]
    fn test_default_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video-thumbs.ini");
        ConfigLoader::create_default_config(&path).unwrap();

        let loaded = ConfigLoader::load_with_env(Some(&path), PartialConfig::default(), no_env).unwrap();
        let defaults = CacheConfig::default();
        assert_eq!(loaded.database_path, defaults.database_path);
        assert_eq!(loaded.seek_mode, defaults.seek_mode);
        assert_eq!(loaded.log_level, "info");
        assert!((loaded.frame_fraction - defaults.frame_fraction).abs() < 1e-9);
    }

    #[test]
    fn test_priority_cli_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.ini");
        std::fs::write(
            &path,
            "[video_thumbs]\nworker_threads = 3\njpeg_quality = 70\nseek_mode = previous_sync\nthumbnail_dir = /file/thumbs\n\n[logging]\nlevel = warn\n",
        )
        .unwrap();

        let env: HashMap<&str, &str> =
            [("VIDEO_THUMBS_WORKERS", "6"), ("VIDEO_THUMBS_THUMBNAIL_DIR", "/env/thumbs")]
                .into_iter()
                .collect();
        let overrides = PartialConfig {
            thumbnail_dir: Some(PathBuf::from("/cli/thumbs")),
            ..PartialConfig::default()
        };

        let config = ConfigLoader::load_with_env(Some(&path), overrides, |k| {
            env.get(k).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.thumbnail_dir, PathBuf::from("/cli/thumbs"));
        assert_eq!(config.worker_threads, 6);
        assert_eq!(config.jpeg_quality, 70);
        assert_eq!(config.seek_mode, SeekMode::PreviousSync);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_invalid_seek_mode_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ini");
        std::fs::write(&path, "[video_thumbs]\nseek_mode = sideways\n").unwrap();
        assert!(ConfigLoader::load_with_env(Some(&path), PartialConfig::default(), no_env).is_err());
    }
}
