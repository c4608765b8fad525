use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::Level;
use video_thumbs::{
    backup, CacheConfig, ConfigLoader, Lookup, PartialConfig, SeekMode, ThumbnailService, VideoThumbnail,
};

/// 视频元数据与缩略图缓存工具
#[derive(Parser, Debug)]
#[command(name = "video-thumbs")]
#[command(about = "视频元数据与缩略图缓存：时长、尺寸、缩略图、幻灯片与备份", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 数据库文件，可通过环境变量 VIDEO_THUMBS_DATABASE 设置
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// 缩略图目录，可通过环境变量 VIDEO_THUMBS_THUMBNAIL_DIR 设置
    #[arg(long, global = true)]
    thumbnail_dir: Option<PathBuf>,

    /// 同时运行的解码任务数，可通过环境变量 VIDEO_THUMBS_WORKERS 设置
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// 定位策略：previous_sync, next_sync, closest_sync, closest
    #[arg(long, global = true)]
    seek_mode: Option<SeekMode>,

    /// 日志级别（trace, debug, info, warn, error）
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 输出视频时长和尺寸
    Probe {
        /// 视频文件
        inputs: Vec<PathBuf>,
    },
    /// 生成（或读取已缓存的）缩略图
    Thumbnail {
        inputs: Vec<PathBuf>,
    },
    /// 使用指定图片作为视频的自定义缩略图
    CustomThumbnail {
        input: PathBuf,
        image: PathBuf,
    },
    /// 幻灯片缩略图管理
    Slides {
        #[command(subcommand)]
        command: SlideCommands,
    },
    /// 导出元数据（.zip 包含缩略图，.json 只有元数据）
    Export {
        /// 输出文件，默认 video_thumbnails_<时间>.zip
        output: Option<PathBuf>,
    },
    /// 从 .zip 或 .json 备份导入
    Import {
        input: PathBuf,
    },
    /// 删除视频的全部记录和缩略图
    Forget {
        input: PathBuf,
    },
    /// 文件移动或重命名后迁移记录
    Rename {
        from: PathBuf,
        to: PathBuf,
    },
    /// 创建默认配置文件
    InitConfig {
        #[arg(default_value = "video-thumbs.ini")]
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum SlideCommands {
    /// 列出全部幻灯片缩略图
    List { input: PathBuf },
    /// 添加一张图片
    Add {
        input: PathBuf,
        image: PathBuf,
        /// 对应的视频时间点（毫秒）
        #[arg(long, default_value_t = 0)]
        at: i64,
        #[arg(long)]
        default: bool,
    },
    /// 从视频中截取一帧
    Capture {
        input: PathBuf,
        /// 视频时间点（毫秒）
        #[arg(long)]
        at: i64,
        #[arg(long)]
        default: bool,
    },
    /// 把不晚于指定时间点的最近一张设为默认
    Default {
        input: PathBuf,
        #[arg(long)]
        at: i64,
    },
    /// 删除不晚于指定时间点的最近一张；不指定时删除全部
    Remove {
        input: PathBuf,
        #[arg(long)]
        at: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Commands::InitConfig { path } = &args.command {
        ConfigLoader::create_default_config(path).context("创建配置文件失败")?;
        println!("已创建配置文件: {}", path.display());
        return Ok(());
    }

    let overrides = PartialConfig {
        database_path: args.database.clone(),
        thumbnail_dir: args.thumbnail_dir.clone(),
        worker_threads: args.workers,
        seek_mode: args.seek_mode,
        log_level: args.log_level.clone(),
        ..PartialConfig::default()
    };
    let config = ConfigLoader::load(args.config.as_deref(), overrides).context("加载配置失败")?;
    init_logging(&config);

    let service = ThumbnailService::open(&config)
        .with_context(|| format!("初始化失败，数据库: {}", config.database_path.display()))?;

    run(&service, args.command).await
}

fn init_logging(config: &CacheConfig) {
    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

async fn run(service: &ThumbnailService, command: Commands) -> Result<()> {
    match command {
        Commands::Probe { inputs } => {
            let lookups = inputs.iter().map(|input| service.cache().probe(input));
            let results = futures::future::join_all(lookups).await;
            for (input, result) in inputs.iter().zip(results) {
                match result {
                    Lookup::Found(probe) => println!(
                        "{}\t时长: {}\t尺寸: {}",
                        input.display(),
                        probe
                            .duration_ms
                            .map(format_duration)
                            .unwrap_or_else(|| "未知".to_string()),
                        probe
                            .dimensions()
                            .map(|(w, h)| format!("{}x{}", w, h))
                            .unwrap_or_else(|| "未知".to_string()),
                    ),
                    Lookup::NotFound => println!("{}\t文件不存在", input.display()),
                    Lookup::Failed(e) => println!("{}\t读取失败: {}", input.display(), e),
                }
            }
        }
        Commands::Thumbnail { inputs } => {
            let requests: Vec<_> = inputs
                .iter()
                .map(|input| service.cache().request_thumbnail(input.clone()))
                .collect();
            let results = futures::future::join_all(requests).await;
            for (input, result) in inputs.iter().zip(results) {
                match result {
                    Lookup::Found(path) => println!("{}\t{}", input.display(), path.display()),
                    Lookup::NotFound => println!("{}\t没有缩略图", input.display()),
                    Lookup::Failed(e) => println!("{}\t生成失败: {}", input.display(), e),
                }
            }
        }
        Commands::CustomThumbnail { input, image } => {
            let picture = image::open(&image).with_context(|| format!("读取图片失败: {}", image.display()))?;
            let written = service
                .repository()
                .set_custom_thumbnail(&input, &picture)
                .context("保存自定义缩略图失败")?;
            service.cache().invalidate(&input);
            println!("{}", written.display());
        }
        Commands::Slides { command } => run_slides(service, command)?,
        Commands::Export { output } => {
            let output = output.unwrap_or_else(|| PathBuf::from(backup::default_export_file_name()));
            let count = if is_json(&output) {
                let file = std::fs::File::create(&output)
                    .with_context(|| format!("创建文件失败: {}", output.display()))?;
                backup::export_json(service.store(), std::io::BufWriter::new(file))?
            } else {
                service.export_zip(&output)?
            };
            println!("已导出 {} 条记录到 {}", count, output.display());
        }
        Commands::Import { input } => {
            let count = if is_json(&input) {
                let file = std::fs::File::open(&input)
                    .with_context(|| format!("打开文件失败: {}", input.display()))?;
                let count = backup::import_json(service.store(), std::io::BufReader::new(file))?;
                service.cache().clear();
                count
            } else {
                service.import_zip(&input)?
            };
            println!("已导入 {} 条记录", count);
        }
        Commands::Forget { input } => {
            let forgotten = service.forget(&input)?;
            println!("{}", if forgotten { "已删除" } else { "没有记录" });
        }
        Commands::Rename { from, to } => {
            let moved = service.rename(&from, &to)?;
            println!("{}", if moved { "已迁移" } else { "没有记录" });
        }
        Commands::InitConfig { .. } => {}
    }
    Ok(())
}

fn run_slides(service: &ThumbnailService, command: SlideCommands) -> Result<()> {
    let slides = service.slideshow();
    match command {
        SlideCommands::List { input } => {
            for thumbnail in slides.thumbnails_for_video(&input)? {
                print_slide(&thumbnail);
            }
        }
        SlideCommands::Add {
            input,
            image,
            at,
            default,
        } => print_slide(&slides.add_thumbnail(&input, &image, at, default)?),
        SlideCommands::Capture { input, at, default } => {
            print_slide(&slides.capture_thumbnail(&input, at, default)?)
        }
        SlideCommands::Default { input, at } => match slides.set_default_at(&input, at)? {
            Some(thumbnail) => print_slide(&thumbnail),
            None => println!("{}ms 之前没有缩略图", at),
        },
        SlideCommands::Remove { input, at } => {
            let removed = match at {
                Some(at) => usize::from(slides.delete_thumbnail_at(&input, at)?),
                None => slides.delete_all_thumbnails(&input)?,
            };
            println!("已删除 {} 张", removed);
        }
    }
    Ok(())
}

fn print_slide(thumbnail: &VideoThumbnail) {
    println!(
        "#{}\t{}\t{}{}\t{}",
        thumbnail.id,
        thumbnail.display_order,
        format_duration(thumbnail.timestamp_ms),
        if thumbnail.is_default { " *" } else { "" },
        thumbnail.thumbnail_path
    );
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn format_duration(millis: i64) -> String {
    let total = millis.max(0) / 1000;
    let (h, m, s) = (total / 3600, total / 60 % 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}
