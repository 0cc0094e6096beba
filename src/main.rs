use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tire_data::config::{AppConfig, ConfigLoader, SamplingOverrides, StoreBackend};
use tire_data::handler::{self, AppState};
use tire_data::{extract_to_dir, process_upload, FfmpegDecoder, MeasurementStore};
use tracing_subscriber::EnvFilter;

/// 轮胎数据采集工具 - 从轮胎视频中采样静帧并上传
#[derive(Parser, Debug)]
#[command(name = "tire-data")]
#[command(about = "轮胎数据采集：视频抽帧、媒体上传、测量记录存储", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// 采样参数，可通过环境变量 TIRE_DATA_* 或配置文件 [sampling] 节设置
#[derive(clap::Args, Debug, Default)]
struct SamplingArgs {
    /// 最多提取多少帧
    #[arg(long)]
    max_frames: Option<usize>,

    /// 每秒候选帧数
    #[arg(long)]
    fps: Option<f64>,

    /// JPEG 质量 (0, 1]
    #[arg(long)]
    quality: Option<f64>,

    /// 缩放比例 (0, 1]
    #[arg(long)]
    scale: Option<f64>,

    /// 随机挑选时间点（结果仍按时间排序）
    #[arg(long)]
    randomize: bool,
}

impl SamplingArgs {
    fn overrides(&self) -> SamplingOverrides {
        SamplingOverrides {
            max_frames: self.max_frames,
            frames_per_second: self.fps,
            quality: self.quality,
            scale_factor: self.scale,
            randomize: self.randomize.then_some(true),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 本地抽帧：输出 JPEG 文件和 frames.json，不上传
    Extract {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 输出目录
        #[arg(short, long, default_value = "./frames")]
        output: PathBuf,

        #[command(flatten)]
        sampling: SamplingArgs,
    },
    /// 完整流程：上传视频、抽帧、上传帧，结果以 JSON 打印
    Process {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        sampling: SamplingArgs,
    },
    /// Web 服务模式
    Serve {
        /// 监听地址（其次环境变量 TIRE_DATA_PORT，再次配置 [server] bind，最后 0.0.0.0:3000）
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// 生成默认配置文件
    InitConfig {
        #[arg(short, long, default_value = "tire-data.ini")]
        path: PathBuf,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Commands::InitConfig { path } = &args.command {
        ConfigLoader::create_default_config(path).context("创建配置文件失败")?;
        println!("已生成配置文件: {}", path.display());
        return Ok(());
    }

    let overrides = match &args.command {
        Commands::Extract { sampling, .. } | Commands::Process { sampling, .. } => sampling.overrides(),
        _ => SamplingOverrides::default(),
    };
    let config = ConfigLoader::load(args.config.as_deref(), &overrides).context("加载配置失败")?;
    init_logging(&config.log_level);

    match args.command {
        Commands::Extract { input, output, .. } => {
            println!(
                "使用配置: max_frames={}, fps={:.2}, quality={:.2}, scale={:.2}, randomize={}",
                config.sampling.max_frames,
                config.sampling.frames_per_second,
                config.sampling.quality,
                config.sampling.scale_factor,
                config.sampling.randomize
            );
            let sampling = config.sampling.clone();
            let result = tokio::task::spawn_blocking(move || extract_to_dir(&FfmpegDecoder, &input, &output, sampling))
                .await
                .context("抽帧任务异常")?
                .context("抽帧失败")?;
            println!("已写出 {} 帧，清单: {}", result.frames.len(), result.manifest_path.display());
            if !result.failures.is_empty() {
                println!("跳过 {} 帧", result.failures.len());
            }
        }
        Commands::Process { input, .. } => {
            run_process(&config, &input).await?;
        }
        Commands::Serve { bind } => {
            let bind_addr = bind
                .or_else(|| config.server_bind.clone())
                .unwrap_or_else(|| "0.0.0.0:3000".to_string());
            start_web_server(&config, &bind_addr).await?;
        }
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

async fn run_process(config: &AppConfig, input: &Path) -> Result<()> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("读取视频失败: {}", input.display()))?;
    let filename = input
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.mp4")
        .to_string();

    let pipeline = config.build_pipeline()?;
    let output = process_upload(&pipeline, Arc::new(FfmpegDecoder), bytes, &filename, config.sampling.clone())
        .await
        .context("处理视频失败")?;

    println!("{}", serde_json::to_string_pretty(&output.upload)?);
    Ok(())
}

async fn start_web_server(config: &AppConfig, bind: &str) -> Result<()> {
    let pipeline = config.build_pipeline()?;
    let measurements = MeasurementStore::open(&config.database_path)
        .with_context(|| format!("打开数据库失败: {}", config.database_path.display()))?;

    let static_files = match config.backend {
        StoreBackend::Local => {
            std::fs::create_dir_all(&config.local.upload_dir)
                .with_context(|| format!("创建上传目录失败: {}", config.local.upload_dir.display()))?;
            Some((config.local.url_prefix.clone(), config.local.upload_dir.clone()))
        }
        _ => None,
    };

    let state = AppState {
        pipeline: Arc::new(pipeline),
        decoder: Arc::new(FfmpegDecoder),
        measurements: Arc::new(measurements),
        sampling: config.sampling.clone(),
        static_files,
    };
    let app = handler::router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("存储后端: {:?}，数据库: {}", config.backend, config.database_path.display());
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 上传视频: POST http://{}/api/upload-video", bind);
    tracing::info!("  • 上传帧:   POST http://{}/api/upload-frame", bind);
    tracing::info!("  • 完整处理: POST http://{}/api/process", bind);
    tracing::info!("  • 测量记录: GET/POST http://{}/api/measurements", bind);
    tracing::info!("  • 单条记录: GET/DELETE http://{}/api/measurements/:id", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app).await.context("启动服务器失败")?;

    Ok(())
}
