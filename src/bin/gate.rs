/// 车辆闸口哨兵 (Gate Sentinel)
///
/// 系统架构:
/// 1. 采集: 图片目录 / RTSP / 本地摄像头
/// 2. 处理线程: 检测 → 稳定跟踪 → 车牌识别 → 通行决策 (顺序执行)
/// 3. 主线程:   读取最新决策 + 状态汇报
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use gate_sentinel::config::DEFAULT_CONFIG_PATH;
use gate_sentinel::{
    AuthorizationStore, GateAction, GateConfig, GatePipeline, GateService, HttpPlateRecognizer, JsonPlateStore,
    LatestDecision, SourceSpec, YoloV8Detector,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// 闸口哨兵参数
#[derive(Parser, Debug)]
#[command(author, version, about = "车辆闸口哨兵 - 检测稳定化 + 车牌识别 + 通行决策", long_about = None)]
struct Cli {
    /// 配置文件
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动采集与检测
    Run {
        /// 帧源: 图片目录 / rtsp://... / camera:N
        #[arg(short, long)]
        source: String,

        /// 只采集显示, 不做检测
        #[arg(long)]
        no_detect: bool,

        /// 图片目录回放帧率
        #[arg(long)]
        fps: Option<f32>,

        /// 运行时长 (秒), 不指定则运行到帧源结束
        #[arg(long)]
        duration: Option<u64>,
    },

    /// 授权车牌管理
    Plates {
        #[command(subcommand)]
        action: PlateAction,
    },

    /// 查询车牌是否授权
    Check { plate: String },

    /// 列出本机摄像头 (用于 `--source camera:N`)
    Cameras,

    /// 最近通行日志
    Logs {
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// 配置文件管理
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum PlateAction {
    List,
    Add { plate: String },
    Remove { id: u64 },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// 写出默认配置
    Init {
        #[arg(long)]
        path: Option<String>,
    },
    /// 打印当前配置
    Show,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gate_sentinel=info,gate=info,ort=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Config { action } => config_command(&cli.config, action),
        Command::Run {
            source,
            no_detect,
            fps,
            duration,
        } => {
            let config = load_config(&cli.config)?;
            let store = open_store(&config)?;
            run(&config, store, &source, !no_detect, fps, duration.map(Duration::from_secs))
        }
        Command::Plates { action } => {
            let store = open_store(&load_config(&cli.config)?)?;
            plates(store.as_ref(), action)
        }
        Command::Check { plate } => {
            let store = open_store(&load_config(&cli.config)?)?;
            let authorized = store.is_authorized(&plate)?;
            let action = GateAction::from_authorized(authorized);
            println!("{} → {} (authorized={})", plate.trim().to_uppercase(), action, authorized);
            Ok(())
        }
        Command::Cameras => cameras(),
        Command::Logs { limit } => {
            let store = open_store(&load_config(&cli.config)?)?;
            for log in store.recent_access_logs(limit)? {
                println!(
                    "{}  {:<10} {:<10} {:<6} success={}",
                    log.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    log.plate_number,
                    log.vehicle_type,
                    log.action,
                    log.success
                );
            }
            Ok(())
        }
    }
}

fn load_config(path: &str) -> Result<GateConfig> {
    let config = GateConfig::load(path);
    config.validate()?;
    Ok(config)
}

fn config_command(config_path: &str, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { path } => {
            GateConfig::default().save(path.as_deref().unwrap_or(config_path))?;
        }
        ConfigAction::Show => {
            let config = GateConfig::load(config_path);
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

fn open_store(config: &GateConfig) -> Result<Arc<dyn AuthorizationStore>> {
    Ok(match &config.store_path {
        Some(path) => Arc::new(JsonPlateStore::open(path).with_context(|| format!("打开授权库 {path}"))?),
        None => Arc::new(JsonPlateStore::in_memory()),
    })
}

fn plates(store: &dyn AuthorizationStore, action: PlateAction) -> Result<()> {
    match action {
        PlateAction::List => {
            let plates = store.list_plates()?;
            println!("📋 {} 个授权车牌", plates.len());
            for p in plates {
                println!("  #{:<4} {:<10} {}", p.id, p.plate_number, p.created_at.format("%Y-%m-%d %H:%M:%S"));
            }
        }
        PlateAction::Add { plate } => {
            if !store.add_plate(&plate)? {
                bail!("车牌 {plate} 未添加 (已存在或格式不合法)");
            }
            println!("✅ 已添加 {}", plate.trim().to_uppercase());
        }
        PlateAction::Remove { id } => {
            if !store.remove_plate(id)? {
                bail!("车牌 #{id} 不存在");
            }
            println!("🗑️ 已删除 #{id}");
        }
    }
    Ok(())
}

#[cfg(feature = "ffmpeg")]
fn cameras() -> Result<()> {
    let devices = gate_sentinel::input::FfmpegSource::list_devices()?;
    if devices.is_empty() {
        println!("⚠️ 未发现摄像头");
    }
    for (index, name) in devices {
        println!("  camera:{index}  {name}");
    }
    Ok(())
}

#[cfg(not(feature = "ffmpeg"))]
fn cameras() -> Result<()> {
    bail!("摄像头枚举需要启用 `ffmpeg` 特性")
}

fn run(
    config: &GateConfig,
    store: Arc<dyn AuthorizationStore>,
    source: &str,
    detect: bool,
    fps: Option<f32>,
    duration: Option<Duration>,
) -> Result<()> {
    config.print_summary();

    let spec: SourceSpec = source.parse()?;
    let frame_source = spec.build(config.frame_queue_capacity, fps)?;

    let detector = YoloV8Detector::new(config)?;
    let ocr = HttpPlateRecognizer::from_config(config);
    let pipeline = GatePipeline::new(config, Box::new(detector), Box::new(ocr), store, LatestDecision::new())?;

    let mut service = GateService::new(pipeline, config.frame_queue_capacity);
    if detect {
        service.start_detection();
    }
    service.start_capture(frame_source)?;
    info!("🚀 闸口哨兵已启动: {}", spec);

    let started = Instant::now();
    let mut last_report = Instant::now();
    while service.is_capturing() {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        if let Some(decision) = service.take_latest() {
            println!("{}", serde_json::to_string(&decision)?);
        }
        if last_report.elapsed() >= Duration::from_secs(5) {
            let s = service.status();
            info!(
                "📊 帧: {} | 处理: {} | 决策: {} | 稳定轨迹: {}",
                s.frames_seen, s.frames_processed, s.decisions, s.stable_tracks
            );
            last_report = Instant::now();
        }
        thread::sleep(Duration::from_millis(100));
    }

    service.stop_capture()?;
    if let Some(decision) = service.take_latest() {
        println!("{}", serde_json::to_string(&decision)?);
    }
    let s = service.status();
    info!("🏁 结束: 帧 {} | 处理 {} | 决策 {}", s.frames_seen, s.frames_processed, s.decisions);
    Ok(())
}
