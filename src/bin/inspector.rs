// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 无界面检测 (Headless Inspector)
///
/// 系统架构:
/// 1. 相机线程: 连续采集或单拍 (FrameSource)
/// 2. 执行线程: 按作业顺序运行工具, 产出 OK/NG
/// 3. 主线程:   读取每帧摘要并输出日志
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use inspector_rs::camera::CameraDevice;
use inspector_rs::review::ReviewSnapshot;
use inspector_rs::settings::LogUiHost;
use inspector_rs::{
    gen_time_string, AppConfig, AppContext, CameraMode, ReviewListener, RunReport, Status, StubCamera,
    VisionError,
};

/// 检测参数
#[derive(Parser, Debug)]
#[command(author, version, about = "OK/NG 视觉检测 (无界面)", long_about = None)]
struct Args {
    /// 配置文件 (缺省为用户配置目录)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 作业文件
    #[arg(short, long)]
    job: Option<PathBuf>,

    /// 采集模式: live 或 trigger
    #[arg(short, long, default_value = "live")]
    mode: CameraMode,

    /// 连续模式下处理多少帧后退出
    #[arg(long, default_value_t = 100)]
    frames: u64,

    /// 触发模式下拍多少张
    #[arg(long, default_value_t = 5)]
    shots: u32,

    /// 使用模拟相机
    #[arg(long, default_value_t = false)]
    stub: bool,

    /// 退出前保存作业
    #[arg(long)]
    save_job: Option<PathBuf>,

    /// 退出前把当前显示图保存到该目录
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
}

/// 回看更新只打日志
struct LogReviewListener;

impl ReviewListener for LogReviewListener {
    fn on_review_update(&self, snapshot: &ReviewSnapshot) {
        let panes: Vec<&str> = snapshot
            .pane_statuses()
            .iter()
            .map(|s| if *s == Status::Ok { "OK" } else { "NG" })
            .collect();
        info!("🖼️ 回看 [{}]", panes.join(" "));
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {:#}", e);
            let code = e
                .downcast_ref::<VisionError>()
                .map(|v| v.exit_code())
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config_path = args.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = if args.config.is_some() {
        AppConfig::load_strict(&config_path)?
    } else {
        AppConfig::load(&config_path)
    };
    if args.job.is_some() {
        config.job_path = args.job.clone();
    }
    config.print_summary();

    let device: Option<Box<dyn CameraDevice>> = if args.stub {
        let (cam, _handle) = StubCamera::imx296();
        info!("📷 使用模拟相机");
        Some(Box::new(cam))
    } else {
        None
    };

    let mut app = AppContext::new(config, device, Arc::new(LogUiHost), Arc::new(LogReviewListener))?;
    let reports = app.reports();
    app.start()?;
    app.set_mode(args.mode)?;

    let mut ok = 0u64;
    let mut ng = 0u64;
    let mut tally = |report: &RunReport| {
        if report.verdict.is_ok() {
            ok += 1;
        } else {
            ng += 1;
        }
        info!(
            "🔍 帧 {} → {:?} ({:.3}) {} [{:.1} ms]",
            report.sequence,
            report.verdict.status,
            report.verdict.similarity,
            report.verdict.reason,
            report.elapsed.as_secs_f64() * 1000.0
        );
        if let Some(err) = &report.error {
            warn!("⚠️ {}", err);
        }
    };

    match args.mode {
        CameraMode::Live => {
            let deadline = Instant::now() + Duration::from_secs(60);
            let mut seen = 0;
            while seen < args.frames && Instant::now() < deadline {
                if let Ok(report) = reports.recv_timeout(Duration::from_secs(1)) {
                    tally(&report);
                    seen += 1;
                }
            }
        }
        CameraMode::Trigger => {
            let cooldown = app.config().source_config().cooldown;
            for shot in 0..args.shots {
                std::thread::sleep(cooldown);
                if !app.trigger() {
                    warn!("⚠️ 第 {} 次单拍被忽略", shot + 1);
                    continue;
                }
                match reports.recv_timeout(Duration::from_secs(5)) {
                    Ok(report) => tally(&report),
                    Err(_) => warn!("⚠️ 第 {} 次单拍没有结果", shot + 1),
                }
            }
        }
    }
    info!("📊 OK: {}  NG: {}", ok, ng);

    if let Some(dir) = &args.snapshot_dir {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.png", gen_time_string("-")));
        app.display_image()
            .save(&path)
            .with_context(|| format!("保存截图失败: {}", path.display()))?;
        info!("💾 截图已保存到 {}", path.display());
    }
    if let Some(path) = &args.save_job {
        app.jobs().lock().save(path)?;
    }

    app.shutdown();
    Ok(())
}
