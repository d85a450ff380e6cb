// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 应用上下文 (AppContext)
//!
//! ```text
//! FrameSource ──FrameSlot(最新一帧)──▶ 执行线程 ──▶ JobManager::run
//!                                                   │
//!                       判定 ──▶ ResultManager 历史 + ReviewRing (同一把锁内成对写入)
//!                                                   │
//!                                          ReviewPublisher ──▶ 界面
//! 相机致命错误 ──▶ 事件线程 ──▶ UiHost 对话框
//! ```
//! 所有组件都由这里创建并注入, 没有进程级单例。

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use image::RgbImage;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::camera::{CameraDevice, CameraMode, FrameSlot, FrameSource, SinkId, SourceEvent, SourceState};
use crate::config::AppConfig;
use crate::error::{Result, VisionError};
use crate::frame::Frame;
use crate::job::{CameraSourceState, JobManager};
use crate::pipeline::{FrameStore, PipelineContext, PipelineRun};
use crate::result::{ResultManager, Status, Verdict};
use crate::review::{ReviewListener, ReviewNotifier, ReviewPublisher, ReviewRing};
use crate::settings::{SettingsCoordinator, UiButton, UiHost};
use crate::tools::ToolEnv;
use crate::view::ViewCoordinator;

/// 一帧处理完成后的摘要
#[derive(Debug, Clone)]
pub struct RunReport {
    pub sequence: u64,
    pub verdict: Verdict,
    pub failed_tools: Vec<u32>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// 回看窗格内容
#[derive(Debug, Clone)]
pub struct ReviewPane {
    pub frame: Frame,
    pub status: Status,
}

/// 执行线程与调用方共享的部分
struct Pipeline {
    jobs: Arc<Mutex<JobManager>>,
    results: Arc<ResultManager>,
    review: Arc<ReviewRing>,
    /// 回看环与判定历史成对写入/读取
    record_lock: Mutex<()>,
    latest: Mutex<Option<PipelineContext>>,
    notifier: ReviewNotifier,
    reports: Sender<RunReport>,
}

impl Pipeline {
    fn process(&self, frame: &Frame) -> RunReport {
        let started = Instant::now();
        let run: PipelineRun = self.jobs.lock().run(frame);
        let verdict = run.context.verdict.clone().unwrap_or_default();

        {
            let _guard = self.record_lock.lock();
            self.results.record(verdict.clone());
            self.review.append(run.output.clone(), verdict.clone());
        }
        self.notifier.notify();

        let report = RunReport {
            sequence: frame.sequence(),
            verdict,
            failed_tools: run.failed_tools(),
            error: run.error.clone(),
            elapsed: started.elapsed(),
        };
        *self.latest.lock() = Some(run.context);
        let _ = self.reports.try_send(report.clone());
        report
    }
}

pub struct AppContext {
    config: AppConfig,
    source: FrameSource,
    /// 相机源模式与是否存在; 执行线程推理时不用等作业锁
    camera: Arc<CameraSourceState>,
    pipeline: Arc<Pipeline>,
    store: Arc<FrameStore>,
    view: Mutex<ViewCoordinator>,
    settings: Mutex<SettingsCoordinator>,
    host: Arc<dyn UiHost>,
    sink_id: SinkId,
    reports_rx: Receiver<RunReport>,
    stop_tx: Option<Sender<()>>,
    workers: Vec<(JoinHandle<()>, Receiver<()>)>,
    publisher: Option<ReviewPublisher>,
}

impl AppContext {
    /// 创建全部组件; device 为 None 时相机不可用, 编辑器仍可使用
    pub fn new(
        config: AppConfig,
        device: Option<Box<dyn CameraDevice>>,
        host: Arc<dyn UiHost>,
        listener: Arc<dyn ReviewListener>,
    ) -> Result<Self> {
        config.validate()?;
        let source = match device {
            Some(device) => FrameSource::new(device, config.source_config()),
            None => {
                warn!("⚠️ 没有相机设备, 相机相关功能不可用");
                FrameSource::detached(config.source_config())
            }
        };
        if source.has_device() {
            source.configure(config.camera.clone())?;
        }

        let results = Arc::new(ResultManager::new(config.review.capacity));
        let review = Arc::new(ReviewRing::new(config.review.capacity));
        let store = Arc::new(FrameStore::new());
        let env = ToolEnv::new(results.clone()).with_source(source.clone());
        let mut jobs = JobManager::with_registry(env, Default::default(), store.clone());
        if let Some(path) = &config.job_path {
            jobs.load(path)?;
        }

        let camera = jobs.camera_state();

        let publisher = ReviewPublisher::spawn(review.clone(), listener, config.notify_interval())?;
        let (reports_tx, reports_rx) = bounded(64);
        let pipeline = Arc::new(Pipeline {
            jobs: Arc::new(Mutex::new(jobs)),
            results,
            review,
            record_lock: Mutex::new(()),
            latest: Mutex::new(None),
            notifier: publisher.notifier(),
            reports: reports_tx,
        });

        let slot = Arc::new(FrameSlot::new());
        let sink_id = source.subscribe(slot.clone());
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let mut workers = Vec::new();
        {
            let pipeline = pipeline.clone();
            let frames = slot.receiver();
            let stop_rx = stop_rx.clone();
            workers.push(spawn_worker("pipeline-executor", move || {
                executor_loop(pipeline, frames, stop_rx)
            })?);
        }
        {
            let events = source.events();
            let host = host.clone();
            workers.push(spawn_worker("source-events", move || {
                event_loop(events, host, stop_rx)
            })?);
        }

        let view = ViewCoordinator::new(store.clone()).with_zoom(config.view.zoom);
        let settings = SettingsCoordinator::new(Some(source.clone()));
        info!("🚀 应用上下文已启动");
        Ok(Self {
            config,
            source,
            camera,
            pipeline,
            store,
            view: Mutex::new(view),
            settings: Mutex::new(settings),
            host,
            sink_id,
            reports_rx,
            stop_tx: Some(stop_tx),
            workers,
            publisher: Some(publisher),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    pub fn jobs(&self) -> Arc<Mutex<JobManager>> {
        self.pipeline.jobs.clone()
    }

    pub fn results(&self) -> &Arc<ResultManager> {
        &self.pipeline.results
    }

    pub fn review(&self) -> &Arc<ReviewRing> {
        &self.pipeline.review
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    pub fn view(&self) -> &Mutex<ViewCoordinator> {
        &self.view
    }

    pub fn settings(&self) -> &Mutex<SettingsCoordinator> {
        &self.settings
    }

    /// 每帧处理摘要
    pub fn reports(&self) -> Receiver<RunReport> {
        self.reports_rx.clone()
    }

    // ========== 相机 ==========

    /// 按作业里相机源的配置启动相机
    pub fn start(&self) -> Result<()> {
        if !self.source.has_device() {
            return Err(VisionError::DeviceUnavailable("没有相机设备".into()));
        }
        let mode = match self.camera.config() {
            Some(camera) => {
                camera.apply_to(&self.source)?;
                camera.mode
            }
            None => CameraMode::Live,
        };
        self.set_mode(mode)
    }

    /// 模式按钮: 切换连续/触发
    pub fn set_mode(&self, mode: CameraMode) -> Result<()> {
        self.source.set_mode(mode)?;
        self.camera.request_mode(mode);
        self.host.on_mode_changed(mode);
        self.refresh_buttons();
        Ok(())
    }

    /// 触发按钮: 单拍, 帧经 FrameSlot 进入执行线程
    pub fn trigger(&self) -> bool {
        self.source.capture_once().is_some()
    }

    pub fn refresh_buttons(&self) {
        let has_camera_source = self.camera.is_present();
        let state = self.source.state();
        let running = matches!(state, SourceState::Live | SourceState::TriggerArmed);
        let usable = self.source.has_device() && state != SourceState::Error;
        self.host.set_button_enabled(UiButton::Live, usable);
        self.settings
            .lock()
            .refresh_buttons(self.host.as_ref(), self.source.mode(), has_camera_source, running);
    }

    // ========== 处理 ==========

    /// 同步处理一帧 (无相机或测试时使用)
    pub fn process_frame(&self, frame: &Frame) -> RunReport {
        self.pipeline.process(frame)
    }

    /// 用最近一次结果设置参考 (操作员手势)
    pub fn set_reference_from_latest(&self) -> Result<()> {
        let latest = self.pipeline.latest.lock().clone();
        let ctx = latest.ok_or(VisionError::ReferenceMissing)?;
        match (ctx.detections, ctx.classifications) {
            (Some(dets), _) => {
                self.pipeline
                    .results
                    .set_reference_detections(dets, ctx.detection_tool_id);
            }
            (None, Some(cls)) => {
                self.pipeline
                    .results
                    .set_reference_classifications(cls, ctx.classification_tool_id);
            }
            (None, None) => return Err(VisionError::ReferenceMissing),
        }
        self.host.show_toast("参考已设置");
        Ok(())
    }

    /// 窗格 1..=N, 最新在前, 帧与判定同一时刻读取
    pub fn review_panes(&self) -> Vec<ReviewPane> {
        let _guard = self.pipeline.record_lock.lock();
        self.pipeline
            .review
            .snapshot()
            .entries
            .into_iter()
            .rev()
            .map(|entry| ReviewPane {
                frame: entry.frame,
                status: entry.verdict.status,
            })
            .collect()
    }

    pub fn display_image(&self) -> RgbImage {
        self.view.lock().display_image()
    }

    // ========== 退出 ==========

    /// 停相机, 通知线程退出, 在宽限期内等待
    pub fn shutdown(&mut self) {
        if self.stop_tx.is_none() {
            return;
        }
        info!("🛑 正在关闭...");
        self.source.unsubscribe(self.sink_id);
        self.source.shutdown();
        self.stop_tx.take();

        let deadline = Instant::now() + self.config.shutdown_grace();
        for (handle, done) in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            let remaining = deadline.saturating_duration_since(Instant::now());
            match done.recv_timeout(remaining) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if handle.join().is_err() {
                        error!("❌ 线程 {} panic", name);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("⚠️ 线程 {} 未在宽限期内退出, 放弃等待", name);
                }
            }
        }
        if let Some(mut publisher) = self.publisher.take() {
            publisher.shutdown();
        }
        self.pipeline.jobs.lock().cleanup();
        info!("👋 已关闭");
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 启动线程, 返回 (句柄, 退出信号)
fn spawn_worker<F>(name: &str, f: F) -> Result<(JoinHandle<()>, Receiver<()>)>
where
    F: FnOnce() + Send + 'static,
{
    let (done_tx, done_rx) = bounded(1);
    let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
        f();
        let _ = done_tx.send(());
    })?;
    Ok((handle, done_rx))
}

fn executor_loop(pipeline: Arc<Pipeline>, frames: Receiver<Frame>, stop_rx: Receiver<()>) {
    info!("🔍 执行线程启动");
    let mut count = 0u64;
    let mut last = Instant::now();
    loop {
        select! {
            recv(frames) -> msg => match msg {
                Ok(frame) => {
                    let report = pipeline.process(&frame);
                    count += 1;
                    if !report.failed_tools.is_empty() {
                        debug!("帧 {} 有工具失败: {:?}", report.sequence, report.failed_tools);
                    }
                }
                Err(_) => break,
            },
            recv(stop_rx) -> _ => break,
        }

        if last.elapsed() >= Duration::from_secs(1) {
            debug!("⚡ 执行 {:.1} fps", count as f64 / last.elapsed().as_secs_f64());
            count = 0;
            last = Instant::now();
        }
    }
    debug!("执行线程退出");
}

fn event_loop(events: Receiver<SourceEvent>, host: Arc<dyn UiHost>, stop_rx: Receiver<()>) {
    loop {
        select! {
            recv(events) -> msg => match msg {
                Ok(SourceEvent::Fatal(message)) => {
                    error!("❌ 相机致命错误: {}", message);
                    host.show_dialog("相机错误", &message);
                    host.set_button_enabled(UiButton::Live, false);
                    host.set_button_enabled(UiButton::Trigger, false);
                }
                Ok(SourceEvent::ControlsFallback) => {
                    host.show_toast("降噪控制不可用, 已使用基本控制");
                }
                Ok(SourceEvent::StateChanged(state)) => {
                    debug!("相机状态 → {:?}", state);
                }
                Err(_) => break,
            },
            recv(stop_rx) -> _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::StubCamera;
    use crate::review::ReviewSnapshot;
    use crate::settings::RecordingUiHost;
    use crate::tools::ToolKind;

    struct NoopListener;

    impl ReviewListener for NoopListener {
        fn on_review_update(&self, _snapshot: &ReviewSnapshot) {}
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.camera.width = 64;
        config.camera.height = 48;
        config.shutdown_grace_ms = 1000;
        config
    }

    #[test]
    fn test_headless_processing_without_device() {
        let host = Arc::new(RecordingUiHost::new());
        let mut app = AppContext::new(config(), None, host, Arc::new(NoopListener)).unwrap();
        assert!(matches!(app.start(), Err(VisionError::DeviceUnavailable(_))));

        let report = app.process_frame(&Frame::black(8, 8));
        assert_eq!(report.error.as_deref(), Some(crate::pipeline::NO_TOOLS));
        assert_eq!(report.verdict.status, Status::Ng);
        assert_eq!(app.review_panes().len(), 1);
        assert!(app.set_reference_from_latest().is_err());
        app.shutdown();
    }

    #[test]
    fn test_fatal_event_reaches_host() {
        let (cam, handle) = StubCamera::new(64, 48);
        let host = Arc::new(RecordingUiHost::new());
        let app = AppContext::new(config(), Some(Box::new(cam)), host.clone(), Arc::new(NoopListener)).unwrap();
        app.jobs().lock().add_tool(ToolKind::CameraSource, Some(&serde_json::json!({"width": 64, "height": 48}))).unwrap();
        app.start().unwrap();
        assert_eq!(app.source().state(), SourceState::Live);

        handle.disconnect();
        let deadline = Instant::now() + Duration::from_secs(2);
        while host.dialogs() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(host.dialogs(), 1);
        assert_eq!(app.source().state(), SourceState::Error);
    }

    #[test]
    fn test_mode_switch_while_job_is_busy() {
        let (cam, _handle) = StubCamera::new(64, 48);
        let host = Arc::new(RecordingUiHost::new());
        let app = AppContext::new(config(), Some(Box::new(cam)), host.clone(), Arc::new(NoopListener)).unwrap();
        app.jobs().lock().add_tool(ToolKind::CameraSource, Some(&serde_json::json!({"width": 64, "height": 48}))).unwrap();
        app.start().unwrap();

        // 一次很慢的推理: 另一个线程长时间持有作业锁
        let jobs = app.jobs();
        let (locked_tx, locked_rx) = bounded(0);
        let busy = thread::spawn(move || {
            let _guard = jobs.lock();
            locked_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(800));
        });
        locked_rx.recv().unwrap();

        let started = Instant::now();
        app.set_mode(CameraMode::Trigger).unwrap();
        app.refresh_buttons();
        assert!(started.elapsed() < Duration::from_millis(200), "set_mode took {:?}", started.elapsed());
        assert_eq!(app.source().mode(), CameraMode::Trigger);
        assert_eq!(host.button(UiButton::Trigger), Some(true));
        busy.join().unwrap();

        // 锁释放后模式写回作业
        let doc = app.jobs().lock().to_document();
        assert_eq!(doc.tools[0].config["mode"], "trigger");
        app.process_frame(&Frame::black(8, 8));
        assert_eq!(app.jobs().lock().camera_source().map(|c| c.mode()), Some(CameraMode::Trigger));
    }
}
