// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! FrameSource: 相机状态机与生产线程
//!
//! ```text
//! Uninitialized --configure--> Configured --start_live--> Live
//! Configured --set_mode(trigger)--> TriggerArmed --capture_once--> TriggerArmed
//! Live --set_mode(trigger)--> TriggerArmed --set_mode(live)--> Live
//! 任意状态 --设备丢失--> Error --reset--> Configured
//! ```
//!
//! 锁顺序: transition (配置/模式切换的串行点) → device (每次设备调用) → status。
//! 生产线程只拿 device 和 status, 不会和控制线程互等。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use super::guard::SingleShotGuard;
use super::sink::{FrameSink, SinkId};
use super::{
    CameraControls, CameraDevice, CameraMode, CameraSettings, DeviceConfig, RawBuffer,
    SourceState,
};
use crate::error::{ErrorKind, Result, VisionError};
use crate::frame::{Frame, FrameMetadata, Rotation};

/// FrameSource 运行参数
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// 单拍冷却
    pub cooldown: Duration,
    /// 单拍请求超时
    pub capture_timeout: Duration,
    pub buffer_count: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(250),
            capture_timeout: Duration::from_millis(1000),
            buffer_count: 4,
        }
    }
}

/// 状态变化与致命错误通知
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    StateChanged(SourceState),
    Fatal(String),
    /// 降噪控制被拒绝, 已改用最小控制集
    ControlsFallback,
}

struct Status {
    state: SourceState,
    mode: CameraMode,
    settings: CameraSettings,
    last_good: Option<CameraSettings>,
}

struct Producer {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

struct Shared {
    transition: Mutex<()>,
    device: Mutex<Option<Box<dyn CameraDevice>>>,
    status: Mutex<Status>,
    sinks: RwLock<Vec<(SinkId, Arc<dyn FrameSink>)>>,
    next_sink_id: AtomicU64,
    sequence: AtomicU64,
    emitted: AtomicU64,
    missed: AtomicU64,
    producer: Mutex<Option<Producer>>,
    guard: SingleShotGuard,
    capture_timeout: Duration,
    buffer_count: u32,
    events_tx: Sender<SourceEvent>,
    events_rx: Receiver<SourceEvent>,
}

/// 相机帧源句柄 (clone 共享同一个相机)
#[derive(Clone)]
pub struct FrameSource {
    shared: Arc<Shared>,
}

impl FrameSource {
    pub fn new(device: Box<dyn CameraDevice>, config: SourceConfig) -> Self {
        Self::build(Some(device), config)
    }

    /// 没有相机的帧源: 所有设备操作返回 DeviceUnavailable
    pub fn detached(config: SourceConfig) -> Self {
        Self::build(None, config)
    }

    fn build(device: Option<Box<dyn CameraDevice>>, config: SourceConfig) -> Self {
        let (events_tx, events_rx) = bounded(64);
        Self {
            shared: Arc::new(Shared {
                transition: Mutex::new(()),
                device: Mutex::new(device),
                status: Mutex::new(Status {
                    state: SourceState::Uninitialized,
                    mode: CameraMode::Live,
                    settings: CameraSettings::default(),
                    last_good: None,
                }),
                sinks: RwLock::new(Vec::new()),
                next_sink_id: AtomicU64::new(1),
                sequence: AtomicU64::new(0),
                emitted: AtomicU64::new(0),
                missed: AtomicU64::new(0),
                producer: Mutex::new(None),
                guard: SingleShotGuard::new(config.cooldown),
                capture_timeout: config.capture_timeout,
                buffer_count: config.buffer_count.max(1),
                events_tx,
                events_rx,
            }),
        }
    }

    // ========== 查询 ==========

    pub fn state(&self) -> SourceState {
        self.shared.status.lock().state
    }

    pub fn mode(&self) -> CameraMode {
        self.shared.status.lock().mode
    }

    pub fn settings(&self) -> CameraSettings {
        self.shared.status.lock().settings.clone()
    }

    pub fn has_device(&self) -> bool {
        self.shared.device.lock().is_some()
    }

    pub fn sensor_resolution(&self) -> Option<(u32, u32)> {
        self.shared
            .device
            .lock()
            .as_ref()
            .map(|dev| dev.sensor_resolution())
    }

    /// 读帧失败累计次数
    pub fn missed_frames(&self) -> u64 {
        self.shared.missed.load(Ordering::Relaxed)
    }

    pub fn frames_emitted(&self) -> u64 {
        self.shared.emitted.load(Ordering::Relaxed)
    }

    /// 最近发出的帧序号 (0 表示还没出过帧)
    pub fn last_sequence(&self) -> u64 {
        self.shared.sequence.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Receiver<SourceEvent> {
        self.shared.events_rx.clone()
    }

    // ========== 订阅 ==========

    pub fn subscribe(&self, sink: Arc<dyn FrameSink>) -> SinkId {
        let id = self.shared.next_sink_id.fetch_add(1, Ordering::Relaxed);
        self.shared.sinks.write().push((id, sink));
        debug!("📷 新订阅者 #{}", id);
        id
    }

    pub fn unsubscribe(&self, id: SinkId) -> bool {
        let mut sinks = self.shared.sinks.write();
        let before = sinks.len();
        sinks.retain(|(sid, _)| *sid != id);
        sinks.len() != before
    }

    // ========== 配置与模式 ==========

    /// 应用完整配置, 成功后进入 Configured (会停止连续采集)
    ///
    /// 失败时恢复上一次有效配置并返回原错误
    pub fn configure(&self, settings: CameraSettings) -> Result<()> {
        let _t = self.shared.transition.lock();
        self.configure_locked(settings)
    }

    fn configure_locked(&self, settings: CameraSettings) -> Result<()> {
        let was_live = self.shared.stop_producer();

        match self.shared.apply_settings(&settings) {
            Ok(()) => {
                info!(
                    "✅ 相机配置完成: {}x{} {} @ {:.1}fps",
                    settings.width, settings.height, settings.pixel_format, settings.target_fps
                );
                {
                    let mut st = self.shared.status.lock();
                    st.settings = settings.clone();
                    st.last_good = Some(settings);
                }
                self.shared.guard.reset();
                self.shared.set_state(SourceState::Configured);
                Ok(())
            }
            Err(e) => Err(self.recover_locked(e, was_live)),
        }
    }

    /// 恢复上一次有效配置, 返回原始错误
    fn recover_locked(&self, err: VisionError, was_live: bool) -> VisionError {
        warn!("⚠️ 相机配置失败: {}", err);
        if err.kind() == ErrorKind::DeviceUnavailable {
            self.shared.enter_error(&err);
            return err;
        }

        let last_good = self.shared.status.lock().last_good.clone();
        let Some(good) = last_good else {
            return err;
        };

        match self.shared.apply_settings(&good) {
            Ok(()) => {
                info!("↩️ 已恢复上一次有效配置");
                let (period, rotation) = (good.frame_period(), good.rotation);
                self.shared.status.lock().settings = good;
                if was_live {
                    if let Err(e) = self.shared.spawn_producer(period, rotation) {
                        error!("❌ 生产线程重启失败: {}", e);
                        self.shared.set_state(SourceState::Configured);
                    }
                }
            }
            Err(e) => {
                error!("❌ 恢复配置失败: {}", e);
                self.shared.enter_error(&e);
            }
        }
        err
    }

    /// 只调整曝光/增益/白平衡等控制量, 不改变状态
    ///
    /// 尺寸/格式/帧率/旋转有变化时返回 ConfigRejected, 需要走 configure
    pub fn set_controls(&self, settings: &CameraSettings) -> Result<()> {
        let _t = self.shared.transition.lock();
        let (state, current) = {
            let st = self.shared.status.lock();
            (st.state, st.settings.clone())
        };
        match state {
            SourceState::Uninitialized => {
                return Err(VisionError::InvalidState("相机未配置".into()))
            }
            SourceState::Error => {
                return Err(VisionError::DeviceUnavailable("相机处于错误状态".into()))
            }
            _ => {}
        }
        if !current.differs_only_in_controls(settings) {
            return Err(VisionError::rejected(
                "settings",
                "尺寸/格式/帧率/旋转变化需要重新配置",
            ));
        }

        let result = {
            let mut device = self.shared.device.lock();
            match device.as_mut() {
                Some(dev) => settings
                    .validate(dev.sensor_resolution())
                    .and_then(|_| apply_controls(dev.as_mut(), &settings.controls())),
                None => Err(no_device()),
            }
        };

        match result {
            Ok(fallback) => {
                if fallback {
                    let _ = self.shared.events_tx.try_send(SourceEvent::ControlsFallback);
                }
                let mut st = self.shared.status.lock();
                st.settings = settings.clone();
                st.last_good = Some(settings.clone());
                debug!("🎛️ 相机控制已更新");
                Ok(())
            }
            Err(e) => {
                if e.kind() == ErrorKind::DeviceUnavailable {
                    self.shared.enter_error(&e);
                }
                Err(e)
            }
        }
    }

    pub fn start_live(&self) -> Result<()> {
        let _t = self.shared.transition.lock();
        self.start_live_locked()
    }

    fn start_live_locked(&self) -> Result<()> {
        let (state, settings) = {
            let st = self.shared.status.lock();
            (st.state, st.settings.clone())
        };
        match state {
            SourceState::Live => Ok(()),
            SourceState::Configured | SourceState::TriggerArmed => {
                self.shared
                    .spawn_producer(settings.frame_period(), settings.rotation)?;
                self.shared.status.lock().mode = CameraMode::Live;
                self.shared.set_state(SourceState::Live);
                info!("▶️ 连续采集启动 ({:.1}fps)", settings.target_fps);
                Ok(())
            }
            SourceState::Uninitialized => Err(VisionError::InvalidState("相机未配置".into())),
            SourceState::Error => Err(VisionError::DeviceUnavailable(
                "相机处于错误状态, 需要 reset".into(),
            )),
        }
    }

    /// 停止出帧, 不释放设备
    pub fn stop_live(&self) -> Result<()> {
        let _t = self.shared.transition.lock();
        if self.shared.stop_producer() {
            info!("⏸️ 连续采集停止");
        }
        if self.state() == SourceState::Live {
            self.shared.set_state(SourceState::Configured);
        }
        Ok(())
    }

    /// 切换连续/触发模式
    ///
    /// 停止生产线程 → 重新下发控制量 (降噪被拒绝则用最小控制集) → 仅连续模式重启生产线程
    pub fn set_mode(&self, mode: CameraMode) -> Result<()> {
        let _t = self.shared.transition.lock();
        let (state, settings) = {
            let st = self.shared.status.lock();
            (st.state, st.settings.clone())
        };
        match (state, mode) {
            (SourceState::Uninitialized, _) => {
                return Err(VisionError::InvalidState("相机未配置".into()))
            }
            (SourceState::Error, _) => {
                return Err(VisionError::DeviceUnavailable(
                    "相机处于错误状态, 需要 reset".into(),
                ))
            }
            (SourceState::Live, CameraMode::Live)
            | (SourceState::TriggerArmed, CameraMode::Trigger) => return Ok(()),
            _ => {}
        }

        self.shared.stop_producer();
        if state == SourceState::Live {
            self.shared.set_state(SourceState::Configured);
        }

        let controls = {
            let mut device = self.shared.device.lock();
            match device.as_mut() {
                Some(dev) => apply_controls(dev.as_mut(), &settings.controls()),
                None => Err(no_device()),
            }
        };
        match controls {
            Ok(true) => {
                let _ = self.shared.events_tx.try_send(SourceEvent::ControlsFallback);
            }
            Ok(false) => {}
            Err(e) if e.kind() == ErrorKind::DeviceUnavailable => {
                self.shared.enter_error(&e);
                return Err(e);
            }
            Err(e) => warn!("⚠️ 模式切换时下发控制失败: {}", e),
        }

        match mode {
            CameraMode::Live => self.start_live_locked(),
            CameraMode::Trigger => {
                self.shared.status.lock().mode = CameraMode::Trigger;
                self.shared.set_state(SourceState::TriggerArmed);
                info!("🎯 触发模式就绪");
                Ok(())
            }
        }
    }

    /// 从 Error 恢复: 重新应用最后一次有效配置
    pub fn reset(&self) -> Result<()> {
        let _t = self.shared.transition.lock();
        if self.state() != SourceState::Error {
            return Ok(());
        }
        self.shared.stop_producer();

        let settings = {
            let st = self.shared.status.lock();
            st.last_good.clone().unwrap_or_else(|| st.settings.clone())
        };
        match self.shared.apply_settings(&settings) {
            Ok(()) => {
                self.shared.status.lock().settings = settings;
                self.shared.guard.reset();
                self.shared.set_state(SourceState::Configured);
                info!("🔄 相机已复位");
                Ok(())
            }
            Err(e) => {
                error!("❌ 相机复位失败: {}", e);
                Err(e)
            }
        }
    }

    /// 停止生产线程并释放设备
    pub fn shutdown(&self) {
        let _t = self.shared.transition.lock();
        self.shared.stop_producer();
        let device = self.shared.device.lock().take();
        if let Some(mut dev) = device {
            if let Err(e) = dev.stop() {
                warn!("⚠️ 停止相机失败: {}", e);
            }
            dev.close();
        }
        self.shared.sinks.write().clear();
        self.shared.set_state(SourceState::Uninitialized);
        info!("🛑 相机已关闭");
    }

    // ========== 单拍 ==========

    /// 单拍: 已有单拍在进行或处于冷却期时直接返回 None
    ///
    /// 成功的帧同样发给所有订阅者
    pub fn capture_once(&self) -> Option<Frame> {
        // 先看状态: 相机不可用时的单拍不计入冷却
        let (state, rotation) = {
            let st = self.shared.status.lock();
            (st.state, st.settings.rotation)
        };
        if matches!(state, SourceState::Uninitialized | SourceState::Error) {
            warn!("⚠️ 相机状态 {:?}, 无法单拍", state);
            return None;
        }

        let permit = match self.shared.guard.try_acquire() {
            Ok(p) => p,
            Err(e) => {
                trace!("单拍被忽略: {}", e);
                return None;
            }
        };

        let timeout = self.shared.capture_timeout;
        let request = {
            let mut device = self.shared.device.lock();
            match device.as_mut() {
                Some(dev) => dev.capture_request(timeout),
                None => Err(no_device()),
            }
        };

        let frame = match request {
            Ok(Some(req)) => {
                let built = req
                    .make_array()
                    .and_then(|raw| self.shared.build_frame(raw, rotation, Some(req.metadata())));
                req.release();
                match built {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        self.shared.missed.fetch_add(1, Ordering::Relaxed);
                        warn!("⚠️ 单拍帧无效: {}", e);
                        None
                    }
                }
            }
            Ok(None) => {
                warn!("⚠️ 单拍超时 ({:?})", timeout);
                None
            }
            Err(e) if e.kind() == ErrorKind::DeviceUnavailable => {
                self.shared.enter_error(&e);
                None
            }
            Err(e) => {
                warn!("⚠️ 单拍失败: {}", e);
                None
            }
        };

        if let Some(frame) = &frame {
            self.shared.emit(frame);
            debug!("📸 单拍 #{}", frame.sequence());
        }
        drop(permit);
        frame
    }
}

fn no_device() -> VisionError {
    VisionError::DeviceUnavailable("未连接相机".into())
}

/// 下发控制量; 降噪被拒绝时退回最小控制集, 返回是否发生了退回
fn apply_controls(dev: &mut dyn CameraDevice, controls: &CameraControls) -> Result<bool> {
    match dev.set_controls(controls) {
        Ok(()) => Ok(false),
        Err(e) if e.kind() == ErrorKind::DeviceUnavailable => Err(e),
        Err(e) if controls.noise_reduction.is_some() => {
            warn!("⚠️ 降噪控制被拒绝 ({}), 改用最小控制集", e);
            dev.set_controls(&controls.minimal())?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

impl Shared {
    fn set_state(&self, state: SourceState) {
        let changed = {
            let mut st = self.status.lock();
            let changed = st.state != state;
            st.state = state;
            changed
        };
        if changed {
            debug!("📷 状态 → {:?}", state);
            let _ = self.events_tx.try_send(SourceEvent::StateChanged(state));
        }
    }

    fn enter_error(&self, err: &VisionError) {
        error!("❌ 相机故障: {}", err);
        self.set_state(SourceState::Error);
        let _ = self.events_tx.try_send(SourceEvent::Fatal(err.to_string()));
    }

    fn emit(&self, frame: &Frame) {
        let sinks = self.sinks.read();
        for (_, sink) in sinks.iter() {
            sink.on_frame(frame);
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// 原始缓冲 → Frame; 只有成功的帧才分配序号
    fn build_frame(
        &self,
        raw: RawBuffer,
        rotation: Rotation,
        metadata: Option<FrameMetadata>,
    ) -> Result<Frame> {
        let captured_at = Instant::now();
        let mut frame = Frame::from_camera_buffer(raw.data, raw.width, raw.height, &raw.format)?;
        if let Some(mut meta) = metadata {
            if meta.reported_format.is_none() {
                meta.reported_format = Some(raw.format.clone());
            }
            frame = frame.with_metadata(meta);
        }
        let frame = frame.rotate(rotation);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(frame.stamped(sequence, captured_at))
    }

    fn apply_settings(&self, settings: &CameraSettings) -> Result<()> {
        let mut device = self.device.lock();
        let dev = device.as_mut().ok_or_else(no_device)?;
        let format = settings.validate(dev.sensor_resolution())?;

        dev.stop()?;
        dev.configure(&DeviceConfig {
            width: settings.width,
            height: settings.height,
            format,
            buffer_count: self.buffer_count,
        })?;
        if apply_controls(dev.as_mut(), &settings.controls())? {
            let _ = self.events_tx.try_send(SourceEvent::ControlsFallback);
        }
        dev.start()
    }

    fn spawn_producer(self: &Arc<Self>, period: Duration, rotation: Rotation) -> Result<()> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("frame-producer".into())
            .spawn(move || producer_loop(shared, stop_rx, period, rotation))?;
        *self.producer.lock() = Some(Producer { stop_tx, handle });
        Ok(())
    }

    /// 停止生产线程并等待退出, 返回之前是否在运行
    fn stop_producer(&self) -> bool {
        let producer = self.producer.lock().take();
        match producer {
            Some(Producer { stop_tx, handle }) => {
                drop(stop_tx);
                if handle.join().is_err() {
                    error!("❌ 生产线程 panic");
                }
                true
            }
            None => false,
        }
    }
}

fn producer_loop(shared: Arc<Shared>, stop_rx: Receiver<()>, period: Duration, rotation: Rotation) {
    info!("📷 生产线程启动, 帧周期 {:?}", period);
    let mut next_tick = Instant::now();
    let mut window_start = Instant::now();
    let mut window_frames = 0u32;

    loop {
        let read = {
            let mut device = shared.device.lock();
            match device.as_mut() {
                Some(dev) => dev.capture_array(),
                None => Err(no_device()),
            }
        };

        match read {
            Ok(raw) => match shared.build_frame(raw, rotation, None) {
                Ok(frame) => {
                    shared.emit(&frame);
                    window_frames += 1;
                }
                Err(e) => {
                    shared.missed.fetch_add(1, Ordering::Relaxed);
                    warn!("⚠️ 丢弃无效帧: {}", e);
                }
            },
            Err(e) if e.kind() == ErrorKind::DeviceUnavailable => {
                shared.enter_error(&e);
                break;
            }
            Err(e) => {
                shared.missed.fetch_add(1, Ordering::Relaxed);
                warn!("⚠️ 读帧失败: {}", e);
            }
        }

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            debug!(
                "📊 采集 FPS: {:.1} | 累计丢帧: {}",
                window_frames as f64 / elapsed.as_secs_f64(),
                shared.missed.load(Ordering::Relaxed)
            );
            window_start = Instant::now();
            window_frames = 0;
        }

        next_tick += period;
        let now = Instant::now();
        let wait = if next_tick > now {
            next_tick - now
        } else {
            next_tick = now;
            Duration::ZERO
        };
        match stop_rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
    info!("📷 生产线程退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::sink::FrameCollector;
    use crate::camera::stub::StubCamera;
    use crate::frame::PixelLayout;

    fn small_settings() -> CameraSettings {
        CameraSettings {
            width: 64,
            height: 48,
            target_fps: 50.0,
            ..Default::default()
        }
    }

    fn source(cooldown_ms: u64) -> (FrameSource, crate::camera::StubHandle) {
        let (cam, handle) = StubCamera::new(640, 480);
        let config = SourceConfig {
            cooldown: Duration::from_millis(cooldown_ms),
            ..Default::default()
        };
        (FrameSource::new(Box::new(cam), config), handle)
    }

    #[test]
    fn test_state_machine() {
        let (src, _h) = source(0);
        assert_eq!(src.state(), SourceState::Uninitialized);
        assert!(src.start_live().is_err());

        src.configure(small_settings()).unwrap();
        assert_eq!(src.state(), SourceState::Configured);

        src.set_mode(CameraMode::Trigger).unwrap();
        assert_eq!(src.state(), SourceState::TriggerArmed);

        src.set_mode(CameraMode::Live).unwrap();
        assert_eq!(src.state(), SourceState::Live);

        src.stop_live().unwrap();
        assert_eq!(src.state(), SourceState::Configured);
        src.shutdown();
    }

    #[test]
    fn test_live_frames_monotonic() {
        let (src, _h) = source(0);
        let collector = Arc::new(FrameCollector::new());
        src.subscribe(collector.clone());
        src.configure(small_settings()).unwrap();
        src.start_live().unwrap();
        thread::sleep(Duration::from_millis(200));
        src.stop_live().unwrap();

        let frames = collector.frames();
        assert!(frames.len() >= 2);
        for pair in frames.windows(2) {
            assert!(pair[1].sequence() > pair[0].sequence());
        }
        assert!(frames.iter().all(|f| f.width() == 64 && f.height() == 48));
        src.shutdown();
    }

    #[test]
    fn test_invalid_configure_keeps_last_good() {
        let (src, _h) = source(0);
        src.configure(small_settings()).unwrap();

        let bad = CameraSettings {
            pixel_format: "YUYV".into(),
            ..small_settings()
        };
        let err = src.configure(bad).unwrap_err();
        assert!(err.is_pixel_format_rejection());
        assert_eq!(src.settings(), small_settings());
        assert_eq!(src.state(), SourceState::Configured);
    }

    #[test]
    fn test_read_errors_count_as_missed() {
        let (src, handle) = source(0);
        src.configure(small_settings()).unwrap();
        handle.fail_next_reads(3);
        src.start_live().unwrap();
        thread::sleep(Duration::from_millis(200));
        src.stop_live().unwrap();
        assert_eq!(src.missed_frames(), 3);
        assert_eq!(src.state(), SourceState::Configured);
    }

    #[test]
    fn test_device_loss_enters_error_and_reset() {
        let (src, handle) = source(0);
        let events = src.events();
        src.configure(small_settings()).unwrap();
        src.start_live().unwrap();
        handle.disconnect();
        thread::sleep(Duration::from_millis(150));

        assert_eq!(src.state(), SourceState::Error);
        let fatal = events
            .try_iter()
            .filter(|e| matches!(e, SourceEvent::Fatal(_)))
            .count();
        assert_eq!(fatal, 1);
        assert!(src.capture_once().is_none());

        handle.reconnect();
        src.reset().unwrap();
        assert_eq!(src.state(), SourceState::Configured);
    }

    #[test]
    fn test_noise_reduction_fallback() {
        let (src, handle) = source(0);
        handle.reject_noise_reduction(true);
        src.configure(small_settings()).unwrap();
        src.set_mode(CameraMode::Trigger).unwrap();

        let history = handle.controls_history();
        assert!(!history.is_empty());
        assert!(history.iter().all(|c| c.noise_reduction.is_none()));
        assert!(src.events().try_iter().any(|e| e == SourceEvent::ControlsFallback));
    }

    #[test]
    fn test_capture_once_metadata_and_timeout() {
        let (src, handle) = source(0);
        src.configure(small_settings()).unwrap();
        src.set_mode(CameraMode::Trigger).unwrap();

        let frame = src.capture_once().unwrap();
        assert_eq!(frame.layout(), PixelLayout::Bgr);
        assert!(frame.metadata().and_then(|m| m.exposure_us).is_some());

        handle.set_request_timeout(true);
        assert!(src.capture_once().is_none());
        assert_eq!(src.state(), SourceState::TriggerArmed);
    }

    #[test]
    fn test_unavailable_camera_does_not_start_cooldown() {
        let (src, handle) = source(250);
        assert!(src.capture_once().is_none());
        assert!(src.shared.guard.last_shot().is_none());

        src.configure(small_settings()).unwrap();
        src.set_mode(CameraMode::Live).unwrap();
        handle.disconnect();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(src.state(), SourceState::Error);
        assert!(src.capture_once().is_none());
        assert!(src.shared.guard.last_shot().is_none());
    }

    #[test]
    fn test_set_controls_requires_same_stream() {
        let (src, _h) = source(0);
        src.configure(small_settings()).unwrap();

        let exposure = CameraSettings {
            ae_auto: false,
            exposure_us: 2000,
            ..small_settings()
        };
        src.set_controls(&exposure).unwrap();
        assert_eq!(src.settings().exposure_us, 2000);
        assert_eq!(src.state(), SourceState::Configured);

        let resized = CameraSettings {
            width: 128,
            ..small_settings()
        };
        assert!(src.set_controls(&resized).is_err());
    }

    #[test]
    fn test_rotation_applied() {
        let (src, _h) = source(0);
        src.configure(CameraSettings {
            rotation: Rotation::R90,
            ..small_settings()
        })
        .unwrap();
        src.set_mode(CameraMode::Trigger).unwrap();
        let frame = src.capture_once().unwrap();
        assert_eq!((frame.width(), frame.height()), (48, 64));
    }
}
