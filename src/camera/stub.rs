// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 确定性测试相机
//!
//! 没有硬件时使用; 通过 [`StubHandle`] 注入读帧失败、断线、降噪拒绝、请求超时等故障。
//! 像素值只取决于坐标和帧计数, 方便测试断言。

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{CameraControls, CameraDevice, CaptureRequest, DeviceConfig, PixelFormat, RawBuffer};
use crate::error::{Result, VisionError};
use crate::frame::FrameMetadata;

struct StubState {
    sensor: (u32, u32),
    config: Option<DeviceConfig>,
    started: bool,
    closed: bool,
    frame_counter: u64,
    /// 覆盖报告的格式名 (模拟 "RGB888" 实际输出 BGR 的固件)
    reported_format: Option<String>,
    fail_reads: u32,
    disconnected: bool,
    reject_noise_reduction: bool,
    request_timeout: bool,
    controls_history: Vec<CameraControls>,
    configure_calls: u32,
    exposure_us: u32,
    analogue_gain: f32,
}

impl StubState {
    fn check_alive(&self) -> Result<()> {
        if self.disconnected || self.closed {
            return Err(VisionError::DeviceUnavailable("stub camera 已断开".into()));
        }
        Ok(())
    }

    fn next_buffer(&mut self) -> Result<RawBuffer> {
        self.check_alive()?;
        if !self.started {
            return Err(VisionError::Io(io::Error::new(
                io::ErrorKind::Other,
                "相机未启动",
            )));
        }
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(VisionError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "读帧超时",
            )));
        }
        let config = self
            .config
            .ok_or_else(|| VisionError::InvalidState("相机未配置".into()))?;

        self.frame_counter += 1;
        let data = synth_pixels(&config, self.frame_counter);
        let format = self
            .reported_format
            .clone()
            .unwrap_or_else(|| config.format.as_str().to_string());

        Ok(RawBuffer {
            data,
            width: config.width,
            height: config.height,
            format,
        })
    }
}

/// 生成测试图案: 通道 c 的值 = (x + y + counter + 64c) mod 256
fn synth_pixels(config: &DeviceConfig, counter: u64) -> Vec<u8> {
    let (w, h) = (config.width as usize, config.height as usize);
    let c = config.format.bytes_per_pixel();
    let mut data = Vec::with_capacity(w * h * c);
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                data.push(((x + y + counter as usize + 64 * ch) % 256) as u8);
            }
        }
    }
    if config.format.is_planar_yuv() {
        // 色度平面
        data.resize(w * h * 3 / 2, 128);
    }
    data
}

/// 测试相机
pub struct StubCamera {
    state: Arc<Mutex<StubState>>,
}

/// 故障注入与观测句柄
#[derive(Clone)]
pub struct StubHandle {
    state: Arc<Mutex<StubState>>,
}

impl StubCamera {
    pub fn new(sensor_width: u32, sensor_height: u32) -> (Self, StubHandle) {
        let state = Arc::new(Mutex::new(StubState {
            sensor: (sensor_width, sensor_height),
            config: None,
            started: false,
            closed: false,
            frame_counter: 0,
            reported_format: None,
            fail_reads: 0,
            disconnected: false,
            reject_noise_reduction: false,
            request_timeout: false,
            controls_history: Vec::new(),
            configure_calls: 0,
            exposure_us: 10_000,
            analogue_gain: 1.0,
        }));
        (
            Self {
                state: state.clone(),
            },
            StubHandle { state },
        )
    }

    /// IMX296 尺寸
    pub fn imx296() -> (Self, StubHandle) {
        Self::new(1456, 1088)
    }
}

impl CameraDevice for StubCamera {
    fn sensor_resolution(&self) -> (u32, u32) {
        self.state.lock().sensor
    }

    fn configure(&mut self, config: &DeviceConfig) -> Result<()> {
        let mut s = self.state.lock();
        s.check_alive()?;
        if config.width > s.sensor.0 || config.height > s.sensor.1 {
            return Err(VisionError::rejected("size", "超出传感器尺寸"));
        }
        s.config = Some(*config);
        s.configure_calls += 1;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let mut s = self.state.lock();
        s.check_alive()?;
        if s.config.is_none() {
            return Err(VisionError::InvalidState("相机未配置".into()));
        }
        s.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state.lock().started = false;
        Ok(())
    }

    fn close(&mut self) {
        let mut s = self.state.lock();
        s.started = false;
        s.closed = true;
    }

    fn capture_array(&mut self) -> Result<RawBuffer> {
        self.state.lock().next_buffer()
    }

    fn capture_request(&mut self, _timeout: Duration) -> Result<Option<Box<dyn CaptureRequest>>> {
        let mut s = self.state.lock();
        s.check_alive()?;
        if s.request_timeout {
            return Ok(None);
        }
        let raw = s.next_buffer()?;
        let metadata = FrameMetadata {
            exposure_us: Some(s.exposure_us),
            analogue_gain: Some(s.analogue_gain),
            reported_format: Some(raw.format.clone()),
        };
        Ok(Some(Box::new(StubRequest { raw, metadata })))
    }

    fn set_controls(&mut self, controls: &CameraControls) -> Result<()> {
        let mut s = self.state.lock();
        s.check_alive()?;
        if s.reject_noise_reduction && controls.noise_reduction.is_some() {
            return Err(VisionError::rejected("noise_reduction", "固件不支持 NoiseReductionMode"));
        }
        if let Some(exposure) = controls.exposure_us {
            s.exposure_us = exposure;
        }
        if let Some(gain) = controls.analogue_gain {
            s.analogue_gain = gain;
        }
        s.controls_history.push(controls.clone());
        Ok(())
    }
}

struct StubRequest {
    raw: RawBuffer,
    metadata: FrameMetadata,
}

impl CaptureRequest for StubRequest {
    fn make_array(&self) -> Result<RawBuffer> {
        Ok(self.raw.clone())
    }

    fn metadata(&self) -> FrameMetadata {
        self.metadata.clone()
    }

    fn release(self: Box<Self>) {}
}

impl StubHandle {
    pub fn set_reported_format(&self, format: Option<&str>) {
        self.state.lock().reported_format = format.map(str::to_string);
    }

    /// 接下来 n 次读帧失败 (非致命)
    pub fn fail_next_reads(&self, n: u32) {
        self.state.lock().fail_reads = n;
    }

    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    pub fn reconnect(&self) {
        self.state.lock().disconnected = false;
    }

    pub fn reject_noise_reduction(&self, reject: bool) {
        self.state.lock().reject_noise_reduction = reject;
    }

    pub fn set_request_timeout(&self, timeout: bool) {
        self.state.lock().request_timeout = timeout;
    }

    pub fn controls_history(&self) -> Vec<CameraControls> {
        self.state.lock().controls_history.clone()
    }

    pub fn frames_generated(&self) -> u64 {
        self.state.lock().frame_counter
    }

    pub fn configure_calls(&self) -> u32 {
        self.state.lock().configure_calls
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn current_format(&self) -> Option<PixelFormat> {
        self.state.lock().config.map(|c| c.format)
    }
}
