// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 相机采集系统 (Frame Source)
///
/// 独立生产线程, 负责相机配置与出帧
/// - FrameSource:     状态机 + 连续/触发两种采集模式
/// - SingleShotGuard: 单拍锁 + 冷却时间
/// - FrameSink:       帧订阅接口 (FrameSlot 只保留最新一帧)
/// - StubCamera:      无硬件时的确定性测试相机
pub mod guard;
pub mod sink;
pub mod source;
pub mod stub;

pub use guard::{ShotPermit, SingleShotGuard};
pub use sink::{FnSink, FrameCollector, FrameSink, FrameSlot, SinkId};
pub use source::{FrameSource, SourceConfig, SourceEvent};
pub use stub::{StubCamera, StubHandle};

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VisionError};
use crate::frame::{FrameMetadata, Rotation};

// ========== 枚举类型 ==========

/// 相机支持的像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb888,
    Bgr888,
    Xrgb8888,
    Xbgr8888,
    Yuv420,
    Nv12,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 6] = [
        PixelFormat::Rgb888,
        PixelFormat::Bgr888,
        PixelFormat::Xrgb8888,
        PixelFormat::Xbgr8888,
        PixelFormat::Yuv420,
        PixelFormat::Nv12,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Rgb888 => "RGB888",
            PixelFormat::Bgr888 => "BGR888",
            PixelFormat::Xrgb8888 => "XRGB8888",
            PixelFormat::Xbgr8888 => "XBGR8888",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Nv12 => "NV12",
        }
    }

    /// 请求该格式时相机缓冲区每像素的字节数 (平面 YUV 按亮度平面计)
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb888 | PixelFormat::Bgr888 => 3,
            PixelFormat::Xrgb8888 | PixelFormat::Xbgr8888 => 4,
            PixelFormat::Yuv420 | PixelFormat::Nv12 => 1,
        }
    }

    pub fn is_planar_yuv(&self) -> bool {
        matches!(self, PixelFormat::Yuv420 | PixelFormat::Nv12)
    }
}

impl FromStr for PixelFormat {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        PixelFormat::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == upper)
            .ok_or_else(|| VisionError::rejected("pixel_format", format!("不支持的像素格式 {}", s)))
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 采集模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    #[default]
    Live,
    Trigger,
}

impl FromStr for CameraMode {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(CameraMode::Live),
            "trigger" => Ok(CameraMode::Trigger),
            other => Err(VisionError::rejected("mode", format!("未知模式 {}", other))),
        }
    }
}

/// FrameSource 状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Uninitialized,
    Configured,
    Live,
    TriggerArmed,
    Error,
}

// ========== 配置 ==========

/// 相机设置 (相机工具页与配置文件共用)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub target_fps: f32,
    pub exposure_us: u32,
    pub analogue_gain: f32,
    pub ev: f32,
    pub ae_auto: bool,
    pub awb_auto: bool,
    pub awb_gains: [f32; 2],
    pub rotation: Rotation,
    /// 时域降噪 (部分固件在模式切换时拒绝该控制)
    pub noise_reduction: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        // IMX296 全幅
        Self {
            width: 1456,
            height: 1088,
            pixel_format: "RGB888".to_string(),
            target_fps: 30.0,
            exposure_us: 10_000,
            analogue_gain: 1.0,
            ev: 0.0,
            ae_auto: true,
            awb_auto: true,
            awb_gains: [1.0, 1.0],
            rotation: Rotation::R0,
            noise_reduction: true,
        }
    }
}

impl CameraSettings {
    /// 校验全部字段, 返回解析后的像素格式
    pub fn validate(&self, sensor: (u32, u32)) -> Result<PixelFormat> {
        let format: PixelFormat = self.pixel_format.parse()?;

        if self.width == 0 || self.height == 0 {
            return Err(VisionError::rejected("size", "宽高必须大于 0"));
        }
        if self.width > sensor.0 || self.height > sensor.1 {
            return Err(VisionError::rejected(
                "size",
                format!(
                    "{}x{} 超出传感器 {}x{}",
                    self.width, self.height, sensor.0, sensor.1
                ),
            ));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(VisionError::rejected("size", "宽高必须为偶数"));
        }
        if !(self.target_fps > 0.0 && self.target_fps <= 120.0) {
            return Err(VisionError::rejected("target_fps", "必须在 (0, 120] 内"));
        }
        if self.exposure_us == 0 || self.exposure_us > 15_000_000 {
            return Err(VisionError::rejected("exposure_us", "必须在 [1, 15000000] 内"));
        }
        if !(1.0..=16.0).contains(&self.analogue_gain) {
            return Err(VisionError::rejected("analogue_gain", "必须在 [1, 16] 内"));
        }
        if !(-8.0..=8.0).contains(&self.ev) {
            return Err(VisionError::rejected("ev", "必须在 [-8, 8] 内"));
        }
        if self.awb_gains.iter().any(|g| !(*g > 0.0 && *g <= 32.0)) {
            return Err(VisionError::rejected("awb_gains", "必须在 (0, 32] 内"));
        }
        Ok(format)
    }

    /// 帧周期
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.target_fps.max(0.1))
    }

    /// 只有曝光/增益/白平衡类字段不同 (不需要重新配置流)
    pub fn differs_only_in_controls(&self, other: &CameraSettings) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.pixel_format.eq_ignore_ascii_case(&other.pixel_format)
            && self.target_fps == other.target_fps
            && self.rotation == other.rotation
    }

    pub fn controls(&self) -> CameraControls {
        let frame_us = (1_000_000.0 / self.target_fps.max(0.1)) as u64;
        CameraControls {
            ae_enable: Some(self.ae_auto),
            exposure_us: (!self.ae_auto).then_some(self.exposure_us),
            analogue_gain: (!self.ae_auto).then_some(self.analogue_gain),
            ev: self.ae_auto.then_some(self.ev),
            awb_enable: Some(self.awb_auto),
            colour_gains: (!self.awb_auto).then_some((self.awb_gains[0], self.awb_gains[1])),
            frame_duration_limits_us: Some((frame_us, frame_us)),
            noise_reduction: self.noise_reduction.then_some(true),
        }
    }
}

/// 下发给相机的控制量 (None 表示不设置)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CameraControls {
    pub ae_enable: Option<bool>,
    pub exposure_us: Option<u32>,
    pub analogue_gain: Option<f32>,
    pub ev: Option<f32>,
    pub awb_enable: Option<bool>,
    pub colour_gains: Option<(f32, f32)>,
    pub frame_duration_limits_us: Option<(u64, u64)>,
    pub noise_reduction: Option<bool>,
}

impl CameraControls {
    /// 降噪被拒绝时的最小控制集
    pub fn minimal(&self) -> Self {
        Self {
            ae_enable: self.ae_enable,
            exposure_us: self.exposure_us,
            analogue_gain: self.analogue_gain,
            ..Default::default()
        }
    }
}

/// 流配置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
}

/// 相机返回的原始缓冲区
#[derive(Debug, Clone)]
pub struct RawBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 相机报告的格式名
    pub format: String,
}

// ========== 设备接口 ==========

/// 相机设备能力集
///
/// 错误约定: DeviceUnavailable 表示设备丢失 (致命), 其它错误视为单帧失败
pub trait CameraDevice: Send {
    fn sensor_resolution(&self) -> (u32, u32);
    fn configure(&mut self, config: &DeviceConfig) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn close(&mut self);
    fn capture_array(&mut self) -> Result<RawBuffer>;
    /// 单次请求; 超时返回 Ok(None)
    fn capture_request(&mut self, timeout: Duration) -> Result<Option<Box<dyn CaptureRequest>>>;
    fn set_controls(&mut self, controls: &CameraControls) -> Result<()>;
}

/// 单次采集请求, 用完必须 release
pub trait CaptureRequest: Send {
    /// 主流图像
    fn make_array(&self) -> Result<RawBuffer>;
    fn metadata(&self) -> FrameMetadata;
    fn release(self: Box<Self>);
}
