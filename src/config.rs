// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 应用配置 - 通过 JSON 文件调整参数

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::camera::{CameraSettings, PixelFormat, SourceConfig};
use crate::error::{Result, VisionError};
use crate::review::{DEFAULT_CAPACITY, DEFAULT_NOTIFY_INTERVAL};
use crate::view::{DEFAULT_ZOOM, MAX_ZOOM, MIN_ZOOM};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub cooldown_ms: u64,        // 单拍冷却
    pub capture_timeout_ms: u64, // 单拍请求超时
    pub buffer_count: u32,       // 相机缓冲区个数
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 250,
            capture_timeout_ms: 1000,
            buffer_count: 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub capacity: usize,         // 回看窗格数
    pub notify_interval_ms: u64, // 最小重绘间隔
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            notify_interval_ms: DEFAULT_NOTIFY_INTERVAL.as_millis() as u64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub zoom: f32,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self { zoom: DEFAULT_ZOOM }
    }
}

/// 应用参数配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    // === 相机初始设置 ===
    pub camera: CameraSettings,
    // === 单拍 ===
    pub capture: CaptureConfig,
    // === 回看 ===
    pub review: ReviewConfig,
    // === 显示 ===
    pub view: ViewConfig,
    /// 关闭时等待线程退出的最长时间
    pub shutdown_grace_ms: u64,
    /// 启动时加载的作业
    pub job_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            camera: CameraSettings::default(),
            capture: CaptureConfig::default(),
            review: ReviewConfig::default(),
            view: ViewConfig::default(),
            shutdown_grace_ms: 5000,
            job_path: None,
        }
    }
}

impl AppConfig {
    /// 默认位置: <config_dir>/inspector/config.json
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("inspector")
            .join("config.json")
    }

    /// 从 JSON 文件加载配置, 不存在时写入默认配置, 解析失败时使用默认值
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str::<AppConfig>(&json) {
                Ok(config) => {
                    info!("✅ 配置已从 {} 加载", path.display());
                    config
                }
                Err(e) => {
                    warn!("⚠️ 配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("📝 配置文件不存在, 创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("❌ 保存默认配置失败: {}", e);
                }
                config
            }
        }
    }

    /// 严格加载: 文件缺失是 Io, 内容非法是 ConfigRejected
    pub fn load_strict(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        let config: AppConfig = serde_json::from_str(&json)
            .map_err(|e| VisionError::rejected("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        // 像素格式单独检查, 以便区分退出码
        self.camera.pixel_format.parse::<PixelFormat>()?;
        if self.review.capacity == 0 {
            return Err(VisionError::rejected("review.capacity", "至少为 1"));
        }
        if self.capture.cooldown_ms == 0 {
            return Err(VisionError::rejected("capture.cooldown_ms", "必须大于 0"));
        }
        if self.capture.capture_timeout_ms == 0 {
            return Err(VisionError::rejected("capture.capture_timeout_ms", "必须大于 0"));
        }
        if self.capture.buffer_count == 0 {
            return Err(VisionError::rejected("capture.buffer_count", "至少为 1"));
        }
        if !(MIN_ZOOM..=MAX_ZOOM).contains(&self.view.zoom) {
            return Err(VisionError::rejected("view.zoom", "超出缩放范围"));
        }
        Ok(())
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            cooldown: Duration::from_millis(self.capture.cooldown_ms),
            capture_timeout: Duration::from_millis(self.capture.capture_timeout_ms),
            buffer_count: self.capture.buffer_count,
        }
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.review.notify_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️ 当前配置:");
        info!(
            "  相机: {}x{} {} @ {} fps",
            self.camera.width, self.camera.height, self.camera.pixel_format, self.camera.target_fps
        );
        info!("  单拍冷却: {} ms", self.capture.cooldown_ms);
        info!("  回看窗格: {}", self.review.capacity);
    }
}
