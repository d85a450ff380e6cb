// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 相机源工具: 帧原样透传, 在上下文里标记像素格式和来源,
// 配置写入时转发给 FrameSource

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{merge_config, ToolConfig, ToolOutput, ToolResult};
use crate::camera::{CameraMode, CameraSettings, FrameSource, SourceState};
use crate::error::Result;
use crate::frame::Frame;
use crate::pipeline::PipelineContext;

/// 没有接相机时用于校验的传感器尺寸 (IMX296)
pub const DEFAULT_SENSOR: (u32, u32) = (1456, 1088);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSourceConfig {
    pub mode: CameraMode,
    #[serde(flatten)]
    pub camera: CameraSettings,
    pub source_label: String,
}

impl Default for CameraSourceConfig {
    fn default() -> Self {
        Self {
            mode: CameraMode::Live,
            camera: CameraSettings::default(),
            source_label: "camera".to_string(),
        }
    }
}

impl CameraSourceConfig {
    /// 把配置下发给相机 (不需要持有工具)
    pub fn apply_to(&self, source: &FrameSource) -> Result<()> {
        apply_settings(self, source)
    }
}

impl ToolConfig for CameraSourceConfig {
    fn validate(&self) -> Result<()> {
        self.camera.validate(DEFAULT_SENSOR).map(|_| ())
    }
}

pub struct CameraSourceTool {
    config: CameraSourceConfig,
    source: Option<FrameSource>,
}

impl CameraSourceTool {
    pub fn new(config: CameraSourceConfig, source: Option<FrameSource>) -> Self {
        Self { config, source }
    }

    pub fn config(&self) -> &CameraSourceConfig {
        &self.config
    }

    pub fn mode(&self) -> CameraMode {
        self.config.mode
    }

    /// 记录期望模式 (模式按钮切换时同步)
    pub fn set_mode(&mut self, mode: CameraMode) {
        self.config.mode = mode;
    }

    pub fn update_config(&mut self, patch: &Map<String, Value>) -> Result<()> {
        let merged = merge_config(&self.config, patch, true)?;
        if let Some(source) = self.source.as_ref().filter(|s| s.has_device()) {
            apply_settings(&merged, source)?;
        }
        self.config = merged;
        debug!("相机源配置已更新");
        Ok(())
    }

    /// 把当前配置下发给相机
    pub fn apply_to(&self, source: &FrameSource) -> Result<()> {
        self.config.apply_to(source)
    }

    pub fn process(&mut self, frame: &Frame, ctx: &mut PipelineContext) -> Result<ToolOutput> {
        ctx.pixel_format = Some(self.config.camera.pixel_format.clone());
        ctx.source = Some(self.config.source_label.clone());
        ctx.set_extra("pixel_layout", Value::from(frame.layout().as_str()));

        Ok(ToolOutput {
            image: frame.clone(),
            result: ToolResult::Camera {
                pixel_format: self.config.camera.pixel_format.clone(),
                source: self.config.source_label.clone(),
                mode: self.config.mode,
            },
        })
    }
}

/// 只改控制量时走 set_controls, 否则重新 configure; 原来在出帧的恢复到配置的模式
fn apply_settings(config: &CameraSourceConfig, source: &FrameSource) -> Result<()> {
    let state = source.state();
    let running = matches!(state, SourceState::Live | SourceState::TriggerArmed);
    let configured = running || state == SourceState::Configured;
    let current = source.settings();

    if configured && current.differs_only_in_controls(&config.camera) {
        if current != config.camera {
            source.set_controls(&config.camera)?;
        }
    } else {
        source.configure(config.camera.clone())?;
        info!(
            "📷 相机源重新配置 {}x{} {}",
            config.camera.width, config.camera.height, config.camera.pixel_format
        );
    }

    if running {
        source.set_mode(config.mode)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{SourceConfig, StubCamera};
    use serde_json::json;
    use std::time::Instant;

    #[test]
    fn test_process_is_pass_through() {
        let mut tool = CameraSourceTool::new(CameraSourceConfig::default(), None);
        let frame = Frame::black(8, 8).stamped(4, Instant::now());
        let mut ctx = PipelineContext::new();
        let out = tool.process(&frame, &mut ctx).unwrap();

        assert!(out.image.shares_buffer(&frame));
        assert_eq!(ctx.pixel_format.as_deref(), Some("RGB888"));
        assert_eq!(ctx.source.as_deref(), Some("camera"));
    }

    #[test]
    fn test_flattened_config_keys() {
        let v = serde_json::to_value(CameraSourceConfig::default()).unwrap();
        assert_eq!(v["mode"], "live");
        assert_eq!(v["width"], 1456);
        assert_eq!(v["rotation"], 0);
    }

    #[test]
    fn test_update_rejects_bad_batch() {
        let mut tool = CameraSourceTool::new(CameraSourceConfig::default(), None);
        let patch = json!({"exposure_us": 5000, "pixel_format": "YUYV"});
        let err = tool.update_config(patch.as_object().unwrap()).unwrap_err();
        assert!(err.is_pixel_format_rejection());
        assert_eq!(tool.config().camera.exposure_us, 10_000);
    }

    #[test]
    fn test_update_proxies_to_source() {
        let (cam, handle) = StubCamera::new(640, 480);
        let source = FrameSource::new(Box::new(cam), SourceConfig::default());
        let config = CameraSourceConfig {
            mode: CameraMode::Trigger,
            camera: CameraSettings {
                width: 320,
                height: 240,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut tool = CameraSourceTool::new(config, Some(source.clone()));
        tool.apply_to(&source).unwrap();
        source.set_mode(CameraMode::Trigger).unwrap();
        let configures = handle.configure_calls();

        // 只改曝光: 不重新配置流
        let patch = json!({"ae_auto": false, "exposure_us": 3000});
        tool.update_config(patch.as_object().unwrap()).unwrap();
        assert_eq!(handle.configure_calls(), configures);
        assert_eq!(source.settings().exposure_us, 3000);
        assert_eq!(source.state(), SourceState::TriggerArmed);

        // 改尺寸: 重新配置并恢复触发模式
        let patch = json!({"width": 160, "height": 120});
        tool.update_config(patch.as_object().unwrap()).unwrap();
        assert_eq!(handle.configure_calls(), configures + 1);
        assert_eq!(source.settings().width, 160);
        assert_eq!(source.state(), SourceState::TriggerArmed);
        source.shutdown();
    }
}
