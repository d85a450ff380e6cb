// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 设置页协调 (SettingsCoordinator) 与界面接口 (UiHost)
//!
//! 核心不引用任何界面类型, 界面通过 UiHost 这个窄接口接收通知:
//! 模式切换 / 提示 / 对话框 / 按钮可用状态。
//!
//! 设置页的编辑先暂存, Apply 时整批写入工具; 离开页面或 Cancel 丢弃暂存。
//! 相机页的控制量会实时预览到相机上, 放弃编辑时恢复进入页面时的快照。

use std::fmt;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::camera::{CameraMode, CameraSettings, FrameSource};
use crate::error::{Result, VisionError};
use crate::job::JobManager;
use crate::tools::{merge_config, CameraSourceConfig, ToolKind};

// ========== UiHost ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UiButton {
    Live,
    Trigger,
    Apply,
    Cancel,
}

/// 界面实现的回调接口
pub trait UiHost: Send + Sync {
    fn on_mode_changed(&self, mode: CameraMode);
    fn show_toast(&self, message: &str);
    fn show_dialog(&self, title: &str, message: &str);
    fn set_button_enabled(&self, button: UiButton, enabled: bool);
}

/// 无界面运行: 只写日志
#[derive(Debug, Default)]
pub struct LogUiHost;

impl UiHost for LogUiHost {
    fn on_mode_changed(&self, mode: CameraMode) {
        info!("🎚️ 相机模式: {:?}", mode);
    }

    fn show_toast(&self, message: &str) {
        info!("💬 {}", message);
    }

    fn show_dialog(&self, title: &str, message: &str) {
        warn!("❗ {}: {}", title, message);
    }

    fn set_button_enabled(&self, button: UiButton, enabled: bool) {
        debug!("按钮 {:?} → {}", button, enabled);
    }
}

/// 记录收到的全部调用
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    ModeChanged(CameraMode),
    Toast(String),
    Dialog { title: String, message: String },
    Button(UiButton, bool),
}

#[derive(Debug, Default)]
pub struct RecordingUiHost {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingUiHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().clone()
    }

    pub fn dialogs(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, UiEvent::Dialog { .. }))
            .count()
    }

    /// 按钮最后一次被设置的状态
    pub fn button(&self, button: UiButton) -> Option<bool> {
        self.events.lock().iter().rev().find_map(|e| match e {
            UiEvent::Button(b, enabled) if *b == button => Some(*enabled),
            _ => None,
        })
    }
}

impl UiHost for RecordingUiHost {
    fn on_mode_changed(&self, mode: CameraMode) {
        self.events.lock().push(UiEvent::ModeChanged(mode));
    }

    fn show_toast(&self, message: &str) {
        self.events.lock().push(UiEvent::Toast(message.to_string()));
    }

    fn show_dialog(&self, title: &str, message: &str) {
        self.events.lock().push(UiEvent::Dialog {
            title: title.to_string(),
            message: message.to_string(),
        });
    }

    fn set_button_enabled(&self, button: UiButton, enabled: bool) {
        self.events.lock().push(UiEvent::Button(button, enabled));
    }
}

/// 触发按钮可用: 触发模式 + 有相机源 + (相机在运行 或 正在编辑相机源)
///
/// 连续模式下一律不可用
pub fn trigger_button_enabled(
    mode: CameraMode,
    has_camera_source: bool,
    camera_running: bool,
    editing_camera_source: bool,
) -> bool {
    mode == CameraMode::Trigger && has_camera_source && (camera_running || editing_camera_source)
}

// ========== 设置页 ==========

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SettingsPage {
    /// 工具面板 (默认页)
    #[default]
    Palette,
    Camera,
    Detect,
    Classification,
    Result,
}

impl SettingsPage {
    pub fn for_kind(kind: ToolKind) -> Self {
        match kind {
            ToolKind::CameraSource => SettingsPage::Camera,
            ToolKind::Detect => SettingsPage::Detect,
            ToolKind::Classification => SettingsPage::Classification,
            ToolKind::Result => SettingsPage::Result,
        }
    }
}

impl fmt::Display for SettingsPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingsPage::Palette => "palette",
            SettingsPage::Camera => "camera",
            SettingsPage::Detect => "detect",
            SettingsPage::Classification => "classification",
            SettingsPage::Result => "result",
        };
        f.write_str(name)
    }
}

pub struct SettingsCoordinator {
    page: SettingsPage,
    tool_id: Option<u32>,
    pending: Map<String, Value>,
    source: Option<FrameSource>,
    /// 进入相机页时的相机设置
    camera_snapshot: Option<CameraSettings>,
}

impl SettingsCoordinator {
    pub fn new(source: Option<FrameSource>) -> Self {
        Self {
            page: SettingsPage::Palette,
            tool_id: None,
            pending: Map::new(),
            source,
            camera_snapshot: None,
        }
    }

    pub fn page(&self) -> SettingsPage {
        self.page
    }

    pub fn tool_id(&self) -> Option<u32> {
        self.tool_id
    }

    pub fn pending(&self) -> &Map<String, Value> {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// 是否正在编辑相机源
    pub fn editing_camera_source(&self) -> bool {
        self.page == SettingsPage::Camera
    }

    pub fn apply_enabled(&self) -> bool {
        self.page != SettingsPage::Palette
    }

    pub fn cancel_enabled(&self) -> bool {
        self.page != SettingsPage::Palette
    }

    /// 打开工具的设置页 (丢弃当前页未应用的修改)
    pub fn open_tool(&mut self, jobs: &JobManager, tool_id: u32) -> Result<()> {
        let kind = jobs
            .tool(tool_id)
            .map(|t| t.kind())
            .ok_or(VisionError::ToolNotFound(tool_id))?;
        self.leave_page();
        self.page = SettingsPage::for_kind(kind);
        self.tool_id = Some(tool_id);
        if self.page == SettingsPage::Camera {
            self.camera_snapshot = self.source.as_ref().map(FrameSource::settings);
        }
        debug!("打开设置页 {} (工具 #{})", self.page, tool_id);
        Ok(())
    }

    /// 回到工具面板
    pub fn open_palette(&mut self) {
        self.leave_page();
        self.page = SettingsPage::Palette;
        self.tool_id = None;
    }

    fn leave_page(&mut self) {
        if self.has_pending() {
            debug!("离开 {} 页, 丢弃 {} 项修改", self.page, self.pending.len());
        }
        self.restore_camera();
        self.pending.clear();
        self.camera_snapshot = None;
    }

    /// 相机页的预览改动恢复到快照
    fn restore_camera(&mut self) {
        if self.page != SettingsPage::Camera || !self.has_pending() {
            return;
        }
        if let (Some(source), Some(snapshot)) = (&self.source, &self.camera_snapshot) {
            if source.settings() != *snapshot {
                if let Err(e) = source.set_controls(snapshot) {
                    warn!("⚠️ 恢复相机设置失败: {}", e);
                }
            }
        }
    }

    /// 暂存一项修改
    pub fn stage(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        if self.page == SettingsPage::Palette {
            return Err(VisionError::InvalidState("工具面板页没有可编辑的设置".into()));
        }
        self.pending.insert(key.into(), value);
        Ok(())
    }

    /// 相机页: 只涉及控制量的暂存修改直接预览到相机
    pub fn preview_camera(&self, jobs: &JobManager) -> Result<bool> {
        if self.page != SettingsPage::Camera {
            return Ok(false);
        }
        let (Some(source), Some(tool)) = (&self.source, jobs.camera_source()) else {
            return Ok(false);
        };
        let merged: CameraSourceConfig = merge_config(tool.config(), &self.pending, true)?;
        if !source.has_device() || !source.settings().differs_only_in_controls(&merged.camera) {
            return Ok(false);
        }
        source.set_controls(&merged.camera)?;
        Ok(true)
    }

    /// 把暂存修改整批写入工具; 失败时工具保持原配置, 暂存保留
    pub fn apply(&mut self, jobs: &mut JobManager) -> Result<()> {
        let tool_id = match (self.page, self.tool_id) {
            (SettingsPage::Palette, _) | (_, None) => {
                return Err(VisionError::InvalidState("当前页没有可应用的设置".into()));
            }
            (_, Some(id)) => id,
        };
        if self.pending.is_empty() {
            return Ok(());
        }
        jobs.update_tool_config(tool_id, &self.pending)?;
        info!("✅ 工具 #{} 应用 {} 项设置", tool_id, self.pending.len());
        self.pending.clear();
        if self.page == SettingsPage::Camera {
            self.camera_snapshot = self.source.as_ref().map(FrameSource::settings);
        }
        Ok(())
    }

    /// 放弃暂存修改
    pub fn cancel(&mut self) {
        self.restore_camera();
        self.pending.clear();
    }

    /// 推送按钮状态
    pub fn refresh_buttons(&self, host: &dyn UiHost, mode: CameraMode, has_camera_source: bool, camera_running: bool) {
        host.set_button_enabled(UiButton::Apply, self.apply_enabled());
        host.set_button_enabled(UiButton::Cancel, self.cancel_enabled());
        host.set_button_enabled(
            UiButton::Trigger,
            trigger_button_enabled(mode, has_camera_source, camera_running, self.editing_camera_source()),
        );
    }
}
