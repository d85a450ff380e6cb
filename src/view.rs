// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 显示协调 (ViewCoordinator)
//!
//! 根据显示模式从执行器的帧存储里挑出要画的那一帧:
//! ```text
//! 选中工具的输出 → 原始相机帧 → 最后一帧有效输出 → 黑色占位
//! ```
//! 并负责缩放/旋转状态; 像素格式转换与边缘图在 display_image 里完成 (显示线程调用)。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use image::{DynamicImage, RgbImage};
use imageproc::edges::canny;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, VisionError};
use crate::frame::{Frame, Rotation};
use crate::pipeline::FrameStore;
use crate::tools::ToolKind;

pub const DEFAULT_ZOOM: f32 = 1.1;
pub const ZOOM_STEP: f32 = 0.1;
pub const MIN_ZOOM: f32 = 0.25;
pub const MAX_ZOOM: f32 = 5.0;

/// Canny 阈值
const EDGE_LOW: f32 = 50.0;
const EDGE_HIGH: f32 = 150.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    #[default]
    Raw,
    Detection,
    Classification,
    Edge,
    Ocr,
    Tool(u32),
}

impl FromStr for DisplayMode {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase();
        match key.as_str() {
            "raw" | "camera" => Ok(DisplayMode::Raw),
            "detection" | "detect" => Ok(DisplayMode::Detection),
            "classification" | "classify" => Ok(DisplayMode::Classification),
            "edge" | "edges" => Ok(DisplayMode::Edge),
            "ocr" => Ok(DisplayMode::Ocr),
            other => other
                .strip_prefix("tool:")
                .and_then(|id| id.parse().ok())
                .map(DisplayMode::Tool)
                .ok_or_else(|| VisionError::rejected("display_mode", format!("未知显示模式 {}", s))),
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayMode::Raw => f.write_str("raw"),
            DisplayMode::Detection => f.write_str("detection"),
            DisplayMode::Classification => f.write_str("classification"),
            DisplayMode::Edge => f.write_str("edge"),
            DisplayMode::Ocr => f.write_str("ocr"),
            DisplayMode::Tool(id) => write!(f, "tool:{}", id),
        }
    }
}

/// 渲染帧的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    Tool(u32),
    Raw,
    LastOutput,
    Placeholder,
}

#[derive(Debug, Clone)]
pub struct RenderFrame {
    pub frame: Frame,
    pub origin: FrameOrigin,
}

pub struct ViewCoordinator {
    store: Arc<FrameStore>,
    mode: DisplayMode,
    /// 正在编辑的工具 (优先显示它的输出)
    selected_tool: Option<u32>,
    zoom: f32,
    rotation: Rotation,
    placeholder_size: (u32, u32),
}

impl ViewCoordinator {
    pub fn new(store: Arc<FrameStore>) -> Self {
        Self {
            store,
            mode: DisplayMode::Raw,
            selected_tool: None,
            zoom: DEFAULT_ZOOM,
            rotation: Rotation::R0,
            placeholder_size: (640, 480),
        }
    }

    pub fn with_zoom(mut self, zoom: f32) -> Self {
        self.set_zoom(zoom);
        self
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: DisplayMode) {
        if self.mode != mode {
            debug!("显示模式 {} → {}", self.mode, mode);
            self.mode = mode;
        }
    }

    pub fn selected_tool(&self) -> Option<u32> {
        self.selected_tool
    }

    pub fn select_tool(&mut self, tool_id: Option<u32>) {
        self.selected_tool = tool_id;
    }

    // ========== 缩放 / 旋转 ==========

    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    pub fn set_zoom(&mut self, zoom: f32) {
        let rounded = (zoom * 100.0).round() / 100.0;
        self.zoom = rounded.clamp(MIN_ZOOM, MAX_ZOOM);
    }

    pub fn zoom_in(&mut self) {
        self.set_zoom(self.zoom + ZOOM_STEP);
    }

    pub fn zoom_out(&mut self) {
        self.set_zoom(self.zoom - ZOOM_STEP);
    }

    pub fn reset_zoom(&mut self) {
        self.zoom = DEFAULT_ZOOM;
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn set_rotation(&mut self, rotation: Rotation) {
        self.rotation = rotation;
    }

    /// 顺时针转 90°
    pub fn rotate_cw(&mut self) {
        self.rotation = self.rotation.rotated_cw();
    }

    /// 按缩放后的显示尺寸
    pub fn display_size(&self, width: u32, height: u32) -> (u32, u32) {
        let (w, h) = match self.rotation {
            Rotation::R90 | Rotation::R270 => (height, width),
            _ => (width, height),
        };
        (
            ((w as f32 * self.zoom).round() as u32).max(1),
            ((h as f32 * self.zoom).round() as u32).max(1),
        )
    }

    // ========== 选帧 ==========

    fn preferred_tool(&self) -> Option<u32> {
        if self.selected_tool.is_some() {
            return self.selected_tool;
        }
        match self.mode {
            DisplayMode::Tool(id) => Some(id),
            DisplayMode::Detection => self.store.latest_tool_of(ToolKind::Detect),
            DisplayMode::Classification => self.store.latest_tool_of(ToolKind::Classification),
            DisplayMode::Raw | DisplayMode::Edge | DisplayMode::Ocr => None,
        }
    }

    /// 现在应该画哪一帧
    pub fn frame_to_render(&mut self) -> RenderFrame {
        let resolved = self
            .preferred_tool()
            .and_then(|id| self.store.tool_output(id).map(|f| (f, FrameOrigin::Tool(id))))
            .or_else(|| self.store.raw_frame().map(|f| (f, FrameOrigin::Raw)))
            .or_else(|| self.store.last_output().map(|f| (f, FrameOrigin::LastOutput)));

        match resolved {
            Some((frame, origin)) => {
                self.placeholder_size = (frame.width(), frame.height());
                RenderFrame { frame, origin }
            }
            None => {
                let (w, h) = self.placeholder_size;
                RenderFrame {
                    frame: Frame::black(w, h),
                    origin: FrameOrigin::Placeholder,
                }
            }
        }
    }

    /// 最终显示用的 RGB 图像 (格式转换 + 边缘 + 旋转)
    pub fn display_image(&mut self) -> RgbImage {
        let render = self.frame_to_render();
        let frame = render.frame.rotate(self.rotation);
        match self.mode {
            DisplayMode::Edge => {
                let edges = canny(&frame.to_gray_image(), EDGE_LOW, EDGE_HIGH);
                DynamicImage::ImageLuma8(edges).into_rgb8()
            }
            _ => frame.to_rgb_image(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelLayout;
    use std::time::Instant;

    fn coordinator() -> (Arc<FrameStore>, ViewCoordinator) {
        let store = Arc::new(FrameStore::new());
        (store.clone(), ViewCoordinator::new(store))
    }

    #[test]
    fn test_fallback_chain() {
        let (store, mut view) = coordinator();
        assert_eq!(view.frame_to_render().origin, FrameOrigin::Placeholder);

        let out = Frame::black(8, 6).stamped(1, Instant::now());
        store.record_output(&out);
        assert_eq!(view.frame_to_render().origin, FrameOrigin::LastOutput);

        let raw = Frame::black(8, 6).stamped(2, Instant::now());
        store.record_raw(&raw);
        view.set_mode(DisplayMode::Detection);
        assert_eq!(view.frame_to_render().origin, FrameOrigin::Raw);

        store.record_tool(4, ToolKind::Detect, &raw);
        assert_eq!(view.frame_to_render().origin, FrameOrigin::Tool(4));

        // 选中工具优先于显示模式
        view.select_tool(Some(9));
        assert_eq!(view.frame_to_render().origin, FrameOrigin::Raw);

        store.clear();
        let placeholder = view.frame_to_render();
        assert_eq!(placeholder.origin, FrameOrigin::Placeholder);
        assert_eq!((placeholder.frame.width(), placeholder.frame.height()), (8, 6));
    }

    #[test]
    fn test_zoom_bounds() {
        let (_, mut view) = coordinator();
        assert_eq!(view.zoom(), DEFAULT_ZOOM);
        view.zoom_in();
        assert!((view.zoom() - 1.2).abs() < 1e-6);
        for _ in 0..100 {
            view.zoom_out();
        }
        assert_eq!(view.zoom(), MIN_ZOOM);
        view.set_zoom(42.0);
        assert_eq!(view.zoom(), MAX_ZOOM);
        view.reset_zoom();
        assert_eq!(view.display_size(100, 50), (110, 55));
    }

    #[test]
    fn test_display_converts_and_rotates() {
        let (store, mut view) = coordinator();
        // 2x1 BGR: 第一个像素 B=1 G=2 R=3
        let frame = Frame::new(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelLayout::Bgr).unwrap();
        store.record_raw(&frame);

        let img = view.display_image();
        assert_eq!(img.get_pixel(0, 0).0, [3, 2, 1]);

        view.rotate_cw();
        let img = view.display_image();
        assert_eq!(img.dimensions(), (1, 2));
    }

    #[test]
    fn test_edge_mode_outputs_binary_image() {
        let (store, mut view) = coordinator();
        let mut data = vec![0u8; 32 * 32];
        for y in 0..32 {
            for x in 16..32 {
                data[y * 32 + x] = 255;
            }
        }
        store.record_raw(&Frame::new(data, 32, 32, PixelLayout::Gray).unwrap());
        view.set_mode(DisplayMode::Edge);
        let img = view.display_image();
        assert!(img.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
        assert!(img.pixels().any(|p| p.0[0] == 255));
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!("tool:12".parse::<DisplayMode>().unwrap(), DisplayMode::Tool(12));
        assert_eq!("Edge".parse::<DisplayMode>().unwrap(), DisplayMode::Edge);
        assert!("thermal".parse::<DisplayMode>().is_err());
        assert_eq!(DisplayMode::Tool(3).to_string(), "tool:3");
    }
}
