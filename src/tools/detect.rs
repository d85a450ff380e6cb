// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测工具
//!
//! ```text
//! 帧 → (可选) 裁剪检测区域 → letterbox 到 input_size (填充 114) → BGR→RGB → /255 → NCHW
//!    → 推理 → 通用解码 (+NMS) → 置信度/类别过滤 → 逆 letterbox → 加回裁剪原点 → 截断到图像内
//! ```

use std::collections::BTreeMap;
use std::time::Instant;

use image::imageops;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::overlay::{self, OverlayStyle};
use super::{merge_config, ModelLoader, Timing, ToolConfig, ToolOutput, ToolResult};
use crate::detection::{BoundingBox, Detection};
use crate::error::{Result, VisionError};
use crate::frame::Frame;
use crate::models::{decode_detections, letterbox, to_nchw, DecodeOptions, InferenceBackend, Letterbox, Normalization, PAD_COLOR};
use crate::pipeline::PipelineContext;

/// 检测区域 (原图像素坐标)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// 截断到图像内, 完全在图像外时返回 None
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Region> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        (w > 0 && h > 0).then_some(Region {
            x: self.x,
            y: self.y,
            width: w,
            height: h,
        })
    }

    pub fn to_bbox(&self) -> BoundingBox {
        BoundingBox::new(
            self.x as f32,
            self.y as f32,
            (self.x + self.width) as f32,
            (self.y + self.height) as f32,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    pub model_path: String,
    /// 为空时使用模型元数据里的类别名
    pub class_names: Vec<String>,
    /// 只保留这些类别 (类别名或 ID), 为空表示全部
    pub selected_classes: Vec<String>,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub input_size: u32,
    pub detection_region: Option<Region>,
    pub visualize: bool,
    pub show_labels: bool,
    pub show_confidence: bool,
    pub line_width: u32,
    pub font_path: Option<String>,
    pub font_size: f32,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            class_names: Vec::new(),
            selected_classes: Vec::new(),
            confidence_threshold: 0.25,
            nms_threshold: 0.45,
            input_size: 640,
            detection_region: None,
            visualize: true,
            show_labels: true,
            show_confidence: true,
            line_width: 2,
            font_path: None,
            font_size: 16.0,
        }
    }
}

impl ToolConfig for DetectConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(VisionError::rejected("confidence_threshold", "必须在 [0, 1] 内"));
        }
        if !(0.0..=1.0).contains(&self.nms_threshold) {
            return Err(VisionError::rejected("nms_threshold", "必须在 [0, 1] 内"));
        }
        if self.input_size == 0 || self.input_size % 32 != 0 || self.input_size > 4096 {
            return Err(VisionError::rejected("input_size", "必须是 32 的倍数且不超过 4096"));
        }
        if let Some(r) = &self.detection_region {
            if r.width == 0 || r.height == 0 {
                return Err(VisionError::rejected("detection_region", "宽高必须大于 0"));
            }
        }
        if self.line_width == 0 || self.line_width > 20 {
            return Err(VisionError::rejected("line_width", "必须在 [1, 20] 内"));
        }
        if !(self.font_size > 0.0) {
            return Err(VisionError::rejected("font_size", "必须大于 0"));
        }
        Ok(())
    }
}

/// 检测结果字典
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionSummary {
    pub detections: Vec<Detection>,
    pub detection_count: usize,
    pub avg_confidence: f32,
    pub class_counts: BTreeMap<String, usize>,
    pub timing: Timing,
}

impl DetectionSummary {
    pub fn new(detections: Vec<Detection>, timing: Timing) -> Self {
        let detection_count = detections.len();
        let avg_confidence = if detections.is_empty() {
            0.0
        } else {
            detections.iter().map(|d| d.confidence).sum::<f32>() / detection_count as f32
        };
        let mut class_counts = BTreeMap::new();
        for d in &detections {
            *class_counts.entry(d.class_name.clone()).or_insert(0) += 1;
        }
        Self {
            detections,
            detection_count,
            avg_confidence,
            class_counts,
            timing,
        }
    }
}

pub struct DetectTool {
    config: DetectConfig,
    backend: Option<Box<dyn InferenceBackend>>,
    loader: ModelLoader,
    /// 加载失败过的路径, 路径不变时不再每帧重试
    failed_path: Option<String>,
    style: OverlayStyle,
}

impl DetectTool {
    pub fn new(config: DetectConfig, loader: ModelLoader) -> Self {
        let style = style_for(&config);
        Self {
            config,
            backend: None,
            loader,
            failed_path: None,
            style,
        }
    }

    /// 直接注入推理引擎
    pub fn with_backend(config: DetectConfig, backend: Box<dyn InferenceBackend>, loader: ModelLoader) -> Self {
        let mut tool = Self::new(config, loader);
        tool.backend = Some(backend);
        tool
    }

    pub fn config(&self) -> &DetectConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.is_some()
    }

    pub fn update_config(&mut self, patch: &Map<String, Value>) -> Result<()> {
        let merged = merge_config(&self.config, patch, true)?;
        if merged.model_path != self.config.model_path {
            info!("🔄 检测模型变更: {}", merged.model_path);
            self.backend = None;
            self.failed_path = None;
        }
        if merged.font_path != self.config.font_path
            || merged.font_size != self.config.font_size
            || merged.line_width != self.config.line_width
            || merged.show_labels != self.config.show_labels
            || merged.show_confidence != self.config.show_confidence
        {
            self.style = style_for(&merged);
        }
        self.config = merged;
        Ok(())
    }

    pub fn cleanup(&mut self) {
        if self.backend.take().is_some() {
            debug!("检测模型已释放");
        }
    }

    fn ensure_backend(&mut self) -> Result<()> {
        if self.backend.is_some() {
            return Ok(());
        }
        let path = self.config.model_path.clone();
        if path.is_empty() {
            return Err(VisionError::ModelNotLoaded("未设置检测模型".into()));
        }
        if self.failed_path.as_deref() == Some(path.as_str()) {
            return Err(VisionError::ModelNotLoaded(format!("模型加载失败: {}", path)));
        }
        match (self.loader)(&path) {
            Ok(backend) => {
                info!("✅ 检测模型加载成功: {}", path);
                self.backend = Some(backend);
                Ok(())
            }
            Err(e) => {
                warn!("⚠️ 检测模型加载失败: {}", e);
                self.failed_path = Some(path);
                Err(e)
            }
        }
    }

    pub fn process(&mut self, frame: &Frame, ctx: &mut PipelineContext) -> Result<ToolOutput> {
        // 失败时下游看到的是本工具的空结果, 而不是更早的检测
        ctx.detections = None;
        ctx.detection_tool_id = ctx.current_tool;
        self.ensure_backend()?;
        let t0 = Instant::now();

        // 1. 裁剪检测区域
        let rgb = frame.to_rgb_image();
        let region = self
            .config
            .detection_region
            .and_then(|r| r.clamp_to(frame.width(), frame.height()));
        let (origin, lb_input) = match region {
            Some(r) => (
                (r.x as f32, r.y as f32),
                letterbox(
                    &imageops::crop_imm(&rgb, r.x, r.y, r.width, r.height).to_image(),
                    self.config.input_size,
                    self.config.input_size,
                    PAD_COLOR,
                )?,
            ),
            None => (
                (0.0, 0.0),
                letterbox(&rgb, self.config.input_size, self.config.input_size, PAD_COLOR)?,
            ),
        };
        let (boxed, lb) = lb_input;

        // 2. 张量
        let input = to_nchw(&boxed, &Normalization::default());
        let t1 = Instant::now();

        // 3. 推理
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| VisionError::ModelNotLoaded("检测模型未加载".into()))?;
        let outputs = backend.run(input).map_err(|e| match e {
            VisionError::InferenceError(_) | VisionError::ModelNotLoaded(_) => e,
            other => VisionError::InferenceError(other.to_string()),
        })?;
        let labels = if self.config.class_names.is_empty() {
            backend.class_names().unwrap_or_default()
        } else {
            self.config.class_names.clone()
        };
        let t2 = Instant::now();

        // 4. 解码 + 后处理
        let decoded = decode_detections(
            &outputs,
            &DecodeOptions {
                conf_threshold: self.config.confidence_threshold,
                iou_threshold: self.config.nms_threshold,
                labels: &labels,
            },
        )?;
        let detections = postprocess(
            decoded,
            &lb,
            origin,
            (frame.width(), frame.height()),
            self.config.confidence_threshold,
            &self.config.selected_classes,
        );
        let t3 = Instant::now();

        let summary = DetectionSummary::new(
            detections.clone(),
            Timing::from_durations(t1 - t0, t2 - t1, t3 - t2),
        );
        debug!(
            "🔍 检测 {} 个目标 | 推理 {:.1}ms",
            summary.detection_count, summary.timing.inference_ms
        );

        ctx.detections = Some(detections);

        // 5. 可视化 (在副本上画)
        let image = if self.config.visualize {
            let mut canvas = rgb;
            if let Some(r) = region {
                overlay::draw_region(&mut canvas, &r.to_bbox());
            }
            overlay::draw_detections(&mut canvas, &summary.detections, &self.style);
            Frame::from_rgb_image(canvas).derived_from(frame)
        } else {
            frame.clone()
        };

        Ok(ToolOutput {
            image,
            result: ToolResult::Detection(summary),
        })
    }
}

fn style_for(config: &DetectConfig) -> OverlayStyle {
    OverlayStyle {
        line_width: config.line_width,
        show_labels: config.show_labels,
        show_confidence: config.show_confidence,
        font: config.font_path.as_deref().and_then(overlay::load_font),
        font_size: config.font_size,
    }
}

/// 置信度/类别过滤, 映射回原图坐标并截断
pub fn postprocess(
    detections: Vec<Detection>,
    lb: &Letterbox,
    origin: (f32, f32),
    frame_size: (u32, u32),
    conf_threshold: f32,
    selected_classes: &[String],
) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= conf_threshold)
        .filter(|d| {
            selected_classes.is_empty()
                || selected_classes
                    .iter()
                    .any(|s| *s == d.class_name || s.parse::<usize>().ok() == Some(d.class_id))
        })
        .map(|mut d| {
            d.bbox = lb
                .unletterbox(&d.bbox)
                .offset(origin.0, origin.1)
                .clip(frame_size.0, frame_size.1);
            d
        })
        .filter(|d| d.bbox.x2 > d.bbox.x1 && d.bbox.y2 > d.bbox.y1)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use ndarray::{Array, ArrayD};
    use std::sync::Arc;

    /// 固定输出的推理引擎: N×6 [x1, y1, x2, y2, score, class]
    struct FixedBackend {
        rows: Vec<[f32; 6]>,
    }

    impl InferenceBackend for FixedBackend {
        fn run(&mut self, input: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> {
            assert_eq!(input.shape()[1], 3);
            let flat: Vec<f32> = self.rows.iter().flatten().copied().collect();
            Ok(vec![Array::from_shape_vec((1, self.rows.len(), 6), flat)
                .map_err(|e| VisionError::InferenceError(e.to_string()))?
                .into_dyn()])
        }
    }

    fn no_loader() -> ModelLoader {
        Arc::new(|p: &str| Err(VisionError::ModelNotLoaded(p.to_string())))
    }

    fn labels() -> Vec<String> {
        vec!["A".into(), "B".into()]
    }

    #[test]
    fn test_missing_model_is_soft_error() {
        let mut tool = DetectTool::new(DetectConfig::default(), no_loader());
        let frame = Frame::black(64, 64);
        let mut ctx = PipelineContext {
            detections: Some(Vec::new()),
            detection_tool_id: Some(1),
            current_tool: Some(4),
            ..Default::default()
        };
        let err = tool.process(&frame, &mut ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelNotLoaded);
        // 更早的检测结果不能冒充本工具的
        assert!(ctx.detections.is_none());
        assert_eq!(ctx.detection_tool_id, Some(4));
    }

    #[test]
    fn test_detections_mapped_back_to_frame() {
        // 128x64 → letterbox 64: scale 0.5, pad_y 16
        let backend = FixedBackend {
            rows: vec![
                [8.0, 20.0, 24.0, 36.0, 0.9, 0.0],
                [40.0, 20.0, 70.0, 60.0, 0.6, 1.0],
                [0.0, 0.0, 4.0, 4.0, 0.1, 0.0],
            ],
        };
        let config = DetectConfig {
            input_size: 64,
            class_names: labels(),
            visualize: false,
            ..Default::default()
        };
        let mut tool = DetectTool::with_backend(config, Box::new(backend), no_loader());
        let frame = Frame::black(128, 64);
        let mut ctx = PipelineContext {
            current_tool: Some(2),
            ..Default::default()
        };
        let out = tool.process(&frame, &mut ctx).unwrap();

        let dets = ctx.detections.clone().unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(ctx.detection_tool_id, Some(2));
        let a = &dets[0].bbox;
        assert_eq!((a.x1, a.y1, a.x2, a.y2), (16.0, 8.0, 48.0, 40.0));
        // 超出部分被截断
        let b = &dets[1].bbox;
        assert_eq!((b.x2, b.y2), (127.0, 63.0));
        assert!(out.image.shares_buffer(&frame));

        match out.result {
            ToolResult::Detection(s) => {
                assert_eq!(s.detection_count, 2);
                assert_eq!(s.class_counts.get("A"), Some(&1));
                assert!((s.avg_confidence - 0.75).abs() < 1e-6);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_region_offset_and_class_filter() {
        let backend = FixedBackend {
            rows: vec![[0.0, 0.0, 32.0, 32.0, 0.9, 0.0], [0.0, 0.0, 8.0, 8.0, 0.9, 1.0]],
        };
        let config = DetectConfig {
            input_size: 32,
            class_names: labels(),
            selected_classes: vec!["A".into()],
            detection_region: Some(Region {
                x: 10,
                y: 20,
                width: 32,
                height: 32,
            }),
            ..Default::default()
        };
        let mut tool = DetectTool::with_backend(config, Box::new(backend), no_loader());
        let frame = Frame::black(100, 100);
        let mut ctx = PipelineContext::new();
        let out = tool.process(&frame, &mut ctx).unwrap();

        let dets = ctx.detections.unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_name, "A");
        assert_eq!((dets[0].bbox.x1, dets[0].bbox.y1), (10.0, 20.0));
        // 可视化输出是副本
        assert!(!out.image.shares_buffer(&frame));
        assert_eq!(out.image.sequence(), frame.sequence());
    }

    #[test]
    fn test_input_size_must_be_multiple_of_32() {
        let mut tool = DetectTool::new(DetectConfig::default(), no_loader());
        let patch = serde_json::json!({"input_size": 100});
        assert!(tool.update_config(patch.as_object().unwrap()).is_err());
        assert_eq!(tool.config().input_size, 640);
    }

    #[test]
    fn test_region_clamp() {
        let r = Region {
            x: 90,
            y: 0,
            width: 50,
            height: 10,
        };
        assert_eq!(r.clamp_to(100, 100).map(|r| r.width), Some(10));
        assert!(r.clamp_to(50, 50).is_none());
    }
}
