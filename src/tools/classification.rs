// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 分类工具
//!
//! 两种模式:
//! - 整图: letterbox 到 input_size 后分类
//! - 按检测框: 上游给出 detections 且开启 use_detection_roi 时, 逐框 (可外扩) 裁剪分类
//!
//! 输出 softmax 后 top-k; 配置了 expected_class_name 时在角上画 OK/NG 标记 (仅提示, 判定由 Result 工具负责)

use std::time::Instant;

use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::overlay::{self, OverlayStyle};
use super::{merge_config, ModelLoader, Timing, ToolConfig, ToolOutput, ToolResult};
use crate::detection::{BoundingBox, Classification, RoiClassification};
use crate::error::{Result, VisionError};
use crate::frame::Frame;
use crate::models::{letterbox, softmax, to_nchw, top_k, InferenceBackend, Normalization, PAD_COLOR};
use crate::pipeline::PipelineContext;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub model_path: String,
    pub class_names: Vec<String>,
    pub top_k: usize,
    pub input_size: u32,
    /// false 时按相机原始 BGR 顺序送入模型
    pub convert_rgb: bool,
    /// false 时保留 0..255 像素值
    pub normalize: bool,
    pub mean: Option<[f32; 3]>,
    pub std: Option<[f32; 3]>,
    pub expected_class_name: String,
    pub show_ok_ng: bool,
    pub use_detection_roi: bool,
    pub roi_expand_ratio: f32,
    pub font_path: Option<String>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            class_names: Vec::new(),
            top_k: 5,
            input_size: 224,
            convert_rgb: true,
            normalize: true,
            mean: None,
            std: None,
            expected_class_name: String::new(),
            show_ok_ng: true,
            use_detection_roi: false,
            roi_expand_ratio: 0.0,
            font_path: None,
        }
    }
}

impl ToolConfig for ClassificationConfig {
    fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(VisionError::rejected("top_k", "至少为 1"));
        }
        if self.input_size == 0 || self.input_size > 4096 {
            return Err(VisionError::rejected("input_size", "必须在 [1, 4096] 内"));
        }
        match (self.mean, self.std) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(VisionError::rejected("mean", "mean 与 std 必须同时设置"));
            }
            (_, Some(std)) if std.iter().any(|s| !(*s > 0.0)) => {
                return Err(VisionError::rejected("std", "必须大于 0"));
            }
            _ => {}
        }
        if !(0.0..=0.5).contains(&self.roi_expand_ratio) {
            return Err(VisionError::rejected("roi_expand_ratio", "必须在 [0, 0.5] 内"));
        }
        Ok(())
    }
}

/// 分类结果字典
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassificationSummary {
    pub predictions: Vec<Classification>,
    pub roi_predictions: Vec<RoiClassification>,
    pub top1: Option<Classification>,
    /// 与 expected_class_name 比较的结果 (未配置时为 None)
    pub ok: Option<bool>,
    pub timing: Timing,
}

pub struct ClassificationTool {
    config: ClassificationConfig,
    backend: Option<Box<dyn InferenceBackend>>,
    loader: ModelLoader,
    failed_path: Option<String>,
    style: OverlayStyle,
}

impl ClassificationTool {
    pub fn new(config: ClassificationConfig, loader: ModelLoader) -> Self {
        let style = style_for(&config);
        Self {
            config,
            backend: None,
            loader,
            failed_path: None,
            style,
        }
    }

    pub fn with_backend(
        config: ClassificationConfig,
        backend: Box<dyn InferenceBackend>,
        loader: ModelLoader,
    ) -> Self {
        let mut tool = Self::new(config, loader);
        tool.backend = Some(backend);
        tool
    }

    pub fn config(&self) -> &ClassificationConfig {
        &self.config
    }

    pub fn update_config(&mut self, patch: &Map<String, Value>) -> Result<()> {
        let merged = merge_config(&self.config, patch, true)?;
        if merged.model_path != self.config.model_path {
            info!("🔄 分类模型变更: {}", merged.model_path);
            self.backend = None;
            self.failed_path = None;
        }
        if merged.font_path != self.config.font_path {
            self.style = style_for(&merged);
        }
        self.config = merged;
        Ok(())
    }

    pub fn cleanup(&mut self) {
        if self.backend.take().is_some() {
            debug!("分类模型已释放");
        }
    }

    fn ensure_backend(&mut self) -> Result<()> {
        if self.backend.is_some() {
            return Ok(());
        }
        let path = self.config.model_path.clone();
        if path.is_empty() {
            return Err(VisionError::ModelNotLoaded("未设置分类模型".into()));
        }
        if self.failed_path.as_deref() == Some(path.as_str()) {
            return Err(VisionError::ModelNotLoaded(format!("模型加载失败: {}", path)));
        }
        match (self.loader)(&path) {
            Ok(backend) => {
                info!("✅ 分类模型加载成功: {}", path);
                self.backend = Some(backend);
                Ok(())
            }
            Err(e) => {
                warn!("⚠️ 分类模型加载失败: {}", e);
                self.failed_path = Some(path);
                Err(e)
            }
        }
    }

    fn normalization(&self) -> Normalization {
        Normalization {
            mean: self.config.mean,
            std: self.config.std,
            raw_pixels: !self.config.normalize,
        }
    }

    /// 单张图: letterbox → 推理 → 概率 → top-k
    fn classify(&mut self, img: &RgbImage) -> Result<Vec<Classification>> {
        let size = self.config.input_size;
        let (boxed, _) = letterbox(img, size, size, PAD_COLOR)?;
        let input = to_nchw(&boxed, &self.normalization());

        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| VisionError::ModelNotLoaded("分类模型未加载".into()))?;
        let outputs = backend.run(input).map_err(|e| match e {
            VisionError::InferenceError(_) | VisionError::ModelNotLoaded(_) => e,
            other => VisionError::InferenceError(other.to_string()),
        })?;
        let labels = if self.config.class_names.is_empty() {
            backend.class_names().unwrap_or_default()
        } else {
            self.config.class_names.clone()
        };

        let logits: Vec<f32> = outputs
            .first()
            .ok_or_else(|| VisionError::InferenceError("模型没有输出".into()))?
            .iter()
            .copied()
            .collect();
        if logits.is_empty() {
            return Err(VisionError::InferenceError("分类输出为空".into()));
        }
        let probs = if is_distribution(&logits) {
            logits
        } else {
            softmax(&logits)
        };
        Ok(top_k(&probs, self.config.top_k, 0.0, &labels))
    }

    fn expected_ok(&self, predictions: &[Classification]) -> Option<bool> {
        if self.config.expected_class_name.is_empty() {
            return None;
        }
        Some(
            predictions
                .first()
                .map(|c| c.class_name == self.config.expected_class_name)
                .unwrap_or(false),
        )
    }

    pub fn process(&mut self, frame: &Frame, ctx: &mut PipelineContext) -> Result<ToolOutput> {
        ctx.classifications = None;
        ctx.roi_classifications = None;
        ctx.classification_tool_id = ctx.current_tool;
        self.ensure_backend()?;
        let t0 = Instant::now();

        let rgb = if self.config.convert_rgb {
            frame.to_rgb_image()
        } else {
            frame.to_bgr_image()
        };

        let rois = if self.config.use_detection_roi {
            ctx.detections.clone()
        } else {
            None
        };

        let roi_mode = rois.is_some();
        let summary = match rois {
            Some(detections) => {
                let mut roi_predictions = Vec::with_capacity(detections.len());
                for d in &detections {
                    let bbox = d
                        .bbox
                        .expand(self.config.roi_expand_ratio)
                        .clip(frame.width(), frame.height());
                    let Some(crop) = crop_bbox(&rgb, &bbox) else {
                        continue;
                    };
                    let predictions = self.classify(&crop)?;
                    roi_predictions.push(RoiClassification { bbox, predictions });
                }
                // 上下文里的整体分类取 top-1 置信度最高的框
                let predictions = roi_predictions
                    .iter()
                    .filter(|r| !r.predictions.is_empty())
                    .max_by(|a, b| a.predictions[0].confidence.total_cmp(&b.predictions[0].confidence))
                    .map(|r| r.predictions.clone())
                    .unwrap_or_default();
                let ok = if self.config.expected_class_name.is_empty() {
                    None
                } else {
                    Some(
                        !roi_predictions.is_empty()
                            && roi_predictions
                                .iter()
                                .all(|r| self.expected_ok(&r.predictions) == Some(true)),
                    )
                };
                ClassificationSummary {
                    top1: predictions.first().cloned(),
                    predictions,
                    roi_predictions,
                    ok,
                    timing: Timing::default(),
                }
            }
            None => {
                let predictions = self.classify(&rgb)?;
                ClassificationSummary {
                    top1: predictions.first().cloned(),
                    ok: self.expected_ok(&predictions),
                    predictions,
                    roi_predictions: Vec::new(),
                    timing: Timing::default(),
                }
            }
        };
        let summary = ClassificationSummary {
            timing: Timing::from_durations(Default::default(), t0.elapsed(), Default::default()),
            ..summary
        };

        if let Some(top1) = &summary.top1 {
            debug!("🏷️ 分类 {} ({:.2})", top1.class_name, top1.confidence);
        }

        ctx.classifications = Some(summary.predictions.clone());
        ctx.roi_classifications = roi_mode.then(|| summary.roi_predictions.clone());

        let image = match summary.ok {
            Some(ok) if self.config.show_ok_ng => {
                let mut canvas = frame.to_rgb_image();
                for roi in &summary.roi_predictions {
                    let roi_ok = self.expected_ok(&roi.predictions) == Some(true);
                    let color = if roi_ok { overlay::OK_COLOR } else { overlay::NG_COLOR };
                    overlay::draw_box(&mut canvas, &roi.bbox, color, 2);
                }
                overlay::draw_badge(&mut canvas, ok, &self.style);
                Frame::from_rgb_image(canvas).derived_from(frame)
            }
            _ => frame.clone(),
        };

        Ok(ToolOutput {
            image,
            result: ToolResult::Classification(summary),
        })
    }
}

fn style_for(config: &ClassificationConfig) -> OverlayStyle {
    OverlayStyle {
        line_width: 2,
        show_labels: true,
        show_confidence: true,
        font: config.font_path.as_deref().and_then(overlay::load_font),
        font_size: 16.0,
    }
}

/// 输出已经是概率分布 (模型自带 softmax)
fn is_distribution(xs: &[f32]) -> bool {
    let sum: f32 = xs.iter().sum();
    xs.iter().all(|x| (0.0..=1.0).contains(x)) && (sum - 1.0).abs() < 1e-3
}

fn crop_bbox(img: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let x = bbox.x1.max(0.0).floor() as u32;
    let y = bbox.y1.max(0.0).floor() as u32;
    let x2 = (bbox.x2.ceil() as u32 + 1).min(img.width());
    let y2 = (bbox.y2.ceil() as u32 + 1).min(img.height());
    if x2 <= x || y2 <= y {
        return None;
    }
    Some(imageops::crop_imm(img, x, y, x2 - x, y2 - y).to_image())
}
