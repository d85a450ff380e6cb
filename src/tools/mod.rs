// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 流水线工具 (Tools)
///
/// 工具是一个带标签的枚举, 每种工具有固定的配置结构 (默认值 + 校验):
/// - CameraSource:   透传帧, 标记像素格式与来源, 把配置转发给相机
/// - Detect:         目标检测 (letterbox → 推理 → 通用解码 → 映射回原图)
/// - Classification: 整图 / 按检测框分类
/// - Result:         调用 ResultManager 给出 OK/NG
///
/// 配置更新是整批的: 合并 → 反序列化 → 校验全部通过才生效
pub mod camera_source;
pub mod classification;
pub mod detect;
pub mod overlay;
pub mod registry;
pub mod result;

pub use camera_source::{CameraSourceConfig, CameraSourceTool};
pub use classification::{ClassificationConfig, ClassificationSummary, ClassificationTool};
pub use detect::{DetectConfig, DetectTool, DetectionSummary, Region};
pub use registry::{ToolFactory, ToolRegistry};
pub use result::{ResultConfig, ResultTool};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::camera::{CameraMode, FrameSource};
use crate::error::{ErrorKind, Result, VisionError};
use crate::frame::Frame;
use crate::models::{load_backend, InferenceBackend};
use crate::pipeline::PipelineContext;
use crate::result::{ResultManager, Verdict};

// ========== 工具类型 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    CameraSource,
    Detect,
    Classification,
    Result,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::CameraSource,
        ToolKind::Detect,
        ToolKind::Classification,
        ToolKind::Result,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::CameraSource => "camera_source",
            ToolKind::Detect => "detect",
            ToolKind::Classification => "classification",
            ToolKind::Result => "result",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ToolKind::CameraSource => "Camera Source",
            ToolKind::Detect => "Detect",
            ToolKind::Classification => "Classification",
            ToolKind::Result => "Result",
        }
    }

    /// 产生被 Result 判定的数据
    pub fn is_evaluator(&self) -> bool {
        matches!(self, ToolKind::Detect | ToolKind::Classification)
    }
}

impl FromStr for ToolKind {
    type Err = VisionError;

    /// 接受旧作业里的类型名 (优化版检测与旧检测统一为 detect)
    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .collect();
        match key.as_str() {
            "camerasource" | "camera" | "camerasourcetool" => Ok(ToolKind::CameraSource),
            "detect" | "detection" | "detecttool" | "optimizeddetect" | "optimizeddetecttool" => {
                Ok(ToolKind::Detect)
            }
            "classification" | "classify" | "classificationtool" => Ok(ToolKind::Classification),
            "result" | "resulttool" => Ok(ToolKind::Result),
            _ => Err(VisionError::InvalidJob(format!("未知工具类型 {}", s))),
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ========== 配置 ==========

/// 工具配置: serde 记录 + 校验
pub trait ToolConfig: Serialize + DeserializeOwned + Default + Clone {
    fn validate(&self) -> Result<()>;
}

/// 把 patch 合并到当前配置上, 全部键都合法才返回新配置
///
/// strict = true 时未知键直接拒绝; 否则忽略 (读取旧版本保存的作业)
pub fn merge_config<C: ToolConfig>(current: &C, patch: &Map<String, Value>, strict: bool) -> Result<C> {
    let mut value = serde_json::to_value(current)?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| VisionError::rejected("config", "配置不是对象"))?;

    for (key, v) in patch {
        if !obj.contains_key(key) {
            if strict {
                return Err(VisionError::rejected(key.as_str(), "未知配置项"));
            }
            debug!("忽略未知配置项 {}", key);
            continue;
        }
        obj.insert(key.clone(), v.clone());
    }

    let merged: C = serde_json::from_value(value)
        .map_err(|e| VisionError::rejected("config", e.to_string()))?;
    merged.validate()?;
    Ok(merged)
}

/// 从保存的 JSON 创建配置 (缺省键取默认值)
pub fn config_from_value<C: ToolConfig>(value: Option<&Value>) -> Result<C> {
    match value {
        None | Some(Value::Null) => Ok(C::default()),
        Some(Value::Object(map)) => merge_config(&C::default(), map, false),
        Some(_) => Err(VisionError::rejected("config", "配置必须是对象")),
    }
}

// ========== 输出 ==========

/// 各阶段耗时
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Timing {
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
    pub total_ms: f64,
}

impl Timing {
    pub fn from_durations(pre: Duration, infer: Duration, post: Duration) -> Self {
        Self {
            preprocess_ms: pre.as_secs_f64() * 1000.0,
            inference_ms: infer.as_secs_f64() * 1000.0,
            postprocess_ms: post.as_secs_f64() * 1000.0,
            total_ms: (pre + infer + post).as_secs_f64() * 1000.0,
        }
    }
}

/// 单个工具的结果字典
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResult {
    Camera {
        pixel_format: String,
        source: String,
        mode: CameraMode,
    },
    Detection(DetectionSummary),
    Classification(ClassificationSummary),
    Verdict(Verdict),
}

/// process 的返回: (图像, 结果)
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub image: Frame,
    pub result: ToolResult,
}

// ========== 协作者注入 ==========

/// 按模型路径创建推理引擎
pub type ModelLoader = Arc<dyn Fn(&str) -> Result<Box<dyn InferenceBackend>> + Send + Sync>;

/// 工具依赖的外部协作者
#[derive(Clone)]
pub struct ToolEnv {
    pub source: Option<FrameSource>,
    pub results: Arc<ResultManager>,
    pub model_loader: ModelLoader,
}

impl ToolEnv {
    pub fn new(results: Arc<ResultManager>) -> Self {
        Self {
            source: None,
            results,
            model_loader: Arc::new(load_backend),
        }
    }

    pub fn with_source(mut self, source: FrameSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_model_loader(mut self, loader: ModelLoader) -> Self {
        self.model_loader = loader;
        self
    }
}

// ========== 工具 ==========

pub enum Tool {
    CameraSource(CameraSourceTool),
    Detect(DetectTool),
    Classification(ClassificationTool),
    Result(ResultTool),
}

impl Tool {
    pub fn kind(&self) -> ToolKind {
        match self {
            Tool::CameraSource(_) => ToolKind::CameraSource,
            Tool::Detect(_) => ToolKind::Detect,
            Tool::Classification(_) => ToolKind::Classification,
            Tool::Result(_) => ToolKind::Result,
        }
    }

    pub fn config_value(&self) -> Value {
        let value = match self {
            Tool::CameraSource(t) => serde_json::to_value(t.config()),
            Tool::Detect(t) => serde_json::to_value(t.config()),
            Tool::Classification(t) => serde_json::to_value(t.config()),
            Tool::Result(t) => serde_json::to_value(t.config()),
        };
        value.unwrap_or(Value::Null)
    }

    /// 整批更新配置, 任何一个键不合法则全部不生效
    pub fn update_config(&mut self, patch: &Map<String, Value>) -> Result<()> {
        match self {
            Tool::CameraSource(t) => t.update_config(patch),
            Tool::Detect(t) => t.update_config(patch),
            Tool::Classification(t) => t.update_config(patch),
            Tool::Result(t) => t.update_config(patch),
        }
    }

    pub fn process(&mut self, frame: &Frame, ctx: &mut PipelineContext) -> Result<ToolOutput> {
        match self {
            Tool::CameraSource(t) => t.process(frame, ctx),
            Tool::Detect(t) => t.process(frame, ctx),
            Tool::Classification(t) => t.process(frame, ctx),
            Tool::Result(t) => t.process(frame, ctx),
        }
    }

    /// 释放模型等资源
    pub fn cleanup(&mut self) {
        match self {
            Tool::CameraSource(_) | Tool::Result(_) => {}
            Tool::Detect(t) => t.cleanup(),
            Tool::Classification(t) => t.cleanup(),
        }
    }

    pub fn as_camera_source(&self) -> Option<&CameraSourceTool> {
        match self {
            Tool::CameraSource(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_camera_source_mut(&mut self) -> Option<&mut CameraSourceTool> {
        match self {
            Tool::CameraSource(t) => Some(t),
            _ => None,
        }
    }
}

/// 单个工具的运行诊断
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolDiagnostics {
    pub runs: u64,
    pub error_count: u64,
    pub last_error: Option<ErrorKind>,
    pub last_message: Option<String>,
    pub last_elapsed_ms: f64,
}

impl ToolDiagnostics {
    pub fn record_ok(&mut self, elapsed: Duration) {
        self.runs += 1;
        self.last_elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    }

    pub fn record_error(&mut self, err: &VisionError, elapsed: Duration) {
        self.runs += 1;
        self.error_count += 1;
        self.last_error = Some(err.kind());
        self.last_message = Some(err.to_string());
        self.last_elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    }
}

/// 作业里的一个工具
pub struct ToolInstance {
    pub id: u32,
    pub display_name: String,
    pub enabled: bool,
    pub tool: Tool,
    pub diagnostics: ToolDiagnostics,
}

impl ToolInstance {
    pub fn new(id: u32, display_name: impl Into<String>, tool: Tool) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            enabled: true,
            tool,
            diagnostics: ToolDiagnostics::default(),
        }
    }

    pub fn kind(&self) -> ToolKind {
        self.tool.kind()
    }
}

impl fmt::Debug for ToolInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolInstance")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("display_name", &self.display_name)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_aliases() {
        assert_eq!("optimized_detect".parse::<ToolKind>().unwrap(), ToolKind::Detect);
        assert_eq!("Camera Source".parse::<ToolKind>().unwrap(), ToolKind::CameraSource);
        assert_eq!("OptimizedDetectTool".parse::<ToolKind>().unwrap(), ToolKind::Detect);
        assert!("ocr".parse::<ToolKind>().is_err());
    }

    #[test]
    fn test_merge_is_all_or_nothing() {
        let current = ResultConfig::default();
        let patch = json!({"similarity_threshold": 0.5, "ng_enabled": "yes"});
        let err = merge_config(&current, patch.as_object().unwrap(), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigRejected);

        let patch = json!({"similarity_threshold": 0.5, "bogus": 1});
        assert!(merge_config(&current, patch.as_object().unwrap(), true).is_err());
        let lenient = merge_config(&current, patch.as_object().unwrap(), false).unwrap();
        assert_eq!(lenient.similarity_threshold, 0.5);
    }

    #[test]
    fn test_config_from_value_defaults() {
        let cfg: DetectConfig = config_from_value(None).unwrap();
        assert_eq!(cfg.input_size, 640);
        assert!(config_from_value::<DetectConfig>(Some(&json!([1, 2]))).is_err());
    }

    #[test]
    fn test_diagnostics_track_errors() {
        let mut d = ToolDiagnostics::default();
        d.record_ok(Duration::from_millis(2));
        d.record_error(
            &VisionError::ModelNotLoaded("x".into()),
            Duration::from_millis(1),
        );
        assert_eq!((d.runs, d.error_count), (2, 1));
        assert_eq!(d.last_error, Some(ErrorKind::ModelNotLoaded));
    }
}
