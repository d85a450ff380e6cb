// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 工具流水线 (Tool Pipeline)
///
/// 每一帧按作业顺序依次经过启用的工具:
/// - executor: 顺序执行, 单个工具失败只记录不中断
/// - store:    每个工具最后一次输出的图像 (供显示选择)
/// - workflow: 带依赖和重试的 DAG 步骤执行
pub mod executor;
pub mod store;
pub mod workflow;

pub use executor::{PipelineExecutor, PipelineRun, RecordStatus, ToolRecord};
pub use store::FrameStore;
pub use workflow::{run_steps, topological_order, StepStatus, WorkflowRun, WorkflowStep};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::detection::{Classification, Detection, RoiClassification};
use crate::result::Verdict;

/// 空作业 (没有启用的工具) 时的错误文本
pub const NO_TOOLS: &str = "no tools";

// ========== 上下文 ==========

/// 在工具之间传递的上下文, 只被当前及之后的工具看到
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineContext {
    pub pixel_format: Option<String>,
    pub source: Option<String>,
    pub detections: Option<Vec<Detection>>,
    pub detection_tool_id: Option<u32>,
    pub classifications: Option<Vec<Classification>>,
    pub roi_classifications: Option<Vec<RoiClassification>>,
    pub classification_tool_id: Option<u32>,
    pub verdict: Option<Verdict>,
    /// 正在执行的工具 (执行器维护)
    #[serde(skip)]
    pub current_tool: Option<u32>,
    /// 工具自定义输出, 单工具错误记在 tool_<id>_error
    pub extras: Map<String, Value>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_key(tool_id: u32) -> String {
        format!("tool_{}_error", tool_id)
    }

    pub fn record_error(&mut self, tool_id: u32, message: impl Into<String>) {
        self.extras
            .insert(Self::error_key(tool_id), Value::String(message.into()));
    }

    pub fn tool_error(&self, tool_id: u32) -> Option<&str> {
        self.extras
            .get(&Self::error_key(tool_id))
            .and_then(Value::as_str)
    }

    pub fn has_errors(&self) -> bool {
        self.extras
            .keys()
            .any(|k| k.starts_with("tool_") && k.ends_with("_error"))
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extras.insert(key.into(), value);
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }

    /// 结果字典形式 (诊断面板 / 日志)
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_keys() {
        let mut ctx = PipelineContext::new();
        assert!(!ctx.has_errors());
        ctx.record_error(3, "推理失败: boom");
        assert_eq!(ctx.tool_error(3), Some("推理失败: boom"));
        assert!(ctx.tool_error(4).is_none());
        assert!(ctx.has_errors());

        let v = ctx.to_value();
        assert_eq!(v["extras"]["tool_3_error"], "推理失败: boom");
        assert!(v.get("current_tool").is_none());
    }
}
