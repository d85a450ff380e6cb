// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 流水线执行器
//!
//! ```text
//! 原始帧 → tool[0] → tool[1] → ... → 最终输出
//!            │ 失败: 记录 tool_<id>_error, 下一个工具拿上一张有效图像继续
//! ```
//! 每个工具的输出图像写入 FrameStore, 供显示选择。

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use super::{FrameStore, PipelineContext, NO_TOOLS};
use crate::error::ErrorKind;
use crate::frame::Frame;
use crate::tools::{ToolInstance, ToolKind, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Ok,
    Error,
}

/// 单个工具的执行记录
#[derive(Debug, Clone, Serialize)]
pub struct ToolRecord {
    pub tool_id: u32,
    pub kind: ToolKind,
    pub display_name: String,
    #[serde(skip)]
    pub invoked_at: Instant,
    pub elapsed_ms: f64,
    pub status: RecordStatus,
    pub result: Option<ToolResult>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

/// 一帧的执行结果
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// 最后一张有效图像
    pub output: Frame,
    /// 按作业顺序, 只含启用的工具
    pub results: Vec<ToolRecord>,
    pub context: PipelineContext,
    pub error: Option<String>,
}

impl PipelineRun {
    pub fn record(&self, tool_id: u32) -> Option<&ToolRecord> {
        self.results.iter().find(|r| r.tool_id == tool_id)
    }

    pub fn failed_tools(&self) -> Vec<u32> {
        self.results
            .iter()
            .filter(|r| r.status == RecordStatus::Error)
            .map(|r| r.tool_id)
            .collect()
    }
}

#[derive(Default)]
pub struct PipelineExecutor {
    store: Arc<FrameStore>,
}

impl PipelineExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: Arc<FrameStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    /// 按顺序执行启用的工具, 单个工具失败不中断
    pub fn run(
        &self,
        frame: &Frame,
        tools: &mut [ToolInstance],
        mut ctx: PipelineContext,
    ) -> PipelineRun {
        self.store.record_raw(frame);

        // 相机源被停用时其余工具没有帧来源, 与空作业相同
        let camera_disabled = tools
            .iter()
            .any(|t| t.kind() == ToolKind::CameraSource && !t.enabled);
        if camera_disabled || !tools.iter().any(|t| t.enabled) {
            debug!("作业为空或相机源已停用, 原样输出");
            return PipelineRun {
                output: frame.clone(),
                results: Vec::new(),
                context: ctx,
                error: Some(NO_TOOLS.to_string()),
            };
        }

        let mut current = frame.clone();
        let mut results = Vec::with_capacity(tools.len());

        for instance in tools.iter_mut().filter(|t| t.enabled) {
            ctx.current_tool = Some(instance.id);
            let invoked_at = Instant::now();
            let outcome = instance.tool.process(&current, &mut ctx);
            let elapsed = invoked_at.elapsed();

            let record = match outcome {
                Ok(out) => {
                    instance.diagnostics.record_ok(elapsed);
                    current = out.image;
                    ToolRecord {
                        tool_id: instance.id,
                        kind: instance.kind(),
                        display_name: instance.display_name.clone(),
                        invoked_at,
                        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                        status: RecordStatus::Ok,
                        result: Some(out.result),
                        error: None,
                        error_kind: None,
                    }
                }
                Err(e) => {
                    warn!("⚠️ 工具 {} ({}) 执行失败: {}", instance.id, instance.display_name, e);
                    instance.diagnostics.record_error(&e, elapsed);
                    ctx.record_error(instance.id, e.to_string());
                    ToolRecord {
                        tool_id: instance.id,
                        kind: instance.kind(),
                        display_name: instance.display_name.clone(),
                        invoked_at,
                        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                        status: RecordStatus::Error,
                        result: None,
                        error: Some(e.to_string()),
                        error_kind: Some(e.kind()),
                    }
                }
            };
            self.store.record_tool(instance.id, instance.kind(), &current);
            results.push(record);
        }
        ctx.current_tool = None;

        self.store.record_output(&current);
        PipelineRun {
            output: current,
            results,
            context: ctx,
            error: None,
        }
    }
}
