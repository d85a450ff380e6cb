// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! DAG 步骤执行 (带重试)
//!
//! 作业文档可以带 `steps`, 每一步引用一个工具并声明依赖:
//! - 拓扑排序 (Kahn), 有环 → InvalidJob
//! - 依赖失败或被跳过的步骤标记 Skipped
//! - 失败按 max_retries 重试, 每次从同一份上下文快照开始
//! - config_overrides 只在该步骤执行期间生效

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{FrameStore, PipelineContext};
use crate::error::{Result, VisionError};
use crate::frame::Frame;
use crate::tools::{ToolInstance, ToolResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub tool_id: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub config_overrides: Map<String, Value>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, tool_id: u32) -> Self {
        Self {
            id: id.into(),
            tool_id,
            dependencies: Vec::new(),
            config_overrides: Map::new(),
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: default_max_retries(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.retry_count = 0;
    }
}

/// 一次 DAG 执行的结果
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    /// 执行顺序 (步骤 ID)
    pub order: Vec<String>,
    pub outputs: HashMap<String, Frame>,
    pub results: HashMap<String, ToolResult>,
    pub errors: HashMap<String, String>,
    pub context: PipelineContext,
}

impl WorkflowRun {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// 拓扑排序, 同层按声明顺序
pub fn topological_order(steps: &[WorkflowStep]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    if index.len() != steps.len() {
        return Err(VisionError::InvalidJob("步骤 ID 重复".into()));
    }

    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.dependencies {
            let &d = index.get(dep.as_str()).ok_or_else(|| {
                VisionError::InvalidJob(format!("步骤 {} 依赖不存在的步骤 {}", step.id, dep))
            })?;
            indegree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &j in &dependents[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                queue.push_back(j);
            }
        }
    }

    if order.len() != steps.len() {
        return Err(VisionError::InvalidJob("步骤依赖存在环".into()));
    }
    Ok(order)
}

/// 按依赖顺序执行步骤
///
/// 步骤的输入图像是第一个依赖的输出, 没有依赖时为原始帧
pub fn run_steps(
    frame: &Frame,
    tools: &mut [ToolInstance],
    steps: &mut [WorkflowStep],
    store: &FrameStore,
    mut ctx: PipelineContext,
) -> Result<WorkflowRun> {
    let order = topological_order(steps)?;
    for step in steps.iter_mut() {
        step.reset();
    }
    store.record_raw(frame);

    let mut outputs: HashMap<String, Frame> = HashMap::new();
    let mut results = HashMap::new();
    let mut errors = HashMap::new();
    let mut order_ids = Vec::with_capacity(order.len());

    for i in order {
        let step_id = steps[i].id.clone();
        order_ids.push(step_id.clone());

        let blocked = steps[i].dependencies.iter().any(|d| {
            steps
                .iter()
                .find(|s| &s.id == d)
                .map(|s| s.status != StepStatus::Completed)
                .unwrap_or(true)
        });
        if blocked {
            debug!("步骤 {} 的依赖未完成, 跳过", step_id);
            steps[i].status = StepStatus::Skipped;
            continue;
        }

        let tool_id = steps[i].tool_id;
        let instance = tools
            .iter_mut()
            .find(|t| t.id == tool_id)
            .ok_or(VisionError::ToolNotFound(tool_id))?;

        let input = steps[i]
            .dependencies
            .first()
            .and_then(|d| outputs.get(d))
            .cloned()
            .unwrap_or_else(|| frame.clone());

        // 临时覆盖配置, 执行后恢复
        let saved = instance.tool.config_value();
        let overrides = steps[i].config_overrides.clone();
        if !overrides.is_empty() {
            if let Err(e) = instance.tool.update_config(&overrides) {
                warn!("⚠️ 步骤 {} 覆盖配置被拒绝: {}", step_id, e);
                steps[i].status = StepStatus::Failed;
                errors.insert(step_id, e.to_string());
                continue;
            }
        }

        steps[i].status = StepStatus::Running;
        let mut last_err = None;
        loop {
            let mut attempt_ctx = ctx.clone();
            attempt_ctx.current_tool = Some(tool_id);
            let started = Instant::now();
            match instance.tool.process(&input, &mut attempt_ctx) {
                Ok(out) => {
                    instance.diagnostics.record_ok(started.elapsed());
                    attempt_ctx.current_tool = None;
                    ctx = attempt_ctx;
                    store.record_tool(tool_id, instance.kind(), &out.image);
                    store.record_output(&out.image);
                    outputs.insert(step_id.clone(), out.image);
                    results.insert(step_id.clone(), out.result);
                    last_err = None;
                    break;
                }
                Err(e) => {
                    instance.diagnostics.record_error(&e, started.elapsed());
                    if steps[i].retry_count >= steps[i].max_retries {
                        last_err = Some(e);
                        break;
                    }
                    steps[i].retry_count += 1;
                    debug!(
                        "步骤 {} 失败, 重试 {}/{}: {}",
                        step_id, steps[i].retry_count, steps[i].max_retries, e
                    );
                }
            }
        }

        if !overrides.is_empty() {
            if let Value::Object(map) = saved {
                if let Err(e) = instance.tool.update_config(&map) {
                    warn!("⚠️ 步骤 {} 恢复配置失败: {}", step_id, e);
                }
            }
        }

        match last_err {
            None => steps[i].status = StepStatus::Completed,
            Some(e) => {
                warn!("⚠️ 步骤 {} 最终失败: {}", step_id, e);
                steps[i].status = StepStatus::Failed;
                ctx.record_error(tool_id, e.to_string());
                errors.insert(step_id, e.to_string());
            }
        }
    }

    info!(
        "🧩 工作流完成: {} 步, {} 失败",
        order_ids.len(),
        errors.len()
    );
    Ok(WorkflowRun {
        order: order_ids,
        outputs,
        results,
        errors,
        context: ctx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InferenceBackend;
    use crate::tools::{CameraSourceConfig, CameraSourceTool, DetectConfig, DetectTool, Tool};
    use ndarray::{Array, ArrayD};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// 前 n 次调用失败
    struct Flaky {
        failures: Arc<AtomicUsize>,
    }

    impl InferenceBackend for Flaky {
        fn run(&mut self, _input: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(VisionError::InferenceError("flaky".into()));
            }
            Ok(vec![Array::from_shape_vec((1, 1, 6), vec![1.0, 1.0, 9.0, 9.0, 0.9, 0.0])
                .map_err(|e| VisionError::InferenceError(e.to_string()))?
                .into_dyn()])
        }
    }

    fn tools(failures: usize) -> Vec<ToolInstance> {
        let loader: crate::tools::ModelLoader =
            Arc::new(|p: &str| Err(VisionError::ModelNotLoaded(p.to_string())));
        let backend = Flaky {
            failures: Arc::new(AtomicUsize::new(failures)),
        };
        vec![
            ToolInstance::new(
                1,
                "Camera Source",
                Tool::CameraSource(CameraSourceTool::new(CameraSourceConfig::default(), None)),
            ),
            ToolInstance::new(
                2,
                "Detect",
                Tool::Detect(DetectTool::with_backend(
                    DetectConfig {
                        input_size: 32,
                        ..Default::default()
                    },
                    Box::new(backend),
                    loader,
                )),
            ),
        ]
    }

    fn steps() -> Vec<WorkflowStep> {
        vec![
            WorkflowStep::new("detect", 2).depends_on("camera"),
            WorkflowStep::new("camera", 1),
        ]
    }

    #[test]
    fn test_cycle_rejected() {
        let steps = vec![
            WorkflowStep::new("a", 1).depends_on("b"),
            WorkflowStep::new("b", 2).depends_on("a"),
        ];
        assert!(matches!(topological_order(&steps), Err(VisionError::InvalidJob(_))));
        let missing = vec![WorkflowStep::new("a", 1).depends_on("zzz")];
        assert!(topological_order(&missing).is_err());
    }

    #[test]
    fn test_retry_output_matches_clean_run() {
        let frame = Frame::black(32, 32);
        let store = FrameStore::new();

        let mut clean_tools = tools(0);
        let mut clean_steps = steps();
        let clean = run_steps(&frame, &mut clean_tools, &mut clean_steps, &store, PipelineContext::new()).unwrap();

        let mut flaky_tools = tools(2);
        let mut flaky_steps = steps();
        let retried = run_steps(&frame, &mut flaky_tools, &mut flaky_steps, &store, PipelineContext::new()).unwrap();

        assert_eq!(clean.order, vec!["camera", "detect"]);
        assert!(retried.succeeded());
        assert_eq!(flaky_steps[0].retry_count, 2);
        assert_eq!(clean_steps[0].retry_count, 0);
        assert_eq!(clean.context.detections, retried.context.detections);
        assert!(clean.outputs["detect"].pixels_eq(&retried.outputs["detect"]));
        assert!(!retried.context.has_errors());
    }

    #[test]
    fn test_failed_dependency_skips_dependents() {
        let frame = Frame::black(32, 32);
        let store = FrameStore::new();
        let mut tools = tools(10);
        let mut steps = vec![
            WorkflowStep::new("camera", 1),
            WorkflowStep::new("detect", 2).depends_on("camera"),
            WorkflowStep::new("again", 1).depends_on("detect"),
        ];
        steps[1].max_retries = 1;
        let run = run_steps(&frame, &mut tools, &mut steps, &store, PipelineContext::new()).unwrap();

        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].status, StepStatus::Failed);
        assert_eq!(steps[1].retry_count, 1);
        assert_eq!(steps[2].status, StepStatus::Skipped);
        assert!(run.errors.contains_key("detect"));
        assert!(run.context.tool_error(2).is_some());
    }

    #[test]
    fn test_overrides_are_temporary() {
        let frame = Frame::black(32, 32);
        let store = FrameStore::new();
        let mut tools = tools(0);
        let mut step = WorkflowStep::new("detect", 2);
        step.config_overrides
            .insert("confidence_threshold".into(), Value::from(0.95));
        let mut steps = vec![step];
        let run = run_steps(&frame, &mut tools, &mut steps, &store, PipelineContext::new()).unwrap();

        // 0.9 < 0.95: 覆盖期间没有检测结果
        assert_eq!(run.context.detections.as_ref().map(Vec::len), Some(0));
        assert_eq!(tools[1].tool.config_value()["confidence_threshold"], 0.25);
    }
}
