// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 作业管理 (JobManager)
///
/// 作业 = 有序工具列表 + 元数据。每次修改都检查不变量:
/// - 工具 ID 单调分配, 删除后不复用
/// - 最多一个相机源
/// - Result 工具排在它判定的检测/分类工具之后
///
/// 新增工具的位置: 相机源放最前, 检测/分类放在第一个 Result 之前, Result 放最后。
pub mod document;

pub use document::{chain_connections, Connection, JobDocument, ToolEntry};

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::camera::CameraMode;
use crate::error::{Result, VisionError};
use crate::frame::Frame;
use crate::pipeline::{run_steps, FrameStore, PipelineContext, PipelineExecutor, PipelineRun, WorkflowRun, WorkflowStep};
use crate::tools::{CameraSourceConfig, CameraSourceTool, ToolEnv, ToolInstance, ToolKind, ToolRegistry};

/// 作业本体
pub struct Job {
    pub name: String,
    pub description: String,
    tools: Vec<ToolInstance>,
    next_id: u32,
    steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            name: name.into(),
            description: String::new(),
            tools: Vec::new(),
            next_id: 1,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn tools(&self) -> &[ToolInstance] {
        &self.tools
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn kinds(&self) -> Vec<ToolKind> {
        self.tools.iter().map(|t| t.kind()).collect()
    }

    fn position(&self, id: u32) -> Result<usize> {
        self.tools
            .iter()
            .position(|t| t.id == id)
            .ok_or(VisionError::ToolNotFound(id))
    }

    fn touch(&mut self) {
        self.updated_at = Local::now();
    }
}

/// 检查工具顺序: 至多一个相机源; 有检测/分类时 Result 不能排在它们全部之前
pub fn validate_order(kinds: &[ToolKind]) -> Result<()> {
    let cameras = kinds.iter().filter(|k| **k == ToolKind::CameraSource).count();
    if cameras > 1 {
        return Err(VisionError::InvalidJob("作业中最多一个相机源".into()));
    }
    if let Some(first_eval) = kinds.iter().position(|k| k.is_evaluator()) {
        if kinds[..first_eval].contains(&ToolKind::Result) {
            return Err(VisionError::InvalidJob(
                "Result 工具必须位于检测/分类工具之后".into(),
            ));
        }
    }
    Ok(())
}

/// 新工具的插入位置
fn insert_position(kinds: &[ToolKind], kind: ToolKind) -> usize {
    match kind {
        ToolKind::CameraSource => 0,
        ToolKind::Detect | ToolKind::Classification => kinds
            .iter()
            .position(|k| *k == ToolKind::Result)
            .unwrap_or(kinds.len()),
        ToolKind::Result => kinds.len(),
    }
}

// ========== 相机源状态 ==========

/// 启用的相机源配置快照
///
/// 执行线程整帧持有作业锁, 界面线程通过它读写相机模式而不等待推理。
#[derive(Default)]
pub struct CameraSourceState {
    inner: Mutex<CameraSlot>,
}

#[derive(Default)]
struct CameraSlot {
    config: Option<CameraSourceConfig>,
    /// 尚未写回工具的模式
    requested_mode: Option<CameraMode>,
}

impl CameraSourceState {
    pub fn is_present(&self) -> bool {
        self.inner.lock().config.is_some()
    }

    pub fn config(&self) -> Option<CameraSourceConfig> {
        self.inner.lock().config.clone()
    }

    pub fn mode(&self) -> Option<CameraMode> {
        self.inner.lock().config.as_ref().map(|c| c.mode)
    }

    /// 记录模式切换, 下一次持有作业锁时写回相机源工具
    pub fn request_mode(&self, mode: CameraMode) {
        let mut slot = self.inner.lock();
        if let Some(config) = slot.config.as_mut() {
            config.mode = mode;
            slot.requested_mode = Some(mode);
        }
    }

    fn requested_mode(&self) -> Option<CameraMode> {
        self.inner.lock().requested_mode
    }

    fn take_requested(&self) -> Option<CameraMode> {
        self.inner.lock().requested_mode.take()
    }

    fn publish(&self, config: Option<CameraSourceConfig>) {
        let mut slot = self.inner.lock();
        let requested = slot.requested_mode;
        slot.config = config.map(|mut c| {
            if let Some(mode) = requested {
                c.mode = mode;
            }
            c
        });
    }
}

pub struct JobManager {
    job: Job,
    camera_state: Arc<CameraSourceState>,
    registry: ToolRegistry,
    env: ToolEnv,
    executor: PipelineExecutor,
}

impl JobManager {
    pub fn new(env: ToolEnv) -> Self {
        Self::with_registry(env, ToolRegistry::with_defaults(), Arc::new(FrameStore::new()))
    }

    pub fn with_registry(env: ToolEnv, registry: ToolRegistry, store: Arc<FrameStore>) -> Self {
        Self {
            job: Job::new("untitled"),
            camera_state: Arc::new(CameraSourceState::default()),
            registry,
            env,
            executor: PipelineExecutor::with_store(store),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn env(&self) -> &ToolEnv {
        &self.env
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        self.executor.store()
    }

    pub fn tools(&self) -> &[ToolInstance] {
        self.job.tools()
    }

    pub fn tool(&self, id: u32) -> Option<&ToolInstance> {
        self.job.tools.iter().find(|t| t.id == id)
    }

    pub fn tool_mut(&mut self, id: u32) -> Option<&mut ToolInstance> {
        self.job.tools.iter_mut().find(|t| t.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.job.tools.is_empty()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.job.name = name.into();
        self.job.touch();
    }

    // ========== 增删改 ==========

    /// 新增工具, 返回分配的 ID
    pub fn add_tool(&mut self, kind: ToolKind, config: Option<&Value>) -> Result<u32> {
        let kinds = self.job.kinds();
        if kind == ToolKind::CameraSource && kinds.contains(&ToolKind::CameraSource) {
            return Err(VisionError::InvalidJob("作业中已有相机源".into()));
        }
        let tool = self.registry.create(kind, &self.env, config)?;

        let id = self.job.next_id;
        self.job.next_id += 1;
        let index = insert_position(&kinds, kind);
        self.job
            .tools
            .insert(index, ToolInstance::new(id, kind.display_name(), tool));
        self.job.touch();
        self.sync_camera_state();
        info!("➕ 添加工具 {} #{} (位置 {})", kind, id, index);
        Ok(id)
    }

    /// 删除工具, 释放资源并清除它产生的参考
    pub fn remove_tool(&mut self, id: u32) -> Result<()> {
        let index = self.job.position(id)?;
        let mut removed = self.job.tools.remove(index);
        removed.tool.cleanup();
        self.env.results.clear_reference_for_tool(id);
        self.store().forget_tool(id);
        self.job.steps.retain(|s| s.tool_id != id);
        self.job.touch();
        self.sync_camera_state();
        info!("➖ 删除工具 {} #{}", removed.kind(), id);
        Ok(())
    }

    /// 移动工具到 new_index, 违反顺序约束时不生效
    pub fn move_tool(&mut self, id: u32, new_index: usize) -> Result<()> {
        let index = self.job.position(id)?;
        let new_index = new_index.min(self.job.tools.len() - 1);
        let mut kinds = self.job.kinds();
        let kind = kinds.remove(index);
        kinds.insert(new_index, kind);
        validate_order(&kinds)?;

        let tool = self.job.tools.remove(index);
        self.job.tools.insert(new_index, tool);
        self.job.touch();
        Ok(())
    }

    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> Result<()> {
        let index = self.job.position(id)?;
        self.job.tools[index].enabled = enabled;
        self.job.touch();
        self.sync_camera_state();
        Ok(())
    }

    pub fn rename_tool(&mut self, id: u32, name: impl Into<String>) -> Result<()> {
        let index = self.job.position(id)?;
        self.job.tools[index].display_name = name.into();
        self.job.touch();
        Ok(())
    }

    /// 整批更新工具配置
    pub fn update_tool_config(&mut self, id: u32, patch: &Map<String, Value>) -> Result<()> {
        let index = self.job.position(id)?;
        // 先写回界面切换的模式, 否则下发配置时会把相机切回旧模式
        self.sync_camera_state();
        self.job.tools[index].tool.update_config(patch)?;
        self.job.touch();
        self.sync_camera_state();
        Ok(())
    }

    pub fn tool_config(&self, id: u32) -> Result<Value> {
        self.tool(id)
            .map(|t| t.tool.config_value())
            .ok_or(VisionError::ToolNotFound(id))
    }

    // ========== 相机源 ==========

    pub fn camera_source(&self) -> Option<&CameraSourceTool> {
        self.job.tools.iter().find_map(|t| t.tool.as_camera_source())
    }

    fn camera_source_mut(&mut self) -> Option<&mut CameraSourceTool> {
        self.job
            .tools
            .iter_mut()
            .find_map(|t| t.tool.as_camera_source_mut())
    }

    /// 相机源状态的共享句柄 (不需要作业锁)
    pub fn camera_state(&self) -> Arc<CameraSourceState> {
        self.camera_state.clone()
    }

    /// 写回界面请求的模式, 并发布当前启用的相机源配置
    fn sync_camera_state(&mut self) {
        if let Some(mode) = self.camera_state.take_requested() {
            if let Some(camera) = self.camera_source_mut() {
                debug!("相机源模式 → {:?}", mode);
                camera.set_mode(mode);
            }
        }
        let config = self
            .job
            .tools
            .iter()
            .filter(|t| t.enabled)
            .find_map(|t| t.tool.as_camera_source())
            .map(|c| c.config().clone());
        self.camera_state.publish(config);
    }

    pub fn camera_source_id(&self) -> Option<u32> {
        self.job
            .tools
            .iter()
            .find(|t| t.kind() == ToolKind::CameraSource)
            .map(|t| t.id)
    }

    // ========== 执行 ==========

    pub fn run(&mut self, frame: &Frame) -> PipelineRun {
        self.sync_camera_state();
        self.executor
            .run(frame, &mut self.job.tools, PipelineContext::new())
    }

    pub fn set_steps(&mut self, steps: Vec<WorkflowStep>) -> Result<()> {
        for step in &steps {
            self.job.position(step.tool_id)?;
        }
        crate::pipeline::topological_order(&steps)?;
        self.job.steps = steps;
        self.job.touch();
        Ok(())
    }

    /// 按文档里的 DAG 步骤执行 (没有步骤时返回 InvalidJob)
    pub fn run_workflow(&mut self, frame: &Frame) -> Result<WorkflowRun> {
        if self.job.steps.is_empty() {
            return Err(VisionError::InvalidJob("作业没有定义步骤".into()));
        }
        self.sync_camera_state();
        let store = self.executor.store().clone();
        run_steps(
            frame,
            &mut self.job.tools,
            &mut self.job.steps,
            &store,
            PipelineContext::new(),
        )
    }

    // ========== 持久化 ==========

    pub fn to_document(&self) -> JobDocument {
        let requested = self
            .camera_state
            .requested_mode()
            .and_then(|m| serde_json::to_value(m).ok());
        let tools: Vec<ToolEntry> = self
            .job
            .tools
            .iter()
            .map(|t| {
                let mut config = t.tool.config_value();
                // 还没写回工具的模式切换
                if let (Some(mode), Some(obj)) = (&requested, config.as_object_mut()) {
                    if t.enabled && t.kind() == ToolKind::CameraSource {
                        obj.insert("mode".to_string(), mode.clone());
                    }
                }
                ToolEntry {
                    id: t.id,
                    kind: t.kind().as_str().to_string(),
                    display_name: t.display_name.clone(),
                    config,
                    enabled: t.enabled,
                }
            })
            .collect();
        let ids: Vec<u32> = tools.iter().map(|t| t.id).collect();
        JobDocument {
            name: self.job.name.clone(),
            description: self.job.description.clone(),
            tools,
            connections: chain_connections(&ids),
            created_at: self.job.created_at,
            updated_at: self.job.updated_at,
            steps: (!self.job.steps.is_empty()).then(|| self.job.steps.clone()),
        }
    }

    /// 用文档替换当前作业; 任何条目非法时保持原作业不变
    pub fn load_document(&mut self, doc: &JobDocument) -> Result<()> {
        let mut tools = Vec::with_capacity(doc.tools.len());
        let mut seen = std::collections::HashSet::new();
        for entry in &doc.tools {
            if !seen.insert(entry.id) {
                return Err(VisionError::InvalidJob(format!("工具 ID {} 重复", entry.id)));
            }
            let kind: ToolKind = entry.kind.parse()?;
            let tool = self.registry.create(kind, &self.env, Some(&entry.config))?;
            let name = if entry.display_name.is_empty() {
                kind.display_name().to_string()
            } else {
                entry.display_name.clone()
            };
            let mut instance = ToolInstance::new(entry.id, name, tool);
            instance.enabled = entry.enabled;
            tools.push(instance);
        }
        let kinds: Vec<ToolKind> = tools.iter().map(|t| t.kind()).collect();
        validate_order(&kinds)?;

        for c in &doc.connections {
            if !seen.contains(&c.source_id) || !seen.contains(&c.target_id) {
                warn!("⚠️ 连接 {} → {} 引用了不存在的工具, 忽略", c.source_id, c.target_id);
            }
        }
        let steps = doc.steps.clone().unwrap_or_default();
        for step in &steps {
            if !seen.contains(&step.tool_id) {
                return Err(VisionError::ToolNotFound(step.tool_id));
            }
        }
        crate::pipeline::topological_order(&steps)?;

        for old in self.job.tools.iter_mut() {
            old.tool.cleanup();
        }
        self.store().clear();
        self.job = Job {
            name: doc.name.clone(),
            description: doc.description.clone(),
            next_id: seen.iter().max().map_or(1, |m| m + 1),
            tools,
            steps,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        };
        self.sync_camera_state();
        info!("📂 作业 {} 已加载: {} 个工具", self.job.name, self.job.tools.len());
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.to_document().save(path)
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let doc = JobDocument::load(path)?;
        self.load_document(&doc)
    }

    /// 释放全部工具资源
    pub fn cleanup(&mut self) {
        for t in self.job.tools.iter_mut() {
            t.tool.cleanup();
        }
    }
}
