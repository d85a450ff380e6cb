// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 工具注册表: 类型标签 → 工厂函数

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use super::{
    config_from_value, CameraSourceTool, ClassificationTool, DetectTool, ResultTool, Tool, ToolEnv,
    ToolKind,
};
use crate::error::{Result, VisionError};

/// 用保存的配置 (可缺省) 创建工具
pub type ToolFactory = fn(&ToolEnv, Option<&Value>) -> Result<Tool>;

fn create_camera_source(env: &ToolEnv, config: Option<&Value>) -> Result<Tool> {
    Ok(Tool::CameraSource(CameraSourceTool::new(
        config_from_value(config)?,
        env.source.clone(),
    )))
}

fn create_detect(env: &ToolEnv, config: Option<&Value>) -> Result<Tool> {
    Ok(Tool::Detect(DetectTool::new(
        config_from_value(config)?,
        env.model_loader.clone(),
    )))
}

fn create_classification(env: &ToolEnv, config: Option<&Value>) -> Result<Tool> {
    Ok(Tool::Classification(ClassificationTool::new(
        config_from_value(config)?,
        env.model_loader.clone(),
    )))
}

fn create_result(env: &ToolEnv, config: Option<&Value>) -> Result<Tool> {
    Ok(Tool::Result(ResultTool::new(
        config_from_value(config)?,
        env.results.clone(),
    )))
}

pub struct ToolRegistry {
    factories: BTreeMap<ToolKind, ToolFactory>,
}

impl ToolRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// 注册全部内置工具
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ToolKind::CameraSource, create_camera_source);
        registry.register(ToolKind::Detect, create_detect);
        registry.register(ToolKind::Classification, create_classification);
        registry.register(ToolKind::Result, create_result);
        registry
    }

    pub fn register(&mut self, kind: ToolKind, factory: ToolFactory) {
        if self.factories.insert(kind, factory).is_some() {
            debug!("工具 {} 的工厂被替换", kind);
        }
    }

    pub fn create(&self, kind: ToolKind, env: &ToolEnv, config: Option<&Value>) -> Result<Tool> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| VisionError::InvalidJob(format!("工具 {} 未注册", kind)))?;
        factory(env, config)
    }

    pub fn kinds(&self) -> Vec<ToolKind> {
        self.factories.keys().copied().collect()
    }

    pub fn contains(&self, kind: ToolKind) -> bool {
        self.factories.contains_key(&kind)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
