// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 作业文档 (JSON)
//!
//! ```json
//! {
//!   "name": "...", "description": "...",
//!   "tools": [{"id": 1, "type": "camera_source", "display_name": "...", "config": {...}, "enabled": true}],
//!   "connections": [{"source_id": 1, "target_id": 2, "primary": true}],
//!   "created_at": "...", "updated_at": "...",
//!   "steps": [...]
//! }
//! ```

use std::fs;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::pipeline::WorkflowStep;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub id: u32,
    /// 工具类型名, 兼容旧名称 (见 ToolKind::from_str)
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub source_id: u32,
    pub target_id: u32,
    #[serde(default = "default_enabled")]
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default = "Local::now")]
    pub created_at: DateTime<Local>,
    #[serde(default = "Local::now")]
    pub updated_at: DateTime<Local>,
    /// 增强版文档的 DAG 步骤
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<WorkflowStep>>,
}

impl JobDocument {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let doc = Self::from_json(&fs::read_to_string(path)?)?;
        info!("✅ 作业已从 {} 加载 ({} 个工具)", path.display(), doc.tools.len());
        Ok(doc)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?)?;
        info!("💾 作业已保存到 {}", path.display());
        Ok(())
    }
}

/// 相邻工具首尾相连
pub fn chain_connections(ids: &[u32]) -> Vec<Connection> {
    ids.windows(2)
        .map(|w| Connection {
            source_id: w[0],
            target_id: w[1],
            primary: true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_document_defaults() {
        let doc = JobDocument::from_json(
            r#"{"name": "demo", "tools": [{"id": 3, "type": "OptimizedDetect"}]}"#,
        )
        .unwrap();
        assert_eq!(doc.tools[0].kind, "OptimizedDetect");
        assert!(doc.tools[0].enabled);
        assert!(doc.tools[0].config.is_null());
        assert!(doc.steps.is_none());
        assert!(!doc.to_json().unwrap().contains("steps"));
    }

    #[test]
    fn test_chain() {
        let c = chain_connections(&[1, 4, 2]);
        assert_eq!(c.len(), 2);
        assert_eq!((c[1].source_id, c[1].target_id), (4, 2));
        assert!(chain_connections(&[1]).is_empty());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        let doc = JobDocument {
            name: "line-3".into(),
            description: String::new(),
            tools: Vec::new(),
            connections: Vec::new(),
            created_at: Local::now(),
            updated_at: Local::now(),
            steps: Some(vec![WorkflowStep::new("a", 1)]),
        };
        doc.save(&path).unwrap();
        let back = JobDocument::load(&path).unwrap();
        assert_eq!(back.name, "line-3");
        assert_eq!(back.steps.map(|s| s.len()), Some(1));
    }
}
