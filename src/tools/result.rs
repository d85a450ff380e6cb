// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 结果工具: 用上游的检测/分类结果向 ResultManager 请求 OK/NG 判定

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{merge_config, ToolConfig, ToolOutput, ToolResult};
use crate::detection::Detection;
use crate::error::Result;
use crate::frame::Frame;
use crate::pipeline::PipelineContext;
use crate::result::{
    validate_threshold, ReferenceData, ResultManager, Status, Verdict, DEFAULT_THRESHOLD,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultConfig {
    /// 关闭时一律判 OK
    pub ng_enabled: bool,
    pub similarity_threshold: f32,
    /// 作业里保存的参考检测 (加载时写入 ResultManager)
    pub reference_detections: Option<Vec<Detection>>,
}

impl Default for ResultConfig {
    fn default() -> Self {
        Self {
            ng_enabled: true,
            similarity_threshold: DEFAULT_THRESHOLD,
            reference_detections: None,
        }
    }
}

impl ToolConfig for ResultConfig {
    fn validate(&self) -> Result<()> {
        validate_threshold(self.similarity_threshold)
    }
}

pub struct ResultTool {
    config: ResultConfig,
    results: Arc<ResultManager>,
}

impl ResultTool {
    pub fn new(config: ResultConfig, results: Arc<ResultManager>) -> Self {
        let tool = Self { config, results };
        tool.seed_reference();
        tool
    }

    pub fn config(&self) -> &ResultConfig {
        &self.config
    }

    pub fn update_config(&mut self, patch: &Map<String, Value>) -> Result<()> {
        let merged = merge_config(&self.config, patch, true)?;
        let reseed = merged.reference_detections != self.config.reference_detections;
        self.config = merged;
        if reseed {
            self.seed_reference();
        }
        Ok(())
    }

    fn seed_reference(&self) {
        if let Some(reference) = &self.config.reference_detections {
            self.results.set_reference_detections(reference.clone(), None);
        }
    }

    pub fn process(&mut self, frame: &Frame, ctx: &mut PipelineContext) -> Result<ToolOutput> {
        let threshold = self.config.similarity_threshold;
        // 参考的类型决定用哪一路结果; 上游失败时按空结果判定
        let mut verdict = match self.results.reference().map(|r| r.data) {
            Some(ReferenceData::Detections(_)) => {
                let source = tool_label("detect", ctx.detection_tool_id);
                let current = ctx.detections.as_deref().unwrap_or(&[]);
                self.results.evaluate_detections(current, threshold, &source)
            }
            Some(ReferenceData::Classifications(_)) => {
                let source = tool_label("classification", ctx.classification_tool_id);
                let current = ctx.classifications.as_deref().unwrap_or(&[]);
                self.results.evaluate_classifications(current, threshold, &source)
            }
            None if ctx.detections.is_none() && ctx.classification_tool_id.is_some() => {
                Verdict::no_reference(&tool_label("classification", ctx.classification_tool_id))
            }
            None => Verdict::no_reference(&tool_label("detect", ctx.detection_tool_id)),
        };

        if !self.config.ng_enabled && verdict.status == Status::Ng {
            verdict.status = Status::Ok;
            verdict.reason = format!("ng disabled ({})", verdict.reason);
        }
        debug!(
            "判定 {} 相似度 {:.2} ({})",
            verdict.status, verdict.similarity, verdict.reason
        );

        ctx.verdict = Some(verdict.clone());
        Ok(ToolOutput {
            image: frame.clone(),
            result: ToolResult::Verdict(verdict),
        })
    }
}

fn tool_label(kind: &str, id: Option<u32>) -> String {
    match id {
        Some(id) => format!("{}#{}", kind, id),
        None => kind.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, Classification};
    use crate::result::NO_REFERENCE_REASON;

    fn det(name: &str, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(0, name, 0.9, BoundingBox::new(x1, y1, x2, y2))
    }

    fn reference() -> Vec<Detection> {
        vec![det("A", 10.0, 10.0, 50.0, 50.0), det("B", 60.0, 10.0, 100.0, 50.0)]
    }

    #[test]
    fn test_no_reference_is_ng() {
        let mut tool = ResultTool::new(ResultConfig::default(), Arc::new(ResultManager::new(5)));
        let mut ctx = PipelineContext {
            detections: Some(reference()),
            ..Default::default()
        };
        tool.process(&Frame::black(4, 4), &mut ctx).unwrap();
        let v = ctx.verdict.unwrap();
        assert_eq!(v.status, Status::Ng);
        assert_eq!(v.reason, NO_REFERENCE_REASON);
    }

    #[test]
    fn test_missing_upstream_detections_use_detection_rule() {
        let results = Arc::new(ResultManager::new(5));
        results.set_reference_detections(vec![det("A", 10.0, 10.0, 50.0, 50.0)], None);
        let mut tool = ResultTool::new(ResultConfig::default(), results);

        // 检测工具失败: 只留下了工具 id, 没有检测结果
        let mut ctx = PipelineContext {
            detection_tool_id: Some(2),
            classifications: Some(vec![Classification {
                class_id: 0,
                class_name: "A".into(),
                confidence: 0.9,
            }]),
            ..Default::default()
        };
        tool.process(&Frame::black(4, 4), &mut ctx).unwrap();
        let v = ctx.verdict.unwrap();
        assert_eq!(v.status, Status::Ng);
        assert_eq!(v.similarity, 0.0);
        assert_eq!(v.reason, "no detections (expected 1)");
        assert_eq!(v.source_tool, "detect#2");
    }

    #[test]
    fn test_missing_upstream_classifications() {
        let results = Arc::new(ResultManager::new(5));
        results.set_reference_classifications(
            vec![Classification {
                class_id: 0,
                class_name: "good".into(),
                confidence: 0.9,
            }],
            None,
        );
        let mut tool = ResultTool::new(ResultConfig::default(), results);
        let mut ctx = PipelineContext {
            detections: Some(reference()),
            classification_tool_id: Some(4),
            ..Default::default()
        };
        tool.process(&Frame::black(4, 4), &mut ctx).unwrap();
        let v = ctx.verdict.unwrap();
        assert_eq!(v.status, Status::Ng);
        assert_eq!(v.reason, "no classifications");
        assert_eq!(v.source_tool, "classification#4");
    }

    #[test]
    fn test_config_reference_seeds_manager() {
        let results = Arc::new(ResultManager::new(5));
        let config = ResultConfig {
            reference_detections: Some(reference()),
            ..Default::default()
        };
        let mut tool = ResultTool::new(config, results.clone());
        assert!(results.has_reference());

        let mut ctx = PipelineContext {
            detections: Some(reference()),
            detection_tool_id: Some(2),
            ..Default::default()
        };
        let out = tool.process(&Frame::black(4, 4), &mut ctx).unwrap();
        match out.result {
            ToolResult::Verdict(v) => {
                assert!(v.is_ok());
                assert_eq!(v.source_tool, "detect#2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ng_disabled_forces_ok() {
        let results = Arc::new(ResultManager::new(5));
        results.set_reference_classifications(
            vec![Classification {
                class_id: 0,
                class_name: "good".into(),
                confidence: 0.9,
            }],
            None,
        );
        let mut tool = ResultTool::new(
            ResultConfig {
                ng_enabled: false,
                ..Default::default()
            },
            results,
        );
        let mut ctx = PipelineContext {
            classifications: Some(vec![Classification {
                class_id: 1,
                class_name: "bad".into(),
                confidence: 0.7,
            }]),
            ..Default::default()
        };
        tool.process(&Frame::black(4, 4), &mut ctx).unwrap();
        let v = ctx.verdict.unwrap();
        assert_eq!(v.status, Status::Ok);
        assert!((v.similarity - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_validated() {
        let mut tool = ResultTool::new(ResultConfig::default(), Arc::new(ResultManager::new(5)));
        let patch = serde_json::json!({"similarity_threshold": 1.5});
        assert!(tool.update_config(patch.as_object().unwrap()).is_err());
        assert_eq!(tool.config().similarity_threshold, DEFAULT_THRESHOLD);
    }
}
