// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! OK/NG 判定 (ResultManager)
//!
//! 保存参考检测/分类结果, 把当前结果和参考比较得到相似度与状态,
//! 并维护与回看环对齐的判定历史 (最新在末尾)。

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::detection::{Classification, Detection};
use crate::error::{Result, VisionError};

/// 默认相似度阈值
pub const DEFAULT_THRESHOLD: f32 = 0.8;

pub const NO_REFERENCE_REASON: &str = "no reference set";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Ng,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => f.write_str("OK"),
            Status::Ng => f.write_str("NG"),
        }
    }
}

/// 单帧判定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: Status,
    pub similarity: f32,
    pub reason: String,
    pub source_tool: String,
}

impl Default for Verdict {
    fn default() -> Self {
        Self {
            status: Status::Ng,
            similarity: 0.0,
            reason: NO_REFERENCE_REASON.to_string(),
            source_tool: String::new(),
        }
    }
}

impl Verdict {
    pub fn no_reference(source_tool: &str) -> Self {
        Self {
            source_tool: source_tool.to_string(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// 参考数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "items", rename_all = "snake_case")]
pub enum ReferenceData {
    Detections(Vec<Detection>),
    Classifications(Vec<Classification>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub data: ReferenceData,
    /// 产生参考的工具, 工具被删除时参考一并清除
    pub source_tool_id: Option<u32>,
    pub set_at: DateTime<Local>,
}

// ========== 相似度算法 ==========

/// 检测结果相似度: 数量 → 类别多重集 → 逐对 IoU 均值
pub fn detection_similarity(current: &[Detection], reference: &[Detection]) -> (f32, String) {
    if reference.is_empty() {
        return (0.0, "no reference".to_string());
    }
    if current.is_empty() {
        return (
            0.0,
            format!("no detections (expected {})", reference.len()),
        );
    }
    if current.len() != reference.len() {
        let ratio = (current.len() as f32 / reference.len() as f32).min(1.0);
        return (ratio, "count mismatch".to_string());
    }

    let mut cur_names: Vec<&str> = current.iter().map(|d| d.class_name.as_str()).collect();
    let mut ref_names: Vec<&str> = reference.iter().map(|d| d.class_name.as_str()).collect();
    cur_names.sort_unstable();
    ref_names.sort_unstable();
    if cur_names != ref_names {
        let matched = multiset_overlap(&cur_names, &ref_names);
        return (
            matched as f32 / reference.len() as f32,
            "class mismatch".to_string(),
        );
    }

    let total: f32 = current
        .iter()
        .zip(reference.iter())
        .map(|(c, r)| c.bbox.iou(&r.bbox))
        .sum();
    let mean = (total / reference.len() as f32).clamp(0.0, 1.0);
    (mean, format!("IoU={:.2}", mean))
}

/// 两个已排序序列的公共元素个数
fn multiset_overlap(a: &[&str], b: &[&str]) -> usize {
    let (mut i, mut j, mut n) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(b[j]) {
            std::cmp::Ordering::Equal => {
                n += 1;
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
        }
    }
    n
}

/// 分类结果相似度: top-1 类别一致 0.9, 否则 0.3
pub fn classification_similarity(
    current: &[Classification],
    reference: &[Classification],
) -> (f32, String) {
    let Some(expected) = reference.first() else {
        return (0.0, "no reference".to_string());
    };
    let Some(top1) = current.first() else {
        return (0.0, "no classifications".to_string());
    };
    if top1.class_name == expected.class_name {
        (0.9, format!("top-1 match: {}", top1.class_name))
    } else {
        (
            0.3,
            format!("top-1 mismatch: {} != {}", top1.class_name, expected.class_name),
        )
    }
}

pub fn status_for(similarity: f32, threshold: f32) -> Status {
    if similarity >= threshold {
        Status::Ok
    } else {
        Status::Ng
    }
}

pub fn validate_threshold(threshold: f32) -> Result<()> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(VisionError::rejected(
            "similarity_threshold",
            format!("{} 不在 [0, 1] 内", threshold),
        ))
    }
}

// ========== ResultManager ==========

/// 判定器 + 判定历史
pub struct ResultManager {
    reference: Mutex<Option<Reference>>,
    history: Mutex<VecDeque<Verdict>>,
    history_capacity: usize,
}

impl ResultManager {
    pub fn new(history_capacity: usize) -> Self {
        let history_capacity = history_capacity.max(1);
        Self {
            reference: Mutex::new(None),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
        }
    }

    pub fn set_reference_detections(&self, detections: Vec<Detection>, source_tool_id: Option<u32>) {
        info!("📌 设置检测参考: {} 个目标", detections.len());
        *self.reference.lock() = Some(Reference {
            data: ReferenceData::Detections(detections),
            source_tool_id,
            set_at: Local::now(),
        });
    }

    pub fn set_reference_classifications(
        &self,
        classifications: Vec<Classification>,
        source_tool_id: Option<u32>,
    ) {
        info!(
            "📌 设置分类参考: {}",
            classifications
                .first()
                .map(|c| c.class_name.as_str())
                .unwrap_or("-")
        );
        *self.reference.lock() = Some(Reference {
            data: ReferenceData::Classifications(classifications),
            source_tool_id,
            set_at: Local::now(),
        });
    }

    pub fn clear_reference(&self) {
        if self.reference.lock().take().is_some() {
            info!("🧹 参考已清除");
        }
    }

    /// 清除由指定工具产生的参考, 返回是否清除
    pub fn clear_reference_for_tool(&self, tool_id: u32) -> bool {
        let mut reference = self.reference.lock();
        if reference.as_ref().and_then(|r| r.source_tool_id) == Some(tool_id) {
            *reference = None;
            info!("🧹 工具 {} 被移除, 参考已清除", tool_id);
            true
        } else {
            false
        }
    }

    pub fn reference(&self) -> Option<Reference> {
        self.reference.lock().clone()
    }

    pub fn has_reference(&self) -> bool {
        self.reference.lock().is_some()
    }

    pub fn reference_detections(&self) -> Result<Vec<Detection>> {
        match self.reference.lock().as_ref().map(|r| &r.data) {
            Some(ReferenceData::Detections(d)) => Ok(d.clone()),
            _ => Err(VisionError::ReferenceMissing),
        }
    }

    pub fn reference_classifications(&self) -> Result<Vec<Classification>> {
        match self.reference.lock().as_ref().map(|r| &r.data) {
            Some(ReferenceData::Classifications(c)) => Ok(c.clone()),
            _ => Err(VisionError::ReferenceMissing),
        }
    }

    pub fn evaluate_detections(
        &self,
        current: &[Detection],
        threshold: f32,
        source_tool: &str,
    ) -> Verdict {
        match self.reference_detections() {
            Ok(reference) => {
                let (similarity, reason) = detection_similarity(current, &reference);
                build_verdict(similarity, reason, threshold, source_tool)
            }
            Err(_) => Verdict::no_reference(source_tool),
        }
    }

    pub fn evaluate_classifications(
        &self,
        current: &[Classification],
        threshold: f32,
        source_tool: &str,
    ) -> Verdict {
        match self.reference_classifications() {
            Ok(reference) => {
                let (similarity, reason) = classification_similarity(current, &reference);
                build_verdict(similarity, reason, threshold, source_tool)
            }
            Err(_) => Verdict::no_reference(source_tool),
        }
    }

    // ========== 判定历史 ==========

    /// 追加一条判定 (与回看环同步调用)
    pub fn record(&self, verdict: Verdict) {
        let mut history = self.history.lock();
        history.push_back(verdict);
        while history.len() > self.history_capacity {
            history.pop_front();
        }
    }

    /// 快照, 最旧在前
    pub fn history(&self) -> Vec<Verdict> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    /// 回看窗格 i (1 = 最新) 对应 history[len - i]
    pub fn pane_status(&self, pane: usize) -> Option<Status> {
        let history = self.history.lock();
        if pane == 0 || pane > history.len() {
            return None;
        }
        history.get(history.len() - pane).map(|v| v.status)
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

fn build_verdict(similarity: f32, reason: String, threshold: f32, source_tool: &str) -> Verdict {
    let similarity = similarity.clamp(0.0, 1.0);
    let status = status_for(similarity, threshold);
    debug!("⚖️ {} 相似度 {:.3} → {}", source_tool, similarity, status);
    Verdict {
        status,
        similarity,
        reason,
        source_tool: source_tool.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;

    fn det(name: &str, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(0, name, 0.9, BoundingBox::new(x1, y1, x2, y2))
    }

    fn cls(name: &str) -> Classification {
        Classification {
            class_id: 0,
            class_name: name.to_string(),
            confidence: 0.8,
        }
    }

    fn reference() -> Vec<Detection> {
        vec![
            det("A", 10.0, 10.0, 50.0, 50.0),
            det("B", 60.0, 10.0, 100.0, 50.0),
        ]
    }

    #[test]
    fn test_detection_similarity_close_boxes() {
        let current = vec![
            det("A", 12.0, 12.0, 52.0, 52.0),
            det("B", 58.0, 12.0, 102.0, 52.0),
        ];
        let (sim, reason) = detection_similarity(&current, &reference());
        assert!(sim > 0.8 && sim < 0.9, "sim = {}", sim);
        assert!(reason.starts_with("IoU="));
        assert_eq!(status_for(sim, DEFAULT_THRESHOLD), Status::Ok);
    }

    #[test]
    fn test_detection_similarity_edge_cases() {
        assert_eq!(detection_similarity(&reference(), &[]).0, 0.0);

        let (sim, reason) = detection_similarity(&[], &reference());
        assert_eq!(sim, 0.0);
        assert_eq!(reason, "no detections (expected 2)");

        let (sim, reason) = detection_similarity(&reference()[..1], &reference());
        assert_eq!(sim, 0.5);
        assert_eq!(reason, "count mismatch");

        let three = vec![reference()[0].clone(); 3];
        assert_eq!(detection_similarity(&three, &reference()).0, 1.0);

        let swapped = vec![
            det("A", 10.0, 10.0, 50.0, 50.0),
            det("C", 60.0, 10.0, 100.0, 50.0),
        ];
        let (sim, reason) = detection_similarity(&swapped, &reference());
        assert_eq!(sim, 0.5);
        assert_eq!(reason, "class mismatch");
    }

    #[test]
    fn test_classification_similarity() {
        assert_eq!(classification_similarity(&[cls("ok")], &[cls("ok")]).0, 0.9);
        assert_eq!(classification_similarity(&[cls("bad")], &[cls("ok")]).0, 0.3);
        assert_eq!(classification_similarity(&[], &[cls("ok")]).0, 0.0);
    }

    #[test]
    fn test_missing_reference_verdict() {
        let manager = ResultManager::new(5);
        let v = manager.evaluate_detections(&reference(), 0.8, "Result 3");
        assert_eq!(v.status, Status::Ng);
        assert_eq!(v.similarity, 0.0);
        assert_eq!(v.reason, NO_REFERENCE_REASON);
        assert!(matches!(
            manager.reference_detections(),
            Err(VisionError::ReferenceMissing)
        ));
    }

    #[test]
    fn test_reference_cleared_with_tool() {
        let manager = ResultManager::new(5);
        manager.set_reference_detections(reference(), Some(2));
        assert!(!manager.clear_reference_for_tool(7));
        assert!(manager.has_reference());
        assert!(manager.clear_reference_for_tool(2));
        assert!(!manager.has_reference());
    }

    #[test]
    fn test_history_pane_mapping() {
        let manager = ResultManager::new(3);
        for status in [Status::Ng, Status::Ok, Status::Ng, Status::Ok] {
            manager.record(Verdict {
                status,
                ..Default::default()
            });
        }
        assert_eq!(manager.history_len(), 3);
        assert_eq!(manager.pane_status(1), Some(Status::Ok));
        assert_eq!(manager.pane_status(2), Some(Status::Ng));
        assert_eq!(manager.pane_status(3), Some(Status::Ok));
        assert_eq!(manager.pane_status(4), None);
    }

    #[test]
    fn test_threshold_bounds() {
        assert!(validate_threshold(0.0).is_ok());
        assert!(validate_threshold(1.2).is_err());
    }
}
