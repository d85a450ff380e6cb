// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 每个工具最后输出的图像 + 原始帧 + 最后一帧有效输出
// 执行线程写, 显示侧读 (读时 clone 出 Frame, 不持锁回调)

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::frame::Frame;
use crate::tools::ToolKind;

#[derive(Default)]
struct StoreInner {
    raw: Option<Frame>,
    last_output: Option<Frame>,
    tools: HashMap<u32, (ToolKind, Frame)>,
    /// 每种工具最近一次产出图像的工具 ID
    latest_by_kind: HashMap<ToolKind, u32>,
}

#[derive(Default)]
pub struct FrameStore {
    inner: RwLock<StoreInner>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_raw(&self, frame: &Frame) {
        self.inner.write().raw = Some(frame.clone());
    }

    pub fn record_tool(&self, tool_id: u32, kind: ToolKind, frame: &Frame) {
        let mut inner = self.inner.write();
        inner.tools.insert(tool_id, (kind, frame.clone()));
        inner.latest_by_kind.insert(kind, tool_id);
    }

    pub fn record_output(&self, frame: &Frame) {
        self.inner.write().last_output = Some(frame.clone());
    }

    pub fn raw_frame(&self) -> Option<Frame> {
        self.inner.read().raw.clone()
    }

    pub fn last_output(&self) -> Option<Frame> {
        self.inner.read().last_output.clone()
    }

    pub fn tool_output(&self, tool_id: u32) -> Option<Frame> {
        self.inner.read().tools.get(&tool_id).map(|(_, f)| f.clone())
    }

    pub fn latest_tool_of(&self, kind: ToolKind) -> Option<u32> {
        self.inner.read().latest_by_kind.get(&kind).copied()
    }

    pub fn tool_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inner.read().tools.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 工具被删除后丢弃它的输出
    pub fn forget_tool(&self, tool_id: u32) {
        let mut inner = self.inner.write();
        if let Some((kind, _)) = inner.tools.remove(&tool_id) {
            if inner.latest_by_kind.get(&kind) == Some(&tool_id) {
                inner.latest_by_kind.remove(&kind);
            }
        }
    }

    pub fn clear(&self) {
        *self.inner.write() = StoreInner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_forget_tool() {
        let store = FrameStore::new();
        let f = Frame::black(4, 4).stamped(1, Instant::now());
        store.record_tool(2, ToolKind::Detect, &f);
        store.record_tool(5, ToolKind::Detect, &f);
        assert_eq!(store.latest_tool_of(ToolKind::Detect), Some(5));
        assert_eq!(store.tool_ids(), vec![2, 5]);

        store.forget_tool(5);
        assert!(store.tool_output(5).is_none());
        assert_eq!(store.latest_tool_of(ToolKind::Detect), None);
        assert!(store.tool_output(2).is_some());
    }
}
