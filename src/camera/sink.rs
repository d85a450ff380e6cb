// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 帧订阅: 生产线程对每个订阅者调用 on_frame, 订阅者不得阻塞

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::frame::Frame;

pub type SinkId = u64;

/// 帧订阅者
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &Frame);
}

/// 容量为 1 的槽位: 满了就丢掉旧帧换新帧
///
/// 执行器处理慢时只会看到最新一帧, 不会积压
pub struct FrameSlot {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    replaced: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            tx,
            rx,
            replaced: AtomicU64::new(0),
        }
    }

    /// 消费端
    pub fn receiver(&self) -> Receiver<Frame> {
        self.rx.clone()
    }

    pub fn take_latest(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// 被新帧顶掉的旧帧数量
    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for FrameSlot {
    fn on_frame(&self, frame: &Frame) {
        match self.tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                if self.rx.try_recv().is_ok() {
                    self.replaced.fetch_add(1, Ordering::Relaxed);
                }
                let _ = self.tx.try_send(frame);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// 保存所有帧 (测试与录制用)
#[derive(Default)]
pub struct FrameCollector {
    frames: Mutex<Vec<Frame>>,
}

impl FrameCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.frames.lock().last().map(|f| f.sequence())
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

impl FrameSink for FrameCollector {
    fn on_frame(&self, frame: &Frame) {
        self.frames.lock().push(frame.clone());
    }
}

/// 闭包订阅者
pub struct FnSink<F>(pub F);

impl<F> FrameSink for FnSink<F>
where
    F: Fn(&Frame) + Send + Sync,
{
    fn on_frame(&self, frame: &Frame) {
        (self.0)(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn frame(seq: u64) -> Frame {
        Frame::black(2, 2).stamped(seq, Instant::now())
    }

    #[test]
    fn test_slot_keeps_newest() {
        let slot = FrameSlot::new();
        slot.on_frame(&frame(1));
        slot.on_frame(&frame(2));
        slot.on_frame(&frame(3));

        assert_eq!(slot.take_latest().map(|f| f.sequence()), Some(3));
        assert!(slot.take_latest().is_none());
        assert_eq!(slot.replaced(), 2);
    }

    #[test]
    fn test_collector_and_fn_sink() {
        let collector = FrameCollector::new();
        collector.on_frame(&frame(7));
        assert_eq!(collector.last_sequence(), Some(7));

        let hits = AtomicU64::new(0);
        let sink = FnSink(|_f: &Frame| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
        sink.on_frame(&frame(1));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
