// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 回看环 (ReviewRing)
//!
//! 最近 N 帧及其判定, 成对原子写入, 最新在末尾。
//! 窗格 i (1 = 最新) 读取 ring[len - i]。
//! ReviewPublisher 在后台线程按最小间隔合并通知界面重绘。

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::frame::Frame;
use crate::result::{Status, Verdict};

/// 默认容量
pub const DEFAULT_CAPACITY: usize = 5;

/// 默认最小通知间隔
pub const DEFAULT_NOTIFY_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct ReviewEntry {
    pub frame: Frame,
    pub verdict: Verdict,
}

/// 回看环快照 (最旧在前)
#[derive(Debug, Clone, Default)]
pub struct ReviewSnapshot {
    pub entries: Vec<ReviewEntry>,
    pub generation: u64,
}

impl ReviewSnapshot {
    /// 窗格 i (1 = 最新)
    pub fn pane(&self, pane: usize) -> Option<&ReviewEntry> {
        if pane == 0 || pane > self.entries.len() {
            return None;
        }
        self.entries.get(self.entries.len() - pane)
    }

    pub fn pane_statuses(&self) -> Vec<Status> {
        self.entries.iter().rev().map(|e| e.verdict.status).collect()
    }
}

struct RingInner {
    entries: VecDeque<ReviewEntry>,
    generation: u64,
}

pub struct ReviewRing {
    inner: Mutex<RingInner>,
    capacity: usize,
}

impl ReviewRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(RingInner {
                entries: VecDeque::with_capacity(capacity + 1),
                generation: 0,
            }),
            capacity,
        }
    }

    /// 追加 (帧, 判定) 对, 超出容量丢弃最旧的; 返回新的代数
    pub fn append(&self, frame: Frame, verdict: Verdict) -> u64 {
        let mut inner = self.inner.lock();
        inner.entries.push_back(ReviewEntry { frame, verdict });
        while inner.entries.len() > self.capacity {
            inner.entries.pop_front();
        }
        inner.generation += 1;
        inner.generation
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// 窗格 i (1 = 最新)
    pub fn pane(&self, pane: usize) -> Option<ReviewEntry> {
        let inner = self.inner.lock();
        let len = inner.entries.len();
        if pane == 0 || pane > len {
            return None;
        }
        inner.entries.get(len - pane).cloned()
    }

    pub fn snapshot(&self) -> ReviewSnapshot {
        let inner = self.inner.lock();
        ReviewSnapshot {
            entries: inner.entries.iter().cloned().collect(),
            generation: inner.generation,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.generation += 1;
    }
}

// ========== 节流通知 ==========

/// 回看面板 (界面侧实现)
pub trait ReviewListener: Send + Sync {
    fn on_review_update(&self, snapshot: &ReviewSnapshot);
}

/// 通知句柄, 可跨线程 clone
#[derive(Clone)]
pub struct ReviewNotifier {
    tx: Sender<()>,
}

impl ReviewNotifier {
    /// 标记有新内容; 已有未处理的通知时直接合并
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

/// 后台发布线程
pub struct ReviewPublisher {
    notifier: ReviewNotifier,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ReviewPublisher {
    pub fn spawn(
        ring: Arc<ReviewRing>,
        listener: Arc<dyn ReviewListener>,
        min_interval: Duration,
    ) -> Result<Self> {
        let (tx, notify_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("review-publisher".into())
            .spawn(move || publish_loop(ring, listener, notify_rx, stop_rx, min_interval))?;
        info!("🖼️ 回看发布线程启动 (间隔 {:?})", min_interval);
        Ok(Self {
            notifier: ReviewNotifier { tx },
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn notifier(&self) -> ReviewNotifier {
        self.notifier.clone()
    }

    pub fn notify(&self) {
        self.notifier.notify();
    }

    pub fn shutdown(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("❌ 回看发布线程 panic");
            }
        }
    }
}

impl Drop for ReviewPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn publish_loop(
    ring: Arc<ReviewRing>,
    listener: Arc<dyn ReviewListener>,
    notify_rx: Receiver<()>,
    stop_rx: Receiver<()>,
    min_interval: Duration,
) {
    let mut last_publish: Option<Instant> = None;
    let mut last_generation = 0u64;

    loop {
        select! {
            recv(notify_rx) -> msg => {
                if msg.is_err() {
                    break;
                }
            }
            recv(stop_rx) -> _ => break,
        }

        // 距上次发布不足间隔时等待, 期间到达的通知被合并
        if let Some(last) = last_publish {
            let since = last.elapsed();
            if since < min_interval {
                match stop_rx.recv_timeout(min_interval - since) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            }
        }
        while notify_rx.try_recv().is_ok() {}

        let snapshot = ring.snapshot();
        if snapshot.generation == last_generation {
            continue;
        }
        last_generation = snapshot.generation;
        listener.on_review_update(&snapshot);
        last_publish = Some(Instant::now());
    }
    debug!("🖼️ 回看发布线程退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn verdict(status: Status) -> Verdict {
        Verdict {
            status,
            ..Default::default()
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::black(2, 2).stamped(seq, Instant::now())
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = ReviewRing::new(3);
        for seq in 1..=5 {
            ring.append(frame(seq), verdict(Status::Ok));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pane(1).map(|e| e.frame.sequence()), Some(5));
        assert_eq!(ring.pane(3).map(|e| e.frame.sequence()), Some(3));
        assert!(ring.pane(4).is_none());
        assert!(ring.pane(0).is_none());
        assert_eq!(ring.generation(), 5);
    }

    #[test]
    fn test_snapshot_pane_statuses() {
        let ring = ReviewRing::new(5);
        for status in [Status::Ng, Status::Ok, Status::Ok] {
            ring.append(frame(0), verdict(status));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.pane_statuses(), vec![Status::Ok, Status::Ok, Status::Ng]);
        assert_eq!(snap.pane(3).map(|e| e.verdict.status), Some(Status::Ng));
    }

    struct Counter(AtomicUsize);

    impl ReviewListener for Counter {
        fn on_review_update(&self, _snapshot: &ReviewSnapshot) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_publisher_coalesces_bursts() {
        let ring = Arc::new(ReviewRing::new(5));
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut publisher =
            ReviewPublisher::spawn(ring.clone(), counter.clone(), Duration::from_millis(300))
                .unwrap();

        for seq in 0..20 {
            ring.append(frame(seq), verdict(Status::Ok));
            publisher.notify();
        }
        thread::sleep(Duration::from_millis(450));
        publisher.shutdown();

        let calls = counter.0.load(Ordering::SeqCst);
        assert!((1..=2).contains(&calls), "calls = {}", calls);
    }
}
