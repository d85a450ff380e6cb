// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 单拍保护: 同一时刻最多一个单拍在进行, 两次单拍之间至少间隔冷却时间

use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Result, VisionError};

/// 单拍锁 + 冷却
pub struct SingleShotGuard {
    in_flight: Mutex<()>,
    last_shot: Mutex<Option<Instant>>,
    cooldown: Duration,
}

/// 持有期间其它单拍直接被拒绝
pub struct ShotPermit<'a> {
    _lock: MutexGuard<'a, ()>,
}

impl SingleShotGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            in_flight: Mutex::new(()),
            last_shot: Mutex::new(None),
            cooldown,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn try_acquire(&self) -> Result<ShotPermit<'_>> {
        self.try_acquire_at(Instant::now())
    }

    /// 失败返回 Busy / Cooldown; 成功时立即记录本次单拍时间
    pub fn try_acquire_at(&self, now: Instant) -> Result<ShotPermit<'_>> {
        let lock = self.in_flight.try_lock().ok_or(VisionError::Busy)?;

        let mut last = self.last_shot.lock();
        if let Some(prev) = *last {
            let elapsed = now.saturating_duration_since(prev);
            if elapsed < self.cooldown {
                let remaining = self.cooldown - elapsed;
                return Err(VisionError::Cooldown {
                    remaining_ms: remaining.as_millis() as u64,
                });
            }
        }
        *last = Some(now);

        Ok(ShotPermit { _lock: lock })
    }

    pub fn last_shot(&self) -> Option<Instant> {
        *self.last_shot.lock()
    }

    /// 清除冷却 (相机重新配置后)
    pub fn reset(&self) {
        *self.last_shot.lock() = None;
    }
}
