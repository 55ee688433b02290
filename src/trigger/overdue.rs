//! 超期触发器
//! Overdue trigger
//!
//! 长时间休眠的流程被重新加载时，其定时器的下一次触发时间可能早已过去。
//! 该包装器把过去的触发时间替换为"当前时间 + 固定延迟"，避免一连串的立即触发。
//!
//! When a long-dormant process is reloaded, its timers' next fire times may lie
//! in the past. This wrapper replaces a past fire time with "now + a fixed
//! delay" so reloading does not cause a storm of immediate fires.

use super::Trigger;
use crate::clock::{SharedClock, Timestamp};
use std::time::Duration;

/// 超期触发器
/// Overdue trigger
#[derive(Debug)]
pub struct OverdueTrigger<T> {
    inner: T,
    clock: SharedClock,
    overdue_delay: Duration,
}

impl<T: Trigger> OverdueTrigger<T> {
    /// `clock` 是运行时的时钟，而非调度后端的时钟
    /// `clock` is the runtime's clock, not the backend's
    pub fn new(inner: T, clock: SharedClock, overdue_delay: Duration) -> Self {
        Self {
            inner,
            clock,
            overdue_delay,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: Trigger> Trigger for OverdueTrigger<T> {
    fn next_fire_time(&self, now: Timestamp) -> Option<Timestamp> {
        let next = self.inner.next_fire_time(now)?;
        let current = self.clock.now();
        if next < current {
            Some(current + self.overdue_delay)
        } else {
            Some(next)
        }
    }

    fn triggered(&mut self, fired_at: Timestamp) {
        self.inner.triggered(fired_at);
    }
}
