//! 周期触发器
//! Interval trigger

use super::Trigger;
use crate::clock::Timestamp;
use std::time::Duration;

/// 周期触发器
/// Interval trigger
///
/// 首次触发在 `activated + delay`（或显式的开始时间），之后每次在上次触发
/// 加上 `period` 时触发。剩余次数为正时每次触发减一，减到零即耗尽；`-1` 表示
/// 不限次数。`period` 为零表示只触发一次。
///
/// Fires first at `activated + delay` (or the explicit start time), then at
/// `last fire + period`. A positive remaining count is decremented on every
/// fire and the trigger is exhausted at zero; `-1` is unlimited. A zero
/// `period` fires once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalTrigger {
    first_fire: Timestamp,
    end_time: Option<Timestamp>,
    period: Duration,
    remaining: i32,
    last_fired: Option<Timestamp>,
}

impl IntervalTrigger {
    pub fn new(activated: Timestamp, delay: Duration, period: Duration, repeat_limit: i32) -> Self {
        Self {
            first_fire: activated + delay,
            end_time: None,
            period,
            remaining: repeat_limit,
            last_fired: None,
        }
    }

    /// 显式开始时间，覆盖 `activated + delay`
    /// Explicit start time, overrides `activated + delay`
    pub fn with_start_time(mut self, start_time: Option<Timestamp>) -> Self {
        if let Some(start_time) = start_time {
            self.first_fire = start_time;
        }
        self
    }

    pub fn with_end_time(mut self, end_time: Option<Timestamp>) -> Self {
        self.end_time = end_time;
        self
    }

    /// 从持久化状态恢复上次触发时间
    /// Restore the last fire time from persisted state
    pub fn with_last_fired(mut self, last_fired: Option<Timestamp>) -> Self {
        self.last_fired = last_fired;
        self
    }

    pub fn remaining(&self) -> i32 {
        self.remaining
    }
}

impl Trigger for IntervalTrigger {
    fn next_fire_time(&self, _now: Timestamp) -> Option<Timestamp> {
        if self.remaining == 0 {
            return None;
        }
        let candidate = match self.last_fired {
            None => self.first_fire,
            Some(_) if self.period.is_zero() => return None,
            Some(last) => last + self.period,
        };
        match self.end_time {
            Some(end) if candidate > end => None,
            _ => Some(candidate),
        }
    }

    fn triggered(&mut self, fired_at: Timestamp) {
        self.last_fired = Some(fired_at);
        if self.remaining > 0 {
            self.remaining -= 1;
        }
    }
}
