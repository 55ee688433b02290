//! Cron 触发器
//! Cron trigger

use super::Trigger;
use crate::clock::Timestamp;
use crate::cron::CronExpression;
use std::time::Duration;

/// Cron 触发器，隐式不限次数重复
/// Cron trigger, implicitly unlimited
///
/// 首次触发从 `now + seed_delay` 开始搜索，因此注册瞬间不会立即触发。
/// 触发过之后从上一次触发后一秒开始搜索，作业耗时不会跳过下一个匹配时刻。
/// The first occurrence is searched from `now + seed_delay`, so registration
/// never fires immediately. After a fire the search starts one second past
/// the previous fire, so a slow job never skips the next matching second.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: CronExpression,
    seed_delay: Duration,
    start_time: Option<Timestamp>,
    end_time: Option<Timestamp>,
    last_fired: Option<Timestamp>,
}

impl CronTrigger {
    pub fn new(expression: CronExpression, seed_delay: Duration) -> Self {
        Self {
            expression,
            seed_delay,
            start_time: None,
            end_time: None,
            last_fired: None,
        }
    }

    pub fn with_start_time(mut self, start_time: Option<Timestamp>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_end_time(mut self, end_time: Option<Timestamp>) -> Self {
        self.end_time = end_time;
        self
    }

    pub fn with_last_fired(mut self, last_fired: Option<Timestamp>) -> Self {
        self.last_fired = last_fired;
        self
    }

    pub fn expression(&self) -> &CronExpression {
        &self.expression
    }
}

impl Trigger for CronTrigger {
    fn next_fire_time(&self, now: Timestamp) -> Option<Timestamp> {
        let mut seed = match self.last_fired {
            // 同一秒内不重复触发
            // never fire twice within the same second
            Some(last) => now.max(last + Duration::from_secs(1)),
            None => now + self.seed_delay,
        };
        if let Some(start) = self.start_time {
            seed = seed.max(start);
        }
        let next = self.expression.next_after(seed)?;
        match self.end_time {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }

    fn triggered(&mut self, fired_at: Timestamp) {
        self.last_fired = Some(fired_at);
    }
}
