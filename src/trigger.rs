//! 触发器模块
//! Trigger Module
//!
//! 触发器回答"在当前时间之后下一次何时触发"。周期触发器和 cron 触发器是
//! 两种具体形式，超期触发器以组合的方式包装另一个触发器。
//!
//! A trigger answers "when is the next fire after now". Interval and cron
//! triggers are the two concrete forms; the overdue trigger wraps another
//! trigger by composition.

pub mod cron;
pub mod interval;
pub mod overdue;


pub use self::cron::CronTrigger;
pub use interval::IntervalTrigger;
pub use overdue::OverdueTrigger;

use crate::clock::Timestamp;
use crate::config::TimerConfig;
use crate::cron::CronExpression;
use crate::error::Result;
use crate::record::TimerRecord;
use std::fmt;

/// 触发器 trait
/// Trigger trait
pub trait Trigger: Send + Sync + fmt::Debug + 'static {
    /// 下一次触发时间；没有后续触发时返回 `None`
    /// Next fire time, `None` once the trigger is exhausted
    fn next_fire_time(&self, now: Timestamp) -> Option<Timestamp>;

    /// 在一次触发之后推进触发器状态
    /// Advance the trigger past one fire
    fn triggered(&mut self, fired_at: Timestamp);
}

/// 装箱的触发器，交给调度后端持有
/// Boxed trigger, owned by the scheduler backend
pub type BoxedTrigger = Box<dyn Trigger>;

impl<T: Trigger + ?Sized> Trigger for Box<T> {
    fn next_fire_time(&self, now: Timestamp) -> Option<Timestamp> {
        (**self).next_fire_time(now)
    }

    fn triggered(&mut self, fired_at: Timestamp) {
        (**self).triggered(fired_at)
    }
}

/// 根据记录字段构建触发器：有 cron 表达式时走 cron 分支，否则走周期分支
/// Build the trigger for a record: cron branch when an expression is set, interval otherwise
///
/// `now` 只在记录尚未激活时作为激活时间使用。
/// `now` only stands in for the activation time of a record that has none yet.
pub fn for_record(record: &TimerRecord, now: Timestamp, config: &TimerConfig) -> Result<BoxedTrigger> {
    match record.cron_expression.as_deref() {
        Some(expression) => {
            let trigger = CronTrigger::new(CronExpression::parse(expression)?, config.cron_seed_delay)
                .with_start_time(record.start_at)
                .with_end_time(record.end_at)
                .with_last_fired(record.last_triggered);
            Ok(Box::new(trigger))
        }
        None => {
            let activated = record.activated.unwrap_or(now);
            let trigger = IntervalTrigger::new(activated, record.delay, record.period, record.repeat_limit)
                .with_start_time(record.start_at)
                .with_end_time(record.end_at)
                .with_last_fired(record.last_triggered);
            Ok(Box::new(trigger))
        }
    }
}
