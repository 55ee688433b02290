//! 定时器记录
//! Timer records
//!
//! [`TimerRecord`] 是一个已调度定时器的持久化描述。标识由管理器在注册时
//! 分配，之后不可更改；调度后端返回的句柄只存在于内存中，从不序列化。
//!
//! A [`TimerRecord`] is the durable description of one scheduled timer. Its id
//! is assigned by the manager at registration and never changes afterwards; the
//! backend handle lives only in memory and is never serialized.

use crate::clock::Timestamp;
use crate::cron::CronExpression;
use crate::error::{Error, Result};
use crate::scheduler::JobHandle;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 定时器标识，在一个运行时实例内单调递增
/// Timer identifier, monotonically increasing within one runtime instance
pub type TimerId = u64;

/// 流程实例标识
/// Process instance identifier
pub type ProcessInstanceId = u64;

/// 会话标识
/// Session identifier
pub type SessionId = u64;

/// 表示不限次数重复
/// Marks an unlimited repeat count
pub const UNLIMITED_REPEATS: i32 = -1;

/// 定时器记录
/// Timer record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    id: TimerId,
    /// 可选名称，仅用于诊断
    /// Optional name, diagnostics only
    #[serde(default)]
    pub name: Option<String>,
    /// 从激活到首次触发的延迟
    /// Delay from activation until the first fire
    #[serde(with = "duration_millis")]
    pub delay: Duration,
    /// 重复间隔，零表示不重复
    /// Repeat period, zero means no repeat
    #[serde(with = "duration_millis")]
    pub period: Duration,
    /// 剩余触发次数，`-1` 表示不限
    /// Remaining fire count, `-1` means unlimited
    pub repeat_limit: i32,
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// 绝对首次触发时间，覆盖 `activated + delay`
    /// Absolute first fire time, overrides `activated + delay`
    #[serde(default)]
    pub start_at: Option<Timestamp>,
    /// 此时间之后不再触发
    /// No fires after this time
    #[serde(default)]
    pub end_at: Option<Timestamp>,
    #[serde(default)]
    pub activated: Option<Timestamp>,
    #[serde(default)]
    pub last_triggered: Option<Timestamp>,
    /// 所属流程实例；启动定时器没有所属实例
    /// Owning process instance; start timers have none
    #[serde(default)]
    pub process_instance_id: Option<ProcessInstanceId>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(skip)]
    backend_handle: Option<JobHandle>,
    /// 本次注册的序号，重新调度或恢复后变化
    /// Sequence of this registration; changes on reschedule or recovery
    #[serde(skip)]
    registration: u64,
}

impl TimerRecord {
    fn new(delay: Duration, period: Duration, repeat_limit: i32) -> Self {
        Self {
            id: 0,
            name: None,
            delay,
            period,
            repeat_limit,
            cron_expression: None,
            start_at: None,
            end_at: None,
            activated: None,
            last_triggered: None,
            process_instance_id: None,
            session_id: None,
            backend_handle: None,
            registration: 0,
        }
    }

    /// 只触发一次的定时器
    /// A timer that fires once
    pub fn one_shot(delay: Duration) -> Self {
        Self::new(delay, Duration::ZERO, UNLIMITED_REPEATS)
    }

    /// 周期定时器，`repeat_limit` 为总触发次数（`-1` 不限）
    /// Interval timer, `repeat_limit` is the total fire count (`-1` for unlimited)
    pub fn interval(delay: Duration, period: Duration, repeat_limit: i32) -> Self {
        Self::new(delay, period, repeat_limit)
    }

    /// Cron 定时器，不限次数重复
    /// Cron timer, repeats without limit
    pub fn cron(expression: impl Into<String>) -> Self {
        let mut record = Self::new(Duration::ZERO, Duration::from_millis(1), UNLIMITED_REPEATS);
        record.cron_expression = Some(expression.into());
        record
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_start_at(mut self, start_at: Timestamp) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn with_end_at(mut self, end_at: Timestamp) -> Self {
        self.end_at = Some(end_at);
        self
    }

    /// 设置标识，仅供从持久化状态重建记录时使用
    /// Sets the id; only for records rebuilt from persisted state
    ///
    /// 注册时会忽略这里的值并分配新的标识。
    /// Registration ignores this value and assigns a fresh id.
    pub fn with_id(mut self, id: TimerId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn backend_handle(&self) -> Option<JobHandle> {
        self.backend_handle
    }

    /// 启动定时器不属于任何流程实例
    /// Start timers belong to no process instance
    pub fn is_start_timer(&self) -> bool {
        self.process_instance_id.is_none()
    }

    /// 周期为零且没有 cron 的记录在下一次触发后退役
    /// Records with a zero period retire after their next fire
    pub fn is_retirable(&self) -> bool {
        self.period.is_zero()
    }

    /// 校验触发参数，在任何调度发生之前拒绝冲突的定义
    /// Validates trigger parameters, rejecting conflicting definitions before scheduling
    pub fn validate(&self) -> Result<()> {
        if self.repeat_limit < UNLIMITED_REPEATS {
            return Err(Error::InvalidTimer("repeat limit must be -1 or non-negative"));
        }
        if let (Some(start), Some(end)) = (self.start_at, self.end_at) {
            if end < start {
                return Err(Error::InvalidTimer("end time precedes start time"));
            }
        }
        if let Some(expression) = &self.cron_expression {
            if !self.delay.is_zero() {
                return Err(Error::InvalidTimer("cron timers cannot carry a delay"));
            }
            if self.period > Duration::from_millis(1) {
                return Err(Error::InvalidTimer("cron timers cannot carry an interval period"));
            }
            CronExpression::parse(expression)?;
        }
        Ok(())
    }

    /// Cron 记录的周期固定为 1，以标记其可重复
    /// Cron records get their period forced to 1 to mark them repeatable
    pub(crate) fn normalize(&mut self) {
        if self.cron_expression.is_some() {
            self.period = Duration::from_millis(1);
        }
    }

    pub(crate) fn assign_id(&mut self, id: TimerId) {
        self.id = id;
    }

    pub(crate) fn attach_handle(&mut self, handle: JobHandle) {
        self.backend_handle = Some(handle);
    }

    pub(crate) fn take_handle(&mut self) -> Option<JobHandle> {
        self.backend_handle.take()
    }

    pub(crate) fn registration(&self) -> u64 {
        self.registration
    }

    pub(crate) fn begin_registration(&mut self, registration: u64) {
        self.registration = registration;
        self.backend_handle = None;
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
