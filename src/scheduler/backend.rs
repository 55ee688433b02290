//! 调度后端契约
//! Scheduler backend contract

use crate::clock::Timestamp;
use crate::record::{ProcessInstanceId, TimerId};
use crate::runtime::RuntimeError;
use crate::trigger::BoxedTrigger;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::commands::SchedulerError;

/// 调度后端返回的不透明句柄
/// Opaque handle returned by a scheduler backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(u64);

impl JobHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// 一次触发的上下文
/// Context of a single fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobExecution {
    /// 被触发作业的句柄
    /// Handle of the fired job
    pub handle: JobHandle,
    /// 触发器给出的计划触发时间
    /// Fire time planned by the trigger
    pub scheduled_at: Timestamp,
    /// 实际触发时间
    /// Actual fire time
    pub fired_at: Timestamp,
    /// 推进触发器后的下一次触发时间，`None` 表示这是最后一次
    /// Next fire time after advancing the trigger, `None` if this was the last
    pub next_fire_time: Option<Timestamp>,
}

/// 作业执行错误
/// Job execution errors
#[derive(Debug, Error)]
pub enum JobError {
    /// 信号作业找不到其所属的流程实例，说明注册表与实例存储不一致
    /// The signal job cannot find its owning process instance; the registry and
    /// the instance store disagree
    #[error("process instance {process_instance_id} owning timer {timer_id} not found")]
    ProcessInstanceNotFound {
        timer_id: TimerId,
        process_instance_id: ProcessInstanceId,
    },

    /// 向流程实例投递事件失败
    /// Delivering the event to the process instance failed
    #[error("failed to signal timer {timer_id}: {source}")]
    Signal {
        timer_id: TimerId,
        #[source]
        source: RuntimeError,
    },

    /// 作业在执行中 panic
    /// The job panicked while executing
    #[error("job panicked: {0}")]
    Panicked(String),
}

/// 上报给调度后端监督者的作业失败
/// Job failure reported to whoever supervises the scheduler backend
#[derive(Debug)]
pub struct JobFailure {
    pub handle: JobHandle,
    pub error: JobError,
}

/// 可被调度后端触发的作业
/// A job the scheduler backend can fire
#[async_trait]
pub trait Job: Send + Sync + fmt::Debug + 'static {
    /// 执行一次触发；返回错误会终止该作业的后续触发
    /// Run one fire; an error stops further fires of this job
    async fn execute(&self, execution: JobExecution) -> Result<(), JobError>;
}

/// 共享的作业引用
/// Shared job reference
pub type SharedJob = Arc<dyn Job>;

/// 调度后端
/// Scheduler backend
///
/// 后端在自己的执行上下文中按触发器调用作业。取消只阻止未来的触发，
/// 已经开始执行的触发会运行完成。
///
/// The backend invokes jobs on its own execution context according to their
/// triggers. Cancellation only prevents future fires; a fire already running
/// completes.
#[async_trait]
pub trait SchedulerBackend: Send + Sync + 'static {
    /// 按触发器调度作业
    /// Schedule a job against a trigger
    async fn schedule(&self, job: SharedJob, trigger: BoxedTrigger) -> Result<JobHandle, SchedulerError>;

    /// 取消作业；句柄未知时返回 `false`
    /// Cancel a job; `false` for an unknown handle
    async fn cancel(&self, handle: JobHandle) -> Result<bool, SchedulerError>;

    /// 取消所有作业并关闭后端
    /// Cancel every job and shut the backend down
    async fn shutdown(&self) -> Result<(), SchedulerError>;
}
