//! 调度后端模块
//! Scheduler Backend Module
//!
//! 定义了调度后端的契约（[`SchedulerBackend`]、[`Job`]），并提供一个基于
//! tokio 的内存实现：一个全局调度任务通过消息传递管理所有作业，每个作业
//! 在自己的驱动任务中等待、触发并重新调度。
//!
//! Defines the scheduler backend contract ([`SchedulerBackend`], [`Job`]) and
//! ships an in-memory tokio implementation: one scheduler task owns the job
//! table and talks over message passing, while each job waits, fires and
//! reschedules inside its own driver task.

pub mod backend;
pub mod commands;
pub mod handle;
pub mod task;


pub use backend::{Job, JobError, JobExecution, JobFailure, JobHandle, SchedulerBackend, SharedJob};
pub use commands::{SchedulerCommand, SchedulerError, SchedulerStats};
pub use handle::{SchedulerHandle, start_scheduler, start_scheduler_with_supervisor};
pub use task::SchedulerTask;
