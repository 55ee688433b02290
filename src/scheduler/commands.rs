//! 调度任务命令定义
//! Scheduler task command definitions
//!
//! 本模块包含调度任务的命令枚举、错误类型和统计信息，定义了客户端与
//! 调度任务之间的通信协议。
//!
//! This module contains the command enum, error type and statistics of the
//! scheduler task, defining the protocol between clients and the task.

use crate::trigger::BoxedTrigger;
use tokio::sync::oneshot;

use super::backend::{JobError, JobHandle, SharedJob};

/// 调度任务命令
/// Scheduler task commands
#[derive(Debug)]
pub enum SchedulerCommand {
    /// 调度作业
    /// Schedule a job
    Schedule {
        job: SharedJob,
        trigger: BoxedTrigger,
        response_tx: oneshot::Sender<JobHandle>,
    },
    /// 取消作业
    /// Cancel a job
    Cancel {
        handle: JobHandle,
        response_tx: oneshot::Sender<bool>,
    },
    /// 驱动任务结束（触发器耗尽或作业失败）
    /// A driver finished (trigger exhausted or job failed)
    Finished {
        handle: JobHandle,
        failure: Option<JobError>,
    },
    /// 获取统计信息
    /// Get statistics
    GetStats {
        response_tx: oneshot::Sender<SchedulerStats>,
    },
    /// 关闭调度任务
    /// Shutdown scheduler task
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// 调度错误类型
/// Scheduler error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler task has been shutdown")]
    TaskShutdown,
}

/// 调度任务统计信息
/// Scheduler task statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// 当前活跃作业数
    /// Number of active jobs
    pub active_jobs: usize,
    /// 累计调度的作业数
    /// Total scheduled jobs
    pub scheduled_jobs: u64,
    /// 累计取消的作业数
    /// Total cancelled jobs
    pub cancelled_jobs: u64,
    /// 触发器耗尽而正常结束的作业数
    /// Jobs that ended because their trigger was exhausted
    pub completed_jobs: u64,
    /// 因错误或 panic 终止的作业数
    /// Jobs stopped by an error or panic
    pub failed_jobs: u64,
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SchedulerStats {{ active: {}, scheduled: {}, cancelled: {}, completed: {}, failed: {} }}",
            self.active_jobs,
            self.scheduled_jobs,
            self.cancelled_jobs,
            self.completed_jobs,
            self.failed_jobs
        )
    }
}
