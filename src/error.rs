//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use crate::cron::CronParseError;
use crate::scheduler::SchedulerError;
use thiserror::Error;

/// The primary error type for the timer subsystem.
/// 定时器子系统的主要错误类型。
#[derive(Debug, Error)]
pub enum Error {
    /// The timer definition carries conflicting or out-of-range trigger parameters.
    /// 定时器定义包含冲突或越界的触发参数。
    #[error("invalid timer definition: {0}")]
    InvalidTimer(&'static str),

    /// The cron expression could not be parsed.
    /// 无法解析 cron 表达式。
    #[error("invalid cron expression: {0}")]
    Cron(#[from] CronParseError),

    /// The scheduler backend rejected the request or has been shut down.
    /// 调度后端拒绝了请求或已关闭。
    #[error("scheduler backend error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;
