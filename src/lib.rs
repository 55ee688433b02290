#![deny(clippy::expect_used, clippy::unwrap_used)]

//! The root of the process timer scheduling library.
//! 流程定时器调度库的根。
//!
//! A [`TimerManager`] registers interval, cron and start timers on behalf of a
//! process runtime, hands them to a [`SchedulerBackend`], and either signals
//! the owning process instance or starts a new one whenever they fire.
//!
//! [`TimerManager`] 代表流程运行时注册周期、cron 与启动定时器，把它们交给
//! [`SchedulerBackend`]，在触发时向所属流程实例投递事件或启动新实例。

pub mod clock;
pub mod config;
pub mod cron;
pub mod error;
pub mod job;
pub mod manager;
pub mod record;
pub mod runtime;
pub mod scheduler;
pub mod trigger;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, Timestamp};
pub use config::{Config, SchedulerConfig, TimerConfig};
pub use error::{Error, Result};
pub use manager::TimerManager;
pub use record::{ProcessInstanceId, SessionId, TimerId, TimerRecord, UNLIMITED_REPEATS};
pub use runtime::{OperationGuard, OperationLock, ProcessRuntime, RuntimeError, StartParameters, in_operation};
pub use scheduler::{SchedulerBackend, SchedulerHandle, start_scheduler, start_scheduler_with_supervisor};
