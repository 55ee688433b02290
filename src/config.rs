//! 定义了定时器子系统的可配置参数。
//! Defines configurable parameters for the timer subsystem.

use std::time::Duration;

/// 默认的超期延迟
/// Default overdue delay
pub const DEFAULT_OVERDUE_DELAY: Duration = Duration::from_millis(2000);

/// 默认的 cron 种子偏移
/// Default cron seed offset
pub const DEFAULT_CRON_SEED_DELAY: Duration = Duration::from_millis(1000);

/// 定时器触发时投递给流程实例的事件名
/// Event name delivered to a process instance when its timer fires
pub const TIMER_TRIGGERED_EVENT: &str = "timerTriggered";

/// A structure containing all configurable parameters of the subsystem.
///
/// 包含子系统所有可配置参数的结构体。
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Timer manager parameters.
    /// 定时器管理器参数。
    pub timers: TimerConfig,

    /// In-memory scheduler backend parameters.
    /// 内存调度后端参数。
    pub scheduler: SchedulerConfig,
}

/// Timer manager parameters.
///
/// 定时器管理器参数。
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Delay substituted for a fire time that is already in the past when a
    /// timer is recovered. Gives session and process initialization time to
    /// finish before the callback runs.
    ///
    /// 恢复定时器时，若计算出的触发时间已过去，则以当前时间加上此延迟代替。
    /// 这样回调运行前会话和流程的初始化可以先完成。
    pub overdue_delay: Duration,
    /// Offset added to "now" before searching the next cron occurrence, so a
    /// cron timer never fires at the instant it is registered.
    /// 搜索下一次 cron 触发前加到当前时间上的偏移，避免注册瞬间立即触发。
    pub cron_seed_delay: Duration,
    /// Name of the event signalled into the owning process instance.
    /// 投递到所属流程实例的事件名。
    pub timer_triggered_event: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            overdue_delay: DEFAULT_OVERDUE_DELAY,
            cron_seed_delay: DEFAULT_CRON_SEED_DELAY,
            timer_triggered_event: TIMER_TRIGGERED_EVENT.to_string(),
        }
    }
}

/// In-memory scheduler backend parameters.
///
/// 内存调度后端参数。
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Capacity of the scheduler task's command channel.
    /// 调度任务命令通道的容量。
    pub command_buffer_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 1024,
        }
    }
}
