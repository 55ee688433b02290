//! 作业分发
//! Job dispatch
//!
//! 调度后端触发的作业只有两种形式：向所属流程实例投递事件的信号作业，
//! 以及启动新流程实例的启动作业。两者都在后端自己的任务上执行，通过
//! [`ManagerRef`] 回到管理器完成簿记。
//!
//! Jobs fired by the scheduler backend come in exactly two shapes: signal jobs
//! deliver an event into the owning process instance, start jobs start a new
//! process instance. Both run on the backend's own tasks and reach back into
//! the manager through a [`ManagerRef`] for bookkeeping.

use crate::manager::{ManagerRef, ManagerShared};
use crate::record::{ProcessInstanceId, TimerId};
use crate::runtime::{StartParameters, TIMER_START_TRIGGER};
use crate::scheduler::{Job, JobError, JobExecution};
use async_trait::async_trait;
use tracing::{debug, error, trace, warn};

/// 作业上下文
/// Job context
///
/// `registration` 标识作业所属的那一次注册。重新调度会沿用同一个标识，
/// 旧作业迟到的触发凭它被识别为过期并丢弃。
///
/// `registration` identifies the registration the job belongs to. Rescheduling
/// keeps the timer id, so a late fire of the old job is recognised as stale by
/// this sequence and dropped.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub timer_id: TimerId,
    registration: u64,
    manager: ManagerRef,
}

impl JobContext {
    pub(crate) fn new(timer_id: TimerId, registration: u64, manager: ManagerRef) -> Self {
        Self {
            timer_id,
            registration,
            manager,
        }
    }

    pub(crate) fn registration(&self) -> u64 {
        self.registration
    }
}

/// 定时器作业
/// Timer job
#[derive(Debug)]
pub enum TimerJob {
    /// 向已存在的流程实例投递定时器事件
    /// Deliver the timer event into an existing process instance
    Signal {
        context: JobContext,
        process_instance_id: ProcessInstanceId,
    },
    /// 启动流程定义的新实例
    /// Start a new instance of a process definition
    Start {
        context: JobContext,
        process_id: String,
        parameters: StartParameters,
    },
}

impl TimerJob {
    pub fn context(&self) -> &JobContext {
        match self {
            TimerJob::Signal { context, .. } | TimerJob::Start { context, .. } => context,
        }
    }
}

#[async_trait]
impl Job for TimerJob {
    async fn execute(&self, execution: JobExecution) -> Result<(), JobError> {
        let context = self.context();
        let Some(manager) = context.manager.upgrade() else {
            debug!(timer_id = context.timer_id, "Timer manager disposed, dropping fire");
            return Ok(());
        };
        match self {
            TimerJob::Signal {
                context,
                process_instance_id,
            } => {
                manager
                    .exclusive(signal(&manager, context, *process_instance_id, execution))
                    .await
            }
            TimerJob::Start {
                context,
                process_id,
                parameters,
            } => {
                manager
                    .exclusive(start(&manager, context, process_id, parameters, execution))
                    .await
            }
        }
    }
}

async fn signal(
    manager: &ManagerShared,
    context: &JobContext,
    process_instance_id: ProcessInstanceId,
    execution: JobExecution,
) -> Result<(), JobError> {
    let timer_id = context.timer_id;
    let registration = context.registration;
    let runtime = manager.runtime();

    if !manager.is_current(timer_id, registration) {
        // 与取消、退役或重新调度竞争而来的触发
        // a fire that lost the race against cancellation, retirement or rescheduling
        debug!(timer_id, "Timer no longer registered, dropping fire");
        return Ok(());
    }

    if !runtime.has_process_instance(process_instance_id) {
        error!(
            timer_id,
            process_instance_id, "Process instance owning timer not found"
        );
        manager.retire(timer_id, registration).await;
        return Err(JobError::ProcessInstanceNotFound {
            timer_id,
            process_instance_id,
        });
    }

    let Some(record) = manager.record_fired(timer_id, registration, execution.next_fire_time) else {
        return Ok(());
    };
    let retirable = record.is_retirable();
    trace!(timer_id, process_instance_id, fired_at = %execution.fired_at, "Signalling timer");

    if let Err(source) = runtime
        .signal_event(process_instance_id, manager.triggered_event(), record)
        .await
    {
        error!(timer_id, process_instance_id, error = %source, "Failed to signal timer");
        manager.retire(timer_id, registration).await;
        return Err(JobError::Signal { timer_id, source });
    }

    if retirable {
        manager.retire(timer_id, registration).await;
    }
    Ok(())
}

async fn start(
    manager: &ManagerShared,
    context: &JobContext,
    process_id: &str,
    parameters: &StartParameters,
    execution: JobExecution,
) -> Result<(), JobError> {
    let timer_id = context.timer_id;
    let registration = context.registration;
    let runtime = manager.runtime();

    if !manager.is_current(timer_id, registration) {
        debug!(timer_id, "Start timer no longer registered, dropping fire");
        return Ok(());
    }

    if !runtime.is_active() {
        debug!(timer_id, process_id, "Deployment inactive, retiring start timer");
        manager.retire(timer_id, registration).await;
        return Ok(());
    }

    let Some(record) = manager.record_fired(timer_id, registration, execution.next_fire_time) else {
        return Ok(());
    };

    // 启动失败只记录，共享的调度任务不能因此停下
    // start failures are only logged, the shared scheduler must keep going
    match runtime
        .start_process(process_id, parameters.clone(), TIMER_START_TRIGGER)
        .await
    {
        Ok(process_instance_id) => {
            debug!(timer_id, process_id, process_instance_id, "Timer started process instance");
        }
        Err(error) => {
            warn!(timer_id, process_id, %error, "Timer failed to start process instance");
        }
    }

    if record.is_retirable() {
        manager.retire(timer_id, registration).await;
    }
    Ok(())
}
