//! 调度任务核心实现
//! Scheduler task core implementation
//!
//! 本模块包含调度任务的核心逻辑：维护作业表、处理命令，并为每个作业启动
//! 一个驱动任务。驱动任务按触发器等待、推进触发器、在嵌套任务中执行作业，
//! 作业的 panic 因此不会波及调度任务本身。
//!
//! This module contains the core logic of the scheduler task: it keeps the job
//! table, processes commands and spawns one driver per job. A driver waits for
//! its trigger, advances it, and runs the job in a nested task so a panicking
//! job cannot take the scheduler task down with it.

use crate::clock::SharedClock;
use crate::trigger::BoxedTrigger;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use super::backend::{JobError, JobExecution, JobFailure, JobHandle, SharedJob};
use super::commands::{SchedulerCommand, SchedulerStats};

/// 作业表中的条目
/// Entry of the job table
struct ScheduledJob {
    /// 丢弃或发送都会让驱动任务在下次等待时停止
    /// Dropping or sending stops the driver at its next wait
    cancel_tx: oneshot::Sender<()>,
}

/// 调度任务
/// Scheduler task
pub struct SchedulerTask {
    /// 命令接收通道
    /// Command receiver channel
    command_rx: mpsc::Receiver<SchedulerCommand>,
    /// 命令发送通道（交给驱动任务用于回报结束）
    /// Command sender channel (handed to drivers to report completion)
    command_tx: mpsc::Sender<SchedulerCommand>,
    /// 后端自己的时钟
    /// The backend's own clock
    clock: SharedClock,
    /// 活跃作业表
    /// Active job table
    jobs: HashMap<JobHandle, ScheduledJob>,
    /// 下一个分配的句柄
    /// Next handle to allocate
    next_handle: u64,
    /// 统计信息
    /// Statistics
    stats: SchedulerStats,
    /// 作业失败的监督通道
    /// Supervisor channel for job failures
    failure_tx: Option<mpsc::UnboundedSender<JobFailure>>,
}

impl SchedulerTask {
    /// 创建新的调度任务
    /// Create new scheduler task
    pub fn new(
        clock: SharedClock,
        command_buffer_size: usize,
        failure_tx: Option<mpsc::UnboundedSender<JobFailure>>,
    ) -> (Self, mpsc::Sender<SchedulerCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer_size);
        let task = Self {
            command_rx,
            command_tx: command_tx.clone(),
            clock,
            jobs: HashMap::new(),
            next_handle: 0,
            stats: SchedulerStats::default(),
            failure_tx,
        };
        (task, command_tx)
    }

    /// 运行调度任务主循环
    /// Run scheduler task main loop
    pub async fn run(mut self) {
        info!("Scheduler task started");

        while let Some(command) = self.command_rx.recv().await {
            if !self.handle_command(command) {
                break;
            }
        }

        self.cancel_all();
        info!("Scheduler task shutdown completed");
    }

    /// 处理命令
    /// Handle command
    ///
    /// # Returns
    /// 返回false表示应该关闭任务
    /// Returns false if task should shutdown
    fn handle_command(&mut self, command: SchedulerCommand) -> bool {
        match command {
            SchedulerCommand::Schedule { job, trigger, response_tx } => {
                let handle = self.schedule(job, trigger);
                if response_tx.send(handle).is_err() {
                    // 调用方已放弃等待，作业不应继续存在
                    // the caller stopped waiting, the job must not linger
                    warn!(%handle, "Schedule response dropped, cancelling job");
                    self.cancel(handle);
                }
            }

            SchedulerCommand::Cancel { handle, response_tx } => {
                let cancelled = self.cancel(handle);
                if let Err(err) = response_tx.send(cancelled) {
                    warn!(error = ?err, "Failed to send cancel response");
                }
            }

            SchedulerCommand::Finished { handle, failure } => {
                self.finish(handle, failure);
            }

            SchedulerCommand::GetStats { response_tx } => {
                self.stats.active_jobs = self.jobs.len();
                if let Err(err) = response_tx.send(self.stats.clone()) {
                    warn!(error = ?err, "Failed to send stats response");
                }
            }

            SchedulerCommand::Shutdown { response_tx } => {
                info!("Received shutdown command");
                self.cancel_all();
                let _ = response_tx.send(());
                return false;
            }
        }

        true
    }

    fn schedule(&mut self, job: SharedJob, trigger: BoxedTrigger) -> JobHandle {
        self.next_handle += 1;
        let handle = JobHandle::new(self.next_handle);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tokio::spawn(drive_job(
            handle,
            job,
            trigger,
            Arc::clone(&self.clock),
            cancel_rx,
            self.command_tx.clone(),
        ));

        self.jobs.insert(handle, ScheduledJob { cancel_tx });
        self.stats.scheduled_jobs += 1;
        trace!(%handle, active = self.jobs.len(), "Job scheduled");
        handle
    }

    fn cancel(&mut self, handle: JobHandle) -> bool {
        match self.jobs.remove(&handle) {
            Some(entry) => {
                // 驱动任务可能已经结束
                // the driver may already be gone
                let _ = entry.cancel_tx.send(());
                self.stats.cancelled_jobs += 1;
                trace!(%handle, "Job cancelled");
                true
            }
            None => false,
        }
    }

    fn finish(&mut self, handle: JobHandle, failure: Option<JobError>) {
        let was_active = self.jobs.remove(&handle).is_some();
        match failure {
            None => {
                if was_active {
                    self.stats.completed_jobs += 1;
                }
                trace!(%handle, "Job trigger exhausted");
            }
            Some(error) => {
                self.stats.failed_jobs += 1;
                error!(%handle, %error, "Job failed, no further fires");
                if let Some(failure_tx) = &self.failure_tx {
                    if failure_tx.send(JobFailure { handle, error }).is_err() {
                        debug!(%handle, "Failure supervisor is gone");
                    }
                }
            }
        }
    }

    fn cancel_all(&mut self) {
        let count = self.jobs.len();
        for (_, entry) in self.jobs.drain() {
            let _ = entry.cancel_tx.send(());
        }
        self.stats.cancelled_jobs += count as u64;
        if count > 0 {
            debug!(count, "Cancelled all jobs");
        }
    }
}

/// 单个作业的驱动循环
/// Driver loop of a single job
async fn drive_job(
    handle: JobHandle,
    job: SharedJob,
    mut trigger: BoxedTrigger,
    clock: SharedClock,
    mut cancel_rx: oneshot::Receiver<()>,
    command_tx: mpsc::Sender<SchedulerCommand>,
) {
    let failure = loop {
        let now = clock.now();
        let Some(fire_at) = trigger.next_fire_time(now) else {
            break None;
        };
        trace!(%handle, %fire_at, "Waiting for next fire");

        tokio::select! {
            biased;
            _ = &mut cancel_rx => {
                trace!(%handle, "Driver stopped before firing");
                return;
            }
            _ = sleep(fire_at.saturating_duration_since(now)) => {}
        }

        trigger.triggered(fire_at);
        let fired_at = clock.now();
        let execution = JobExecution {
            handle,
            scheduled_at: fire_at,
            fired_at,
            next_fire_time: trigger.next_fire_time(fired_at),
        };

        let job = Arc::clone(&job);
        match tokio::spawn(async move { job.execute(execution).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => break Some(error),
            Err(join_error) => break Some(JobError::Panicked(join_error.to_string())),
        }
    };

    // 调度任务可能已经关闭
    // the scheduler task may already be shut down
    let _ = command_tx
        .send(SchedulerCommand::Finished { handle, failure })
        .await;
}
