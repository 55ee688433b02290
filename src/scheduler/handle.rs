//! 调度任务句柄
//! Scheduler task handle
//!
//! 本模块包含调度任务的客户端句柄，提供了与调度任务通信的高级接口，
//! 以及启动调度任务的便捷函数。
//!
//! This module contains the client handle of the scheduler task, providing
//! high-level interfaces for talking to the task, and convenience functions for
//! starting it.

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::trigger::BoxedTrigger;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use super::backend::{JobFailure, JobHandle, SchedulerBackend, SharedJob};
use super::commands::{SchedulerCommand, SchedulerError, SchedulerStats};
use super::task::SchedulerTask;

/// 调度任务的句柄
/// Handle of the scheduler task
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    /// 命令发送通道
    /// Command sender channel
    command_tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// 创建新的任务句柄
    /// Create new task handle
    pub fn new(command_tx: mpsc::Sender<SchedulerCommand>) -> Self {
        Self { command_tx }
    }

    /// 调度作业
    /// Schedule job
    pub async fn schedule_job(
        &self,
        job: SharedJob,
        trigger: BoxedTrigger,
    ) -> Result<JobHandle, SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();

        let command = SchedulerCommand::Schedule {
            job,
            trigger,
            response_tx,
        };

        self.command_tx
            .send(command)
            .await
            .map_err(|_| SchedulerError::TaskShutdown)?;

        response_rx.await.map_err(|_| SchedulerError::TaskShutdown)
    }

    /// 取消作业
    /// Cancel job
    pub async fn cancel_job(&self, handle: JobHandle) -> Result<bool, SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();

        let command = SchedulerCommand::Cancel {
            handle,
            response_tx,
        };

        self.command_tx
            .send(command)
            .await
            .map_err(|_| SchedulerError::TaskShutdown)?;

        response_rx.await.map_err(|_| SchedulerError::TaskShutdown)
    }

    /// 获取统计信息
    /// Get statistics
    pub async fn get_stats(&self) -> Result<SchedulerStats, SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(SchedulerCommand::GetStats { response_tx })
            .await
            .map_err(|_| SchedulerError::TaskShutdown)?;

        response_rx.await.map_err(|_| SchedulerError::TaskShutdown)
    }

    /// 关闭调度任务，取消所有作业
    /// Shutdown scheduler task, cancelling every job
    pub async fn shutdown_task(&self) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(SchedulerCommand::Shutdown { response_tx })
            .await
            .map_err(|_| SchedulerError::TaskShutdown)?;

        response_rx.await.map_err(|_| SchedulerError::TaskShutdown)
    }
}

#[async_trait]
impl SchedulerBackend for SchedulerHandle {
    async fn schedule(&self, job: SharedJob, trigger: BoxedTrigger) -> Result<JobHandle, SchedulerError> {
        self.schedule_job(job, trigger).await
    }

    async fn cancel(&self, handle: JobHandle) -> Result<bool, SchedulerError> {
        self.cancel_job(handle).await
    }

    async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.shutdown_task().await
    }
}

/// 启动调度任务；作业失败只记录日志
/// Start the scheduler task; job failures are only logged
pub fn start_scheduler(clock: SharedClock, config: &SchedulerConfig) -> SchedulerHandle {
    spawn_scheduler(clock, config, None)
}

/// 启动调度任务，并返回接收作业失败的监督通道
/// Start the scheduler task and return the supervisor channel receiving job failures
pub fn start_scheduler_with_supervisor(
    clock: SharedClock,
    config: &SchedulerConfig,
) -> (SchedulerHandle, mpsc::UnboundedReceiver<JobFailure>) {
    let (failure_tx, failure_rx) = mpsc::unbounded_channel();
    (spawn_scheduler(clock, config, Some(failure_tx)), failure_rx)
}

fn spawn_scheduler(
    clock: SharedClock,
    config: &SchedulerConfig,
    failure_tx: Option<mpsc::UnboundedSender<JobFailure>>,
) -> SchedulerHandle {
    let (task, command_tx) = SchedulerTask::new(clock, config.command_buffer_size, failure_tx);
    let handle = SchedulerHandle::new(command_tx);

    tokio::spawn(async move {
        task.run().await;
    });

    info!("Scheduler task spawned");
    handle
}
