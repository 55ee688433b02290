//! 流程运行时协作接口
//! Process runtime collaborator interface
//!
//! 定时器子系统不执行流程本身，而是通过 [`ProcessRuntime`] 向运行时投递事件、
//! 启动新实例。对运行时状态的修改经由 [`OperationLock`] 串行化，并用
//! 运行时的粗粒度操作守卫包围。
//!
//! The timer subsystem does not execute processes itself. It delivers events
//! and starts new instances. Its mutations of runtime state are serialized by
//! an [`OperationLock`] and bracketed by the coarse operation guard of a
//! [`ProcessRuntime`].

use crate::clock::SharedClock;
use crate::record::{ProcessInstanceId, SessionId, TimerRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tokio::sync::Mutex;

tokio::task_local! {
    static IN_OPERATION: ();
}

/// 启动定时器传递给新实例的参数
/// Parameters a start timer hands to the new instance
pub type StartParameters = HashMap<String, serde_json::Value>;

/// 由定时器启动的实例所携带的触发类型
/// Trigger kind recorded on instances started by a timer
pub const TIMER_START_TRIGGER: &str = "timer";

/// 运行时协作方返回的错误
/// Errors reported by the runtime collaborator
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("process instance {0} not found")]
    ProcessInstanceNotFound(ProcessInstanceId),
    #[error("process definition '{0}' not found")]
    ProcessNotFound(String),
    #[error("{0}")]
    Failed(String),
}

/// 流程运行时
/// Process runtime
///
/// `start_operation` 与 `end_operation` 必须成对调用；请使用 [`OperationGuard`]
/// 而不是直接调用。管理器通过 [`OperationLock`] 保证同一时刻只有一个顶层操作
/// 在进行，嵌套调用（例如 `signal_event` 内部再注册定时器）在同一任务上重入，
/// 此时 [`in_operation`] 返回 `true`。实现不应阻塞执行器线程。
///
/// `start_operation` and `end_operation` must be called in pairs; go through
/// [`OperationGuard`] instead of calling them directly. The manager runs at most
/// one top-level operation at a time through an [`OperationLock`]. Nested calls
/// (registering a timer from inside `signal_event`, say) re-enter on the same
/// task, where [`in_operation`] returns `true`. Implementations must not block
/// the executor thread.
#[async_trait]
pub trait ProcessRuntime: Send + Sync + 'static {
    /// 进入一次运行时操作
    /// Enter a runtime operation
    fn start_operation(&self);

    /// 离开一次运行时操作
    /// Leave a runtime operation
    fn end_operation(&self);

    /// 当前会话标识
    /// Identifier of the current session
    fn session_id(&self) -> SessionId;

    /// 运行时的逻辑时钟，所有触发器计算都使用它
    /// The runtime's logical clock, used for all trigger math
    fn clock(&self) -> SharedClock;

    /// 所属部署当前是否接受新实例启动
    /// Whether the owning deployment currently accepts new instance starts
    fn is_active(&self) -> bool;

    /// 流程实例是否存在
    /// Whether the process instance exists
    fn has_process_instance(&self, process_instance_id: ProcessInstanceId) -> bool;

    /// 向流程实例投递事件，可能同步驱动后续的流程执行
    /// Deliver an event to a process instance; may synchronously drive further execution
    async fn signal_event(
        &self,
        process_instance_id: ProcessInstanceId,
        event: &str,
        payload: TimerRecord,
    ) -> Result<(), RuntimeError>;

    /// 创建并启动新的流程实例
    /// Create and start a new process instance
    async fn start_process(
        &self,
        process_id: &str,
        parameters: StartParameters,
        trigger: &str,
    ) -> Result<ProcessInstanceId, RuntimeError>;
}

/// 运行时操作守卫
/// Runtime operation guard
///
/// 创建时调用 `start_operation`，销毁时调用 `end_operation`，包括提前返回和
/// panic 展开的路径。
///
/// Calls `start_operation` on creation and `end_operation` on drop, including
/// early returns and panic unwinding.
pub struct OperationGuard<'a> {
    runtime: &'a dyn ProcessRuntime,
}

impl<'a> OperationGuard<'a> {
    pub fn enter(runtime: &'a dyn ProcessRuntime) -> Self {
        runtime.start_operation();
        Self { runtime }
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.runtime.end_operation();
    }
}

/// 当前任务是否处于一次运行时操作之内
/// Whether the current task is inside a runtime operation
pub fn in_operation() -> bool {
    IN_OPERATION.try_with(|_| ()).is_ok()
}

/// 运行时操作互斥锁
/// Runtime operation lock
///
/// 顶层操作互斥执行；已经处于操作之内的任务直接重入，不再等待锁。
/// 嵌套调用必须在持锁的同一任务上进行，在别的任务上等待它会死锁。
///
/// Top-level operations run one at a time. A task already inside an operation
/// re-enters without waiting for the lock. Nested calls must happen on the task
/// holding the lock; awaiting them from another task deadlocks.
#[derive(Debug, Default)]
pub struct OperationLock {
    mutex: Mutex<()>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在操作守卫之内运行 `operation`
    /// Run `operation` inside the operation guard
    pub async fn run<F: Future>(&self, runtime: &dyn ProcessRuntime, operation: F) -> F::Output {
        if in_operation() {
            let _guard = OperationGuard::enter(runtime);
            return operation.await;
        }
        let _exclusive = self.mutex.lock().await;
        let _guard = OperationGuard::enter(runtime);
        IN_OPERATION.scope((), operation).await
    }
}
