//! 定时器管理器
//! Timer manager
//!
//! 管理器独占注册表，负责分配标识、构建触发器、把作业交给调度后端，并在
//! 作业触发时完成簿记（递减次数、退役记录）。作业只持有 [`ManagerRef`]
//! 这样一个弱引用能力句柄，管理器被销毁后它们的触发会被直接丢弃。
//!
//! The manager exclusively owns the registry. It allocates ids, builds
//! triggers, hands jobs to the scheduler backend and performs the bookkeeping
//! when jobs fire (decrementing counts, retiring records). Jobs only hold a
//! [`ManagerRef`], a weak capability handle; once the manager is gone their
//! fires are dropped.

use crate::clock::{SharedClock, Timestamp};
use crate::config::TimerConfig;
use crate::error::{Error, Result};
use crate::job::{JobContext, TimerJob};
use crate::record::{ProcessInstanceId, TimerId, TimerRecord};
use crate::runtime::{OperationLock, ProcessRuntime, StartParameters};
use crate::scheduler::{JobHandle, SchedulerBackend};
use crate::trigger::{self, BoxedTrigger, OverdueTrigger, Trigger};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 定时器管理器
/// Timer manager
pub struct TimerManager {
    shared: Arc<ManagerShared>,
}

/// 管理器与其作业共享的状态
/// State shared between the manager and its jobs
pub(crate) struct ManagerShared {
    /// 注册表
    /// Registry
    registry: DashMap<TimerId, TimerRecord>,
    /// 最近一次分配的标识
    /// Most recently allocated id
    last_id: AtomicU64,
    /// 最近一次注册的序号
    /// Most recent registration sequence
    last_registration: AtomicU64,
    /// 串行化顶层操作
    /// Serializes top-level operations
    operations: OperationLock,
    runtime: Arc<dyn ProcessRuntime>,
    backend: Arc<dyn SchedulerBackend>,
    clock: SharedClock,
    config: TimerConfig,
}

/// 指回管理器的弱引用能力句柄，由作业上下文携带
/// Weak capability handle back to the manager, carried by job contexts
#[derive(Clone)]
pub struct ManagerRef(Weak<ManagerShared>);

impl ManagerRef {
    pub(crate) fn upgrade(&self) -> Option<Arc<ManagerShared>> {
        self.0.upgrade()
    }

    /// 管理器是否仍然存在
    /// Whether the manager is still alive
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for ManagerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerRef")
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("timers", &self.shared.registry.len())
            .field("last_id", &self.shared.last_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl ManagerShared {
    pub(crate) fn runtime(&self) -> &dyn ProcessRuntime {
        &*self.runtime
    }

    pub(crate) fn triggered_event(&self) -> &str {
        &self.config.timer_triggered_event
    }

    /// 在运行时操作守卫之内运行，顶层调用互斥，嵌套调用重入
    /// Run inside the runtime operation guard; top-level calls are exclusive,
    /// nested calls re-enter
    pub(crate) async fn exclusive<F: Future>(&self, operation: F) -> F::Output {
        self.operations.run(self.runtime(), operation).await
    }

    /// 标识仍属于这一次注册
    /// Whether the id is still held by this registration
    pub(crate) fn is_current(&self, id: TimerId, registration: u64) -> bool {
        self.registry
            .get(&id)
            .is_some_and(|record| record.registration() == registration)
    }

    fn allocate_id(&self) -> TimerId {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn begin_registration(&self, record: &mut TimerRecord) {
        let registration = self.last_registration.fetch_add(1, Ordering::SeqCst) + 1;
        record.begin_registration(registration);
    }

    /// 记录一次触发并返回更新后的记录副本
    /// Record one fire and return a copy of the updated record
    ///
    /// 触发器没有后续触发时间时周期被置零，记录随后退役。
    /// When the trigger has no further fire time the period is zeroed and the
    /// record retires afterwards.
    pub(crate) fn record_fired(
        &self,
        id: TimerId,
        registration: u64,
        next_fire_time: Option<Timestamp>,
    ) -> Option<TimerRecord> {
        let now = self.clock.now();
        let mut entry = self.registry.get_mut(&id)?;
        if entry.registration() != registration {
            return None;
        }
        entry.last_triggered = Some(now);
        if entry.repeat_limit > 0 {
            entry.repeat_limit -= 1;
        }
        if next_fire_time.is_none() {
            entry.period = Duration::ZERO;
        }
        Some(entry.value().clone())
    }

    /// 从注册表移除这一次注册的记录并取消其后端句柄
    /// Remove the record of this registration and cancel its backend handle
    pub(crate) async fn retire(&self, id: TimerId, registration: u64) {
        let Some((_, mut record)) = self
            .registry
            .remove_if(&id, |_, record| record.registration() == registration)
        else {
            return;
        };
        trace!(timer_id = id, "Timer retired");
        if let Some(handle) = record.take_handle() {
            self.cancel_handle(id, handle).await;
        }
    }

    async fn cancel_handle(&self, id: TimerId, handle: JobHandle) {
        if let Err(err) = self.backend.cancel(handle).await {
            warn!(timer_id = id, %handle, error = %err, "Failed to cancel backend job");
        }
    }

    /// 调度一条已在注册表中的记录并挂上后端句柄
    /// Schedule a record already in the registry and attach the backend handle
    async fn schedule_registered(&self, id: TimerId, job: TimerJob, trigger: BoxedTrigger) -> Result<()> {
        let registration = job.context().registration();
        let handle = match self.backend.schedule(Arc::new(job), trigger).await {
            Ok(handle) => handle,
            Err(err) => {
                self.registry
                    .remove_if(&id, |_, record| record.registration() == registration);
                return Err(err.into());
            }
        };

        let attached = match self.registry.get_mut(&id) {
            Some(mut record) if record.registration() == registration => {
                record.attach_handle(handle);
                true
            }
            _ => false,
        };
        if !attached {
            // 句柄挂上之前记录已经退役
            // the record retired before its handle was attached
            self.cancel_handle(id, handle).await;
        }
        Ok(())
    }
}

impl TimerManager {
    /// 创建新的定时器管理器；时钟取自运行时
    /// Create a new timer manager; the clock comes from the runtime
    pub fn new(
        runtime: Arc<dyn ProcessRuntime>,
        backend: Arc<dyn SchedulerBackend>,
        config: TimerConfig,
    ) -> Self {
        let clock = runtime.clock();
        Self {
            shared: Arc::new(ManagerShared {
                registry: DashMap::new(),
                last_id: AtomicU64::new(0),
                last_registration: AtomicU64::new(0),
                operations: OperationLock::new(),
                runtime,
                backend,
                clock,
                config,
            }),
        }
    }

    fn context(&self, record: &TimerRecord) -> JobContext {
        JobContext::new(
            record.id(),
            record.registration(),
            ManagerRef(Arc::downgrade(&self.shared)),
        )
    }

    /// 注册属于某个流程实例的定时器，返回新分配的标识
    /// Register a timer owned by a process instance, returning the new id
    ///
    /// 触发器一开始就没有触发时间（例如重复次数为零）时只返回标识，
    /// 既不调度也不保留注册表条目。
    ///
    /// When the trigger has no fire time at all (a zero repeat limit, say) the
    /// id is returned without scheduling or keeping a registry entry.
    pub async fn register_timer(
        &self,
        record: TimerRecord,
        process_instance_id: ProcessInstanceId,
    ) -> Result<TimerId> {
        record.validate()?;
        self.shared
            .exclusive(self.register_locked(record, process_instance_id))
            .await
    }

    async fn register_locked(
        &self,
        mut record: TimerRecord,
        process_instance_id: ProcessInstanceId,
    ) -> Result<TimerId> {
        record.process_instance_id = Some(process_instance_id);
        let (id, trigger) = self.prepare(&mut record)?;
        let job = TimerJob::Signal {
            context: self.context(&record),
            process_instance_id,
        };
        self.install(record, job, trigger).await?;

        debug!(timer_id = id, process_instance_id, "Timer registered");
        Ok(id)
    }

    /// 注册启动定时器：每次触发都启动 `process_id` 的一个新实例
    /// Register a start timer: every fire starts a new instance of `process_id`
    pub async fn register_start_timer(
        &self,
        record: TimerRecord,
        process_id: impl Into<String>,
        parameters: StartParameters,
    ) -> Result<TimerId> {
        record.validate()?;
        let process_id = process_id.into();
        self.shared
            .exclusive(self.register_start_locked(record, process_id, parameters))
            .await
    }

    async fn register_start_locked(
        &self,
        mut record: TimerRecord,
        process_id: String,
        parameters: StartParameters,
    ) -> Result<TimerId> {
        record.process_instance_id = None;
        let (id, trigger) = self.prepare(&mut record)?;
        let job = TimerJob::Start {
            context: self.context(&record),
            process_id: process_id.clone(),
            parameters,
        };
        self.install(record, job, trigger).await?;

        debug!(timer_id = id, %process_id, "Start timer registered");
        Ok(id)
    }

    /// 为新注册的记录分配标识、打上激活时间并构建触发器
    /// Allocate the id, stamp activation and build the trigger of a fresh record
    fn prepare(&self, record: &mut TimerRecord) -> Result<(TimerId, BoxedTrigger)> {
        let now = self.shared.clock.now();
        record.normalize();
        record.activated = Some(now);
        record.last_triggered = None;
        record.session_id = Some(self.shared.runtime.session_id());
        let trigger = trigger::for_record(record, now, &self.shared.config)?;

        let id = self.shared.allocate_id();
        record.assign_id(id);
        self.shared.begin_registration(record);
        Ok((id, trigger))
    }

    async fn install(&self, record: TimerRecord, job: TimerJob, trigger: BoxedTrigger) -> Result<()> {
        let id = record.id();
        match trigger.next_fire_time(self.shared.clock.now()) {
            Some(next) => trace!(timer_id = id, %next, "First fire computed"),
            None => {
                debug!(timer_id = id, "Trigger has no fire time, nothing to schedule");
                return Ok(());
            }
        }
        self.shared.registry.insert(id, record);
        self.shared.schedule_registered(id, job, trigger).await
    }

    /// 取消定时器；未知标识是空操作
    /// Cancel a timer; an unknown id is a no-op
    ///
    /// 返回是否真的移除了一条记录。已经在执行的触发会运行完成。
    /// Returns whether a record was actually removed. A fire already running
    /// completes.
    pub async fn cancel_timer(&self, id: TimerId) -> Result<bool> {
        self.shared.exclusive(self.cancel_locked(id)).await
    }

    async fn cancel_locked(&self, id: TimerId) -> Result<bool> {
        let Some((_, mut record)) = self.shared.registry.remove(&id) else {
            trace!(timer_id = id, "Cancel of unknown timer ignored");
            return Ok(false);
        };
        if let Some(handle) = record.take_handle() {
            self.shared.backend.cancel(handle).await?;
        }
        debug!(timer_id = id, "Timer cancelled");
        Ok(true)
    }

    /// 取消某个流程实例拥有的全部定时器，返回取消的数量
    /// Cancel every timer owned by one process instance, returning the count
    pub async fn cancel_process_timers(&self, process_instance_id: ProcessInstanceId) -> Result<usize> {
        let ids: Vec<TimerId> = self
            .shared
            .registry
            .iter()
            .filter(|entry| entry.process_instance_id == Some(process_instance_id))
            .map(|entry| *entry.key())
            .collect();

        let mut cancelled = 0;
        for id in ids {
            if self.cancel_timer(id).await? {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(process_instance_id, cancelled, "Cancelled process timers");
        }
        Ok(cancelled)
    }

    /// 从持久化状态恢复定时器
    /// Recover a timer from persisted state
    ///
    /// 幂等：标识已在注册表中时什么也不做并返回 `false`。触发时间已经过去时
    /// 以超期触发器包装，首次触发推迟到当前时间加超期延迟。启动定时器不会
    /// 经由恢复路径重建，遇到时记录日志并忽略。
    ///
    /// Idempotent: when the id is already registered nothing happens and
    /// `false` is returned. A fire time already in the past is wrapped in an
    /// overdue trigger, deferring the first fire to now plus the overdue delay.
    /// Start timers are never rebuilt through recovery; they are logged and
    /// ignored.
    pub async fn recover_timer(&self, record: TimerRecord) -> Result<bool> {
        let id = record.id();
        let Some(process_instance_id) = record.process_instance_id else {
            warn!(timer_id = id, "Start timers are not recovered, ignoring record");
            return Ok(false);
        };
        if id == 0 {
            return Err(Error::InvalidTimer("recovered timer carries no id"));
        }
        record.validate()?;
        self.shared
            .exclusive(self.recover_locked(record, process_instance_id))
            .await
    }

    async fn recover_locked(&self, mut record: TimerRecord, process_instance_id: ProcessInstanceId) -> Result<bool> {
        let id = record.id();
        // 之后分配的标识不能与恢复的标识冲突
        // ids allocated later must not collide with recovered ones
        self.shared.last_id.fetch_max(id, Ordering::SeqCst);

        let now = self.shared.clock.now();
        record.normalize();
        record.activated.get_or_insert(now);
        record.session_id = Some(self.shared.runtime.session_id());

        let trigger = trigger::for_record(&record, now, &self.shared.config)?;
        let next = trigger.next_fire_time(now);
        let trigger: BoxedTrigger = match next {
            Some(next) if next < now => {
                debug!(timer_id = id, %next, "Recovered timer is overdue");
                Box::new(OverdueTrigger::new(
                    trigger,
                    self.shared.clock.clone(),
                    self.shared.config.overdue_delay,
                ))
            }
            _ => trigger,
        };

        self.shared.begin_registration(&mut record);
        let job = TimerJob::Signal {
            context: self.context(&record),
            process_instance_id,
        };
        match self.shared.registry.entry(id) {
            Entry::Occupied(_) => {
                debug!(timer_id = id, "Timer already registered, recovery skipped");
                return Ok(false);
            }
            Entry::Vacant(slot) => {
                if next.is_none() {
                    debug!(timer_id = id, "Recovered timer has no fire time left");
                    return Ok(false);
                }
                slot.insert(record);
            }
        }

        self.shared.schedule_registered(id, job, trigger).await?;
        info!(timer_id = id, process_instance_id, "Timer recovered");
        Ok(true)
    }

    /// 以新的触发参数重新调度定时器，标识保持不变
    /// Reschedule a timer with new trigger parameters, keeping its id
    ///
    /// 重新调度会把记录转为周期定时器并重置激活时间。未知标识返回 `false`。
    /// Rescheduling turns the record into an interval timer and resets its
    /// activation. An unknown id returns `false`.
    pub async fn reschedule_timer(
        &self,
        id: TimerId,
        delay: Duration,
        period: Duration,
        repeat_limit: i32,
    ) -> Result<bool> {
        self.shared
            .exclusive(self.reschedule_locked(id, delay, period, repeat_limit))
            .await
    }

    async fn reschedule_locked(
        &self,
        id: TimerId,
        delay: Duration,
        period: Duration,
        repeat_limit: i32,
    ) -> Result<bool> {
        let Some(mut record) = self.shared.registry.get(&id).map(|entry| entry.value().clone()) else {
            return Ok(false);
        };
        let Some(process_instance_id) = record.process_instance_id else {
            return Err(Error::InvalidTimer("start timers cannot be rescheduled"));
        };

        record.cron_expression = None;
        record.delay = delay;
        record.period = period;
        record.repeat_limit = repeat_limit;
        record.validate()?;

        let now = self.shared.clock.now();
        record.activated = Some(now);
        record.last_triggered = None;
        let trigger = trigger::for_record(&record, now, &self.shared.config)?;

        // 先停掉旧作业，再换上新记录
        // stop the old job before swapping the record in
        if let Some((_, mut old)) = self.shared.registry.remove(&id) {
            if let Some(handle) = old.take_handle() {
                self.shared.backend.cancel(handle).await?;
            }
        }
        // 新的注册序号让旧作业迟到的触发失效
        // a new registration sequence invalidates late fires of the old job
        self.shared.begin_registration(&mut record);

        let job = TimerJob::Signal {
            context: self.context(&record),
            process_instance_id,
        };
        self.install(record, job, trigger).await?;
        debug!(timer_id = id, ?delay, ?period, repeat_limit, "Timer rescheduled");
        Ok(true)
    }

    /// 全部记录，按标识排序
    /// Every record, sorted by id
    pub fn list_timers(&self) -> Vec<TimerRecord> {
        let mut records: Vec<TimerRecord> = self
            .shared
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(TimerRecord::id);
        records
    }

    /// 用于持久化的快照：只包含属于流程实例的记录
    /// Snapshot for persistence: only records owned by a process instance
    pub fn snapshot(&self) -> Vec<TimerRecord> {
        let mut records = self.list_timers();
        records.retain(|record| !record.is_start_timer());
        records
    }

    pub fn get_timer(&self, id: TimerId) -> Option<TimerRecord> {
        self.shared.registry.get(&id).map(|entry| entry.value().clone())
    }

    pub fn timer_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// 取消全部定时器、清空注册表并关闭调度后端
    /// Cancel every timer, clear the registry and shut the scheduler backend down
    pub async fn dispose(self) {
        self.shared.exclusive(self.dispose_locked()).await;
    }

    async fn dispose_locked(&self) {
        let ids: Vec<TimerId> = self.shared.registry.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0usize;
        for id in ids {
            if let Some((_, mut record)) = self.shared.registry.remove(&id) {
                if let Some(handle) = record.take_handle() {
                    self.shared.cancel_handle(id, handle).await;
                }
                cancelled += 1;
            }
        }
        self.shared.registry.clear();

        if let Err(err) = self.shared.backend.shutdown().await {
            warn!(error = %err, "Scheduler backend shutdown failed");
        }
        info!(cancelled, "Timer manager disposed");
    }
}
