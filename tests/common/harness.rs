//! tests/common/harness.rs
use kestrel_timers::{
    Clock, Config, ProcessInstanceId, ProcessRuntime, RuntimeError, SchedulerHandle, SessionId,
    SharedClock, StartParameters, SystemClock, TimerId, TimerManager, TimerRecord, Timestamp,
    in_operation, scheduler::JobFailure, start_scheduler_with_supervisor,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{
    Arc, Mutex, Once, Weak,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use std::time::Duration;
use tokio::sync::mpsc;

/// Name of the timer whose signal registers a follow-up timer.
pub const CHAIN_TIMER: &str = "chain";
/// Name given to the follow-up timer.
pub const FOLLOW_UP_TIMER: &str = "follow-up";

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "kestrel_timers=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// One event delivered into a process instance.
#[derive(Debug, Clone)]
pub struct SignalRecord {
    pub process_instance_id: ProcessInstanceId,
    pub event: String,
    pub timer: TimerRecord,
    pub at: Timestamp,
}

/// One process instance started by a start timer.
#[derive(Debug, Clone)]
pub struct StartRecord {
    pub process_id: String,
    pub parameters: StartParameters,
    pub trigger: String,
    pub at: Timestamp,
}

/// A process runtime that records everything the timer subsystem asks of it.
pub struct RecordingRuntime {
    clock: SharedClock,
    session_id: SessionId,
    active: AtomicBool,
    fail_starts: AtomicBool,
    instances: Mutex<HashSet<ProcessInstanceId>>,
    next_instance: AtomicU64,
    signals: Mutex<Vec<SignalRecord>>,
    starts: Mutex<Vec<StartRecord>>,
    start_attempts: AtomicUsize,
    guards_entered: AtomicUsize,
    guards_exited: AtomicUsize,
    depth: AtomicUsize,
    max_depth: AtomicUsize,
    overlaps: AtomicUsize,
    signal_delay: Mutex<Duration>,
    follow_up: Mutex<Option<Weak<TimerManager>>>,
    follow_ups: Mutex<Vec<TimerId>>,
}

impl RecordingRuntime {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            session_id: 1,
            active: AtomicBool::new(true),
            fail_starts: AtomicBool::new(false),
            instances: Mutex::new(HashSet::new()),
            next_instance: AtomicU64::new(1_000),
            signals: Mutex::new(Vec::new()),
            starts: Mutex::new(Vec::new()),
            start_attempts: AtomicUsize::new(0),
            guards_entered: AtomicUsize::new(0),
            guards_exited: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            signal_delay: Mutex::new(Duration::ZERO),
            follow_up: Mutex::new(None),
            follow_ups: Mutex::new(Vec::new()),
        }
    }

    pub fn add_instance(&self, process_instance_id: ProcessInstanceId) {
        self.instances.lock().unwrap().insert(process_instance_id);
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Every signal takes this long to be processed.
    pub fn set_signal_delay(&self, delay: Duration) {
        *self.signal_delay.lock().unwrap() = delay;
    }

    /// Signals of timers named [`CHAIN_TIMER`] register a follow-up timer
    /// through this manager from inside the operation guard.
    pub fn set_follow_up(&self, manager: Weak<TimerManager>) {
        *self.follow_up.lock().unwrap() = Some(manager);
    }

    pub fn follow_ups(&self) -> Vec<TimerId> {
        self.follow_ups.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<SignalRecord> {
        self.signals.lock().unwrap().clone()
    }

    pub fn starts(&self) -> Vec<StartRecord> {
        self.starts.lock().unwrap().clone()
    }

    pub fn start_attempts(&self) -> usize {
        self.start_attempts.load(Ordering::SeqCst)
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// (entered, exited) operation guard counts.
    pub fn guard_counts(&self) -> (usize, usize) {
        (
            self.guards_entered.load(Ordering::SeqCst),
            self.guards_exited.load(Ordering::SeqCst),
        )
    }

    /// Deepest nesting of the operation guard seen so far.
    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::SeqCst)
    }

    /// Entries made by another task while the guard was already held.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRuntime for RecordingRuntime {
    fn start_operation(&self) {
        self.guards_entered.fetch_add(1, Ordering::SeqCst);
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        // Nested entries come from the task already inside the operation.
        if depth > 1 && !in_operation() {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.max_depth.fetch_max(depth, Ordering::SeqCst);
    }

    fn end_operation(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
        self.guards_exited.fetch_add(1, Ordering::SeqCst);
    }

    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn clock(&self) -> SharedClock {
        Arc::clone(&self.clock)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn has_process_instance(&self, process_instance_id: ProcessInstanceId) -> bool {
        self.instances.lock().unwrap().contains(&process_instance_id)
    }

    async fn signal_event(
        &self,
        process_instance_id: ProcessInstanceId,
        event: &str,
        payload: TimerRecord,
    ) -> Result<(), RuntimeError> {
        let chained = payload.name.as_deref() == Some(CHAIN_TIMER);
        self.signals.lock().unwrap().push(SignalRecord {
            process_instance_id,
            event: event.to_string(),
            timer: payload,
            at: self.clock.now(),
        });

        let delay = *self.signal_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let manager = self.follow_up.lock().unwrap().as_ref().and_then(Weak::upgrade);
        if let (true, Some(manager)) = (chained, manager) {
            let record = TimerRecord::one_shot(Duration::from_millis(100)).with_name(FOLLOW_UP_TIMER);
            let id = manager
                .register_timer(record, process_instance_id)
                .await
                .map_err(|err| RuntimeError::Failed(err.to_string()))?;
            self.follow_ups.lock().unwrap().push(id);
        }
        Ok(())
    }

    async fn start_process(
        &self,
        process_id: &str,
        parameters: StartParameters,
        trigger: &str,
    ) -> Result<ProcessInstanceId, RuntimeError> {
        self.start_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed(format!("cannot start {process_id}")));
        }
        let process_instance_id = self.next_instance.fetch_add(1, Ordering::SeqCst);
        self.instances.lock().unwrap().insert(process_instance_id);
        self.starts.lock().unwrap().push(StartRecord {
            process_id: process_id.to_string(),
            parameters,
            trigger: trigger.to_string(),
            at: self.clock.now(),
        });
        Ok(process_instance_id)
    }
}

/// A test harness wiring a recording runtime, the in-memory scheduler and a manager.
pub struct TestHarness {
    pub runtime: Arc<RecordingRuntime>,
    pub scheduler: SchedulerHandle,
    pub manager: TimerManager,
    pub failures: mpsc::UnboundedReceiver<JobFailure>,
}

impl TestHarness {
    /// Must be called from inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        init_tracing();
        let clock = SystemClock::shared();
        let runtime = Arc::new(RecordingRuntime::new(Arc::clone(&clock)));
        let (scheduler, failures) = start_scheduler_with_supervisor(clock, &config.scheduler);
        let manager = TimerManager::new(
            runtime.clone(),
            Arc::new(scheduler.clone()),
            config.timers,
        );
        Self {
            runtime,
            scheduler,
            manager,
            failures,
        }
    }
}
