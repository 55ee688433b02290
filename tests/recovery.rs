//! 定时器恢复集成测试
//! Timer recovery integration tests

pub mod common;

use common::harness::TestHarness;
use kestrel_timers::{Error, TimerRecord, Timestamp, config::DEFAULT_OVERDUE_DELAY};
use tokio::time::{Duration, sleep};

const INSTANCE: u64 = 11;

/// 按持久化后再读回的形式构造记录
fn persisted(id: u64, record: TimerRecord) -> TimerRecord {
    let mut record = record.with_id(id);
    record.process_instance_id = Some(INSTANCE);
    record.session_id = Some(99);
    let json = serde_json::to_string(&record).unwrap();
    serde_json::from_str(&json).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_overdue_timer_fires_after_overdue_delay() {
    let harness = TestHarness::new();
    harness.runtime.add_instance(INSTANCE);

    let now = harness.runtime.now();
    let hour = Duration::from_secs(3_600);
    let mut record = TimerRecord::interval(Duration::ZERO, Duration::from_millis(100), -1);
    record.activated = Some(now - hour * 2);
    record.last_triggered = Some(now - hour);
    let record = persisted(42, record);

    assert!(harness.manager.recover_timer(record).await.unwrap());

    // 不会立即触发，也不会按原周期追赶
    sleep(DEFAULT_OVERDUE_DELAY - Duration::from_millis(1)).await;
    assert!(harness.runtime.signals().is_empty());

    sleep(Duration::from_millis(150)).await;
    let signals = harness.runtime.signals();
    assert_eq!(signals.len(), 2);
    let first = signals[0].at;
    assert!(first >= now);
    assert!(first <= now + DEFAULT_OVERDUE_DELAY);
    assert_eq!(signals[1].at, first + Duration::from_millis(100));

    // 恢复后的记录属于当前会话
    assert_eq!(signals[0].timer.session_id, Some(1));
    assert_eq!(signals[0].timer.id(), 42);

    harness.manager.cancel_timer(42).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recovering_twice_keeps_one_backend_job() {
    let harness = TestHarness::new();
    harness.runtime.add_instance(INSTANCE);

    let record = persisted(5, TimerRecord::one_shot(Duration::from_secs(30)));

    assert!(harness.manager.recover_timer(record.clone()).await.unwrap());
    assert!(!harness.manager.recover_timer(record).await.unwrap());

    let stats = harness.scheduler.get_stats().await.unwrap();
    assert_eq!(stats.scheduled_jobs, 1);
    assert_eq!(stats.active_jobs, 1);
    assert_eq!(harness.manager.timer_count(), 1);

    sleep(Duration::from_secs(31)).await;
    assert_eq!(harness.runtime.signals().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_reconciles_id_allocation() {
    let harness = TestHarness::new();
    harness.runtime.add_instance(INSTANCE);

    let first = harness
        .manager
        .register_timer(TimerRecord::one_shot(Duration::from_secs(60)), INSTANCE)
        .await
        .unwrap();
    assert_eq!(first, 1);

    let record = persisted(40, TimerRecord::one_shot(Duration::from_secs(60)));
    assert!(harness.manager.recover_timer(record).await.unwrap());

    let next = harness
        .manager
        .register_timer(TimerRecord::one_shot(Duration::from_secs(60)), INSTANCE)
        .await
        .unwrap();
    assert_eq!(next, 41);

    // 较小的恢复标识不会让计数器倒退
    let record = persisted(3, TimerRecord::one_shot(Duration::from_secs(60)));
    assert!(harness.manager.recover_timer(record).await.unwrap());
    let after = harness
        .manager
        .register_timer(TimerRecord::one_shot(Duration::from_secs(60)), INSTANCE)
        .await
        .unwrap();
    assert_eq!(after, 42);
}

#[tokio::test(start_paused = true)]
async fn test_recovered_timer_keeps_remaining_repeats() {
    let harness = TestHarness::new();
    harness.runtime.add_instance(INSTANCE);

    let now = harness.runtime.now();
    let mut record = TimerRecord::interval(Duration::ZERO, Duration::from_millis(500), 2);
    record.activated = Some(now);
    record.last_triggered = Some(now);
    assert!(harness.manager.recover_timer(persisted(8, record)).await.unwrap());

    sleep(Duration::from_secs(5)).await;
    let signals = harness.runtime.signals();
    assert_eq!(signals.len(), 2);
    assert_eq!(signals[0].at, now + Duration::from_millis(500));
    assert!(harness.manager.get_timer(8).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_recovery_skips_start_timers_and_rejects_missing_ids() {
    let harness = TestHarness::new();

    // 启动定时器没有所属实例
    let start = TimerRecord::cron("0 * * * * *").with_id(3);
    assert!(!harness.manager.recover_timer(start).await.unwrap());
    assert_eq!(harness.manager.timer_count(), 0);

    let mut anonymous = TimerRecord::one_shot(Duration::from_secs(1));
    anonymous.process_instance_id = Some(INSTANCE);
    let result = harness.manager.recover_timer(anonymous).await;
    assert!(matches!(result, Err(Error::InvalidTimer(_))));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_record_is_not_recovered() {
    let harness = TestHarness::new();
    harness.runtime.add_instance(INSTANCE);

    let mut record = TimerRecord::one_shot(Duration::ZERO);
    record.activated = Some(Timestamp::from_millis(1_000));
    record.last_triggered = Some(Timestamp::from_millis(1_000));
    assert!(!harness.manager.recover_timer(persisted(9, record)).await.unwrap());
    assert_eq!(harness.manager.timer_count(), 0);

    sleep(Duration::from_secs(5)).await;
    assert!(harness.runtime.signals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_round_trips_through_recovery() {
    let first = TestHarness::new();
    first.runtime.add_instance(INSTANCE);
    first
        .manager
        .register_timer(
            TimerRecord::interval(Duration::from_secs(10), Duration::from_secs(1), 5),
            INSTANCE,
        )
        .await
        .unwrap();
    let snapshot = first.manager.snapshot();
    first.manager.dispose().await;

    let json = serde_json::to_string(&snapshot).unwrap();
    let restored: Vec<TimerRecord> = serde_json::from_str(&json).unwrap();

    let second = TestHarness::new();
    second.runtime.add_instance(INSTANCE);
    for record in restored {
        assert!(second.manager.recover_timer(record).await.unwrap());
    }

    sleep(Duration::from_secs(12)).await;
    let signals = second.runtime.signals();
    assert!(!signals.is_empty());
    assert!(signals.iter().all(|s| s.timer.id() == 1));
}
