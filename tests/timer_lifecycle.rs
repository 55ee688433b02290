//! 定时器注册、触发与取消的集成测试
//! Integration tests for timer registration, firing and cancellation

pub mod common;

use common::harness::TestHarness;
use kestrel_timers::{Error, TimerRecord, config::TIMER_TRIGGERED_EVENT};
use std::sync::Arc;
use tokio::time::{Duration, sleep};

const INSTANCE: u64 = 7;

fn harness() -> TestHarness {
    let harness = TestHarness::new();
    harness.runtime.add_instance(INSTANCE);
    harness
}

#[tokio::test(start_paused = true)]
async fn test_interval_timer_fires_repeat_limit_times_then_retires() {
    let harness = harness();
    let record = TimerRecord::interval(Duration::ZERO, Duration::from_millis(100), 3);

    let id = harness.manager.register_timer(record, INSTANCE).await.unwrap();
    assert!(harness.manager.get_timer(id).is_some());

    sleep(Duration::from_secs(1)).await;

    let signals = harness.runtime.signals();
    assert_eq!(signals.len(), 3);
    for pair in signals.windows(2) {
        assert!(pair[1].at.saturating_duration_since(pair[0].at) >= Duration::from_millis(100));
    }
    for signal in &signals {
        assert_eq!(signal.process_instance_id, INSTANCE);
        assert_eq!(signal.event, TIMER_TRIGGERED_EVENT);
        assert_eq!(signal.timer.id(), id);
    }
    let remaining: Vec<i32> = signals.iter().map(|s| s.timer.repeat_limit).collect();
    assert_eq!(remaining, vec![2, 1, 0]);
    assert!(signals[2].timer.period.is_zero());

    assert!(harness.manager.get_timer(id).is_none());
    assert_eq!(harness.manager.timer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_zero_repeat_limit_never_fires() {
    let harness = harness();
    let record = TimerRecord::interval(Duration::ZERO, Duration::from_millis(100), 0);

    let id = harness.manager.register_timer(record, INSTANCE).await.unwrap();
    assert!(id > 0);
    assert!(harness.manager.get_timer(id).is_none());

    sleep(Duration::from_secs(1)).await;
    assert!(harness.runtime.signals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_one_shot_timer_fires_after_delay() {
    let harness = harness();
    let registered_at = harness.runtime.now();

    let id = harness
        .manager
        .register_timer(TimerRecord::one_shot(Duration::from_millis(500)), INSTANCE)
        .await
        .unwrap();

    sleep(Duration::from_millis(400)).await;
    assert!(harness.runtime.signals().is_empty());

    sleep(Duration::from_millis(200)).await;
    let signals = harness.runtime.signals();
    assert_eq!(signals.len(), 1);
    assert!(signals[0].at >= registered_at + Duration::from_millis(500));
    assert_eq!(signals[0].timer.last_triggered, Some(signals[0].at));
    assert!(harness.manager.get_timer(id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unlimited_timer_stops_after_cancel() {
    let harness = harness();
    let record = TimerRecord::interval(Duration::ZERO, Duration::from_millis(100), -1);
    let id = harness.manager.register_timer(record, INSTANCE).await.unwrap();

    // 在 0、100、200 毫秒各触发一次
    sleep(Duration::from_millis(250)).await;
    assert_eq!(harness.runtime.signals().len(), 3);

    assert!(harness.manager.cancel_timer(id).await.unwrap());
    sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.runtime.signals().len(), 3);
    assert!(harness.manager.get_timer(id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_unknown_timer_is_noop() {
    let harness = harness();
    assert!(!harness.manager.cancel_timer(4242).await.unwrap());

    let id = harness
        .manager
        .register_timer(TimerRecord::one_shot(Duration::from_secs(10)), INSTANCE)
        .await
        .unwrap();
    assert!(harness.manager.cancel_timer(id).await.unwrap());
    assert!(!harness.manager.cancel_timer(id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_cron_timer_first_fire_is_at_least_one_second_away() {
    let harness = harness();
    let registered_at = harness.runtime.now();

    let id = harness
        .manager
        .register_timer(TimerRecord::cron("* * * * * *"), INSTANCE)
        .await
        .unwrap();

    sleep(Duration::from_millis(999)).await;
    assert!(harness.runtime.signals().is_empty());

    sleep(Duration::from_millis(2_100)).await;
    let signals = harness.runtime.signals();
    assert!(signals.len() >= 2);
    assert!(signals[0].at >= registered_at + Duration::from_millis(1_000));
    assert_eq!(signals[0].at.as_millis() % 1_000, 0);
    // cron 定时器不会退役
    assert!(harness.manager.get_timer(id).is_some());

    harness.manager.cancel_timer(id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slow_signal_does_not_skip_cron_seconds() {
    let harness = harness();
    harness.runtime.set_signal_delay(Duration::from_millis(10));

    let id = harness
        .manager
        .register_timer(TimerRecord::cron("* * * * * *"), INSTANCE)
        .await
        .unwrap();

    sleep(Duration::from_secs(11)).await;
    let signals = harness.runtime.signals();
    assert!(signals.len() >= 9, "only {} fires", signals.len());
    for pair in signals.windows(2) {
        assert_eq!(pair[1].at, pair[0].at + Duration::from_secs(1));
    }

    harness.manager.cancel_timer(id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_invalid_definition_is_rejected_before_scheduling() {
    let harness = harness();

    let mut record = TimerRecord::cron("*/5 * * * * *");
    record.delay = Duration::from_secs(1);
    let result = harness.manager.register_timer(record, INSTANCE).await;
    assert!(matches!(result, Err(Error::InvalidTimer(_))));

    let result = harness
        .manager
        .register_timer(TimerRecord::cron("61 * * * *"), INSTANCE)
        .await;
    assert!(matches!(result, Err(Error::Cron(_))));

    assert_eq!(harness.manager.timer_count(), 0);
    assert_eq!(harness.scheduler.get_stats().await.unwrap().scheduled_jobs, 0);

    // 被拒绝的定义不消耗标识
    let id = harness
        .manager
        .register_timer(TimerRecord::one_shot(Duration::from_secs(1)), INSTANCE)
        .await
        .unwrap();
    assert_eq!(id, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_process_timers_only_touches_that_instance() {
    let harness = harness();
    harness.runtime.add_instance(8);

    for _ in 0..3 {
        harness
            .manager
            .register_timer(TimerRecord::one_shot(Duration::from_secs(60)), INSTANCE)
            .await
            .unwrap();
    }
    let survivor = harness
        .manager
        .register_timer(TimerRecord::one_shot(Duration::from_secs(60)), 8)
        .await
        .unwrap();

    assert_eq!(harness.manager.cancel_process_timers(INSTANCE).await.unwrap(), 3);
    assert_eq!(harness.manager.cancel_process_timers(INSTANCE).await.unwrap(), 0);

    let remaining: Vec<u64> = harness.manager.list_timers().iter().map(|r| r.id()).collect();
    assert_eq!(remaining, vec![survivor]);
}

#[tokio::test(start_paused = true)]
async fn test_reschedule_keeps_id_and_replaces_trigger() {
    let harness = harness();
    let id = harness
        .manager
        .register_timer(TimerRecord::one_shot(Duration::from_secs(3_600)), INSTANCE)
        .await
        .unwrap();

    assert!(
        harness
            .manager
            .reschedule_timer(id, Duration::from_millis(100), Duration::from_millis(100), 2)
            .await
            .unwrap()
    );
    let record = harness.manager.get_timer(id).unwrap();
    assert_eq!(record.repeat_limit, 2);
    assert_eq!(record.delay, Duration::from_millis(100));

    sleep(Duration::from_secs(1)).await;
    let signals = harness.runtime.signals();
    assert_eq!(signals.len(), 2);
    assert!(signals.iter().all(|s| s.timer.id() == id));
    assert!(harness.manager.get_timer(id).is_none());

    // 只剩一个调度作业，旧作业已取消
    let stats = harness.scheduler.get_stats().await.unwrap();
    assert_eq!(stats.scheduled_jobs, 2);
    assert_eq!(stats.active_jobs, 0);

    assert!(
        !harness
            .manager
            .reschedule_timer(id, Duration::ZERO, Duration::ZERO, -1)
            .await
            .unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn test_late_fire_of_old_job_leaves_rescheduled_timer_alone() {
    let harness = harness();
    harness.runtime.set_signal_delay(Duration::from_millis(500));
    let start = harness.runtime.now();
    let runtime = Arc::clone(&harness.runtime);
    let manager = Arc::new(harness.manager);

    // 先触发的定时器占住操作守卫 100ms..600ms
    let busy = manager
        .register_timer(TimerRecord::one_shot(Duration::from_millis(100)), INSTANCE)
        .await
        .unwrap();
    let id = manager
        .register_timer(TimerRecord::one_shot(Duration::from_millis(150)), INSTANCE)
        .await
        .unwrap();

    // 重新调度先排队，旧作业在 150ms 触发后排在它后面
    sleep(Duration::from_millis(120)).await;
    let reschedule = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move {
            manager
                .reschedule_timer(id, Duration::from_secs(2), Duration::from_secs(1), 3)
                .await
                .unwrap()
        }
    });

    sleep(Duration::from_secs(6)).await;
    assert!(reschedule.await.unwrap());

    let signals = runtime.signals();
    assert_eq!(signals.len(), 4);
    assert_eq!(signals[0].timer.id(), busy);
    let rescheduled: Vec<_> = signals.iter().filter(|s| s.timer.id() == id).collect();
    assert_eq!(rescheduled.len(), 3);
    assert!(rescheduled[0].at >= start + Duration::from_millis(2_600));
    assert_eq!(rescheduled[0].timer.period, Duration::from_secs(1));
    assert_eq!(rescheduled[0].timer.repeat_limit, 2);
    assert!(manager.get_timer(id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_operation_guard_is_balanced() {
    let harness = harness();
    let id = harness
        .manager
        .register_timer(
            TimerRecord::interval(Duration::ZERO, Duration::from_millis(50), 4),
            INSTANCE,
        )
        .await
        .unwrap();
    let other = harness
        .manager
        .register_timer(TimerRecord::one_shot(Duration::from_secs(10)), INSTANCE)
        .await
        .unwrap();
    harness.manager.cancel_timer(other).await.unwrap();
    harness.manager.cancel_timer(9_999).await.unwrap();
    let _ = harness
        .manager
        .register_timer(TimerRecord::cron("bogus"), INSTANCE)
        .await;

    sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.runtime.signals().len(), 4);
    assert!(harness.manager.get_timer(id).is_none());

    let (entered, exited) = harness.runtime.guard_counts();
    assert!(entered >= 8);
    assert_eq!(entered, exited);
    assert_eq!(harness.runtime.max_depth(), 1);
    assert_eq!(harness.runtime.overlaps(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_cancels_everything_and_stops_backend() {
    let harness = harness();
    for delay in [100, 200, 300] {
        harness
            .manager
            .register_timer(
                TimerRecord::interval(Duration::from_millis(delay), Duration::from_millis(100), -1),
                INSTANCE,
            )
            .await
            .unwrap();
    }
    assert_eq!(harness.manager.timer_count(), 3);

    harness.manager.dispose().await;

    sleep(Duration::from_secs(2)).await;
    assert!(harness.runtime.signals().is_empty());
    assert!(harness.scheduler.get_stats().await.is_err());
}
