//! 时间戳与时钟抽象
//! Timestamps and clock abstraction
//!
//! 所有触发器计算都基于毫秒级的 Unix 时间戳。运行时通过 [`Clock`] 提供
//! 当前时间，测试可以替换为 [`ManualClock`] 以获得确定性。
//!
//! All trigger math works on millisecond Unix timestamps. The runtime supplies
//! the current time through [`Clock`]; tests swap in [`ManualClock`] to get
//! deterministic results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// 自 Unix 纪元以来的毫秒数
/// Milliseconds since the Unix epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// 纪元本身
    /// The epoch itself
    pub const EPOCH: Timestamp = Timestamp(0);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// 加上一段时长，溢出时饱和
    /// Adds a duration, saturating on overflow
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }

    /// 减去一段时长，下溢时饱和到纪元
    /// Subtracts a duration, saturating at the epoch
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_millis(duration)))
    }

    /// 距离 `earlier` 的时长；若 `earlier` 更晚则为零
    /// Duration since `earlier`, zero if `earlier` is later
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// 转换为 UTC 日历时间，超出 chrono 范围时返回 `None`
    /// Converts to UTC calendar time, `None` when outside chrono's range
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        i64::try_from(self.0)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }

    pub fn from_datetime(datetime: DateTime<Utc>) -> Self {
        Self(u64::try_from(datetime.timestamp_millis()).unwrap_or(0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(datetime) => write!(f, "{}", datetime.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// 时钟 trait，为触发器计算提供当前时间
/// Clock trait supplying the current time to trigger computations
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// 当前时间
    /// Current time
    fn now(&self) -> Timestamp;
}

/// 共享的时钟引用
/// Shared clock reference
pub type SharedClock = Arc<dyn Clock>;

/// 基于 tokio 单调时钟的墙上时钟
/// Wall clock driven by tokio's monotonic clock
///
/// 创建时读取一次系统时间，之后按 `tokio::time::Instant` 的流逝推进。
/// 因此在 `tokio::time::pause()` 下，时钟随虚拟时间一起前进。
///
/// Reads the system time once at construction and then advances with
/// `tokio::time::Instant`. Under `tokio::time::pause()` it follows virtual time.
#[derive(Debug, Clone)]
pub struct SystemClock {
    base_wall: Timestamp,
    base_instant: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(duration_millis)
            .unwrap_or(0);
        Self {
            base_wall: Timestamp::from_millis(wall),
            base_instant: Instant::now(),
        }
    }

    /// 创建共享实例
    /// Create a shared instance
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        self.base_wall + self.base_instant.elapsed()
    }
}

/// 手动推进的时钟，用于确定性测试
/// Manually driven clock for deterministic tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis())),
        }
    }

    pub fn set(&self, timestamp: Timestamp) {
        self.millis.store(timestamp.as_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration_millis(duration), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}
