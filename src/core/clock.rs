//! Injectable Clock
//!
//! The round runtime never calls `tokio::time` or `Utc::now()` directly.
//! It reads time and waits for deadlines through a [`Clock`], so tests can
//! drive whole rounds on simulated time without wall-clock delays.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;

/// Time source for the scheduler.
///
/// `now()` is monotonic and measured from an arbitrary clock-specific origin.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock's origin.
    fn now(&self) -> Duration;

    /// Wall-clock timestamp for records and events.
    fn wall_time(&self) -> DateTime<Utc>;

    /// Wait until `now() >= deadline`.
    async fn sleep_until(&self, deadline: Duration);
}

/// Real time backed by tokio's timer.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is "now".
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: Duration) {
        tokio::time::sleep_until(self.origin + deadline).await;
    }
}

/// Simulated time for tests.
///
/// `sleep_until` jumps the clock forward to the deadline and yields once,
/// so pending commands still get a chance to run before the timer fires.
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicU64,
    epoch: DateTime<Utc>,
}

impl ManualClock {
    /// Create a manual clock at time zero.
    pub fn new() -> Self {
        Self {
            nanos: AtomicU64::new(0),
            epoch: Utc
                .timestamp_opt(1_700_000_000, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Set the clock to an absolute offset (never moves backwards).
    pub fn set(&self, to: Duration) {
        self.nanos.fetch_max(to.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn wall_time(&self) -> DateTime<Utc> {
        self.epoch + chrono::Duration::from_std(self.now()).unwrap_or_else(|_| chrono::Duration::zero())
    }

    async fn sleep_until(&self, deadline: Duration) {
        self.set(deadline);
        tokio::task::yield_now().await;
    }
}
