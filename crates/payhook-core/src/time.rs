//! Time abstractions for testable scheduling.
//!
//! The queue and the retry scheduler reason in wall-clock timestamps
//! (`next_run_at`), while latency measurements want a monotonic source.
//! Both come from an injected [`Clock`] so retry schedules can be tested
//! without real timers.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses [`RealClock`]; tests inject [`TestClock`] to control
/// time explicitly.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Current monotonic instant for duration measurements.
    fn instant(&self) -> Instant;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to `tokio::time::sleep`; the test clock
    /// advances virtual time instead.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Sleeps until `deadline`, returning immediately if it already passed.
    fn sleep_until(
        &self,
        deadline: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let wait = (deadline - self.now()).to_std().unwrap_or(Duration::ZERO);
        self.sleep(wait)
    }
}

/// Real clock backed by the system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test clock for deterministic time control.
///
/// Clones share the same underlying time, so a clock handed to the pipeline
/// can be advanced from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    start: DateTime<Utc>,
    /// Wall-clock offset from `start`, may go backwards via `set`
    wall_offset_ns: Arc<AtomicI64>,
    /// Monotonic nanoseconds since creation, only ever grows
    monotonic_ns: Arc<AtomicU64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self {
            start,
            wall_offset_ns: Arc::new(AtomicI64::new(0)),
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            base_instant: Instant::now(),
        }
    }

    /// Advances wall-clock and monotonic time.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.monotonic_ns.fetch_add(ns, Ordering::AcqRel);
        self.wall_offset_ns.fetch_add(i64::try_from(ns).unwrap_or(i64::MAX), Ordering::AcqRel);
    }

    /// Jumps wall-clock time to `time`; monotonic time only moves forward.
    pub fn set(&self, time: DateTime<Utc>) {
        let target = (time - self.start).num_nanoseconds().unwrap_or(i64::MAX);
        let previous = self.wall_offset_ns.swap(target, Ordering::AcqRel);
        if target > previous {
            let forward = u64::try_from(target - previous).unwrap_or(0);
            self.monotonic_ns.fetch_add(forward, Ordering::AcqRel);
        }
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::nanoseconds(self.wall_offset_ns.load(Ordering::Acquire))
    }

    fn instant(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_clock_advances_both_sources() {
        let clock = TestClock::new();
        let wall = clock.now();
        let mono = clock.instant();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now() - wall, chrono::Duration::seconds(10));
        assert_eq!(clock.instant().duration_since(mono), Duration::from_secs(10));
    }

    #[test]
    fn set_can_move_wall_clock_backwards() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = TestClock::with_start_time(start);

        clock.set(start + chrono::Duration::minutes(5));
        assert_eq!(clock.elapsed(), Duration::from_secs(300));

        clock.set(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.elapsed(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn sleep_until_advances_to_deadline() {
        let clock = TestClock::new();
        let deadline = clock.now() + chrono::Duration::seconds(5);

        clock.sleep_until(deadline).await;
        assert_eq!(clock.now(), deadline);

        clock.sleep_until(deadline - chrono::Duration::seconds(1)).await;
        assert_eq!(clock.now(), deadline);
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let handle = clock.clone();
        handle.advance(Duration::from_millis(250));
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }
}
