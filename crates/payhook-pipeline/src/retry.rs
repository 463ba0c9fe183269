//! Exponential backoff with additive jitter.
//!
//! The delay after a failed attempt doubles with every attempt up to a cap,
//! then gets a random jitter added so that a burst of failures (a downstream
//! outage) does not come back as a synchronized burst of retries. The
//! jittered value is clamped to the cap again, so no retry is ever scheduled
//! further out than `max_delay`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{PipelineError, Result};

/// Retry policy shared by every processor that does not override it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of handler invocations, including the first.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Upper bound on any delay, jitter included.
    pub max_delay: Duration,

    /// Upper bound of the uniform jitter added to each delay. `None` uses
    /// `base_delay`; zero disables jitter.
    pub max_jitter: Option<Duration>,

    /// Fixed seed for the jitter source. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_jitter: None,
            seed: None,
        }
    }
}

impl RetryPolicy {
    /// Disables jitter, making delays exact powers of two of `base_delay`.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Some(Duration::ZERO);
        self
    }

    /// Fixes the jitter seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks the policy for values that would make retries meaningless.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max_attempts` is zero or the base
    /// delay exceeds the maximum delay.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PipelineError::configuration("max_attempts must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(PipelineError::configuration(format!(
                "base_delay ({:?}) must not exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Effective jitter ceiling, falling back to `base_delay`.
    pub fn jitter_ceiling(&self) -> Duration {
        self.max_jitter.unwrap_or(self.base_delay)
    }

    /// Creates the jitter source described by `seed`.
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}

/// Delay after the failed attempt with zero-based index `attempt`, before
/// jitter: `min(base * 2^attempt, max)`.
pub fn exponential_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Computes the backoff after the failed attempt with zero-based index
/// `attempt`.
///
/// Deterministic for a given `rng` state. Never exceeds `policy.max_delay`.
pub fn compute_backoff<R: Rng>(attempt: u32, policy: &RetryPolicy, rng: &mut R) -> Duration {
    let delay = exponential_delay(attempt, policy.base_delay, policy.max_delay);
    delay.saturating_add(sample_jitter(policy.jitter_ceiling(), rng)).min(policy.max_delay)
}

fn sample_jitter<R: Rng>(max_jitter: Duration, rng: &mut R) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }
    let ceiling = u64::try_from(max_jitter.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rng.random_range(0..=ceiling))
}

/// Adds `delay` to `now`, saturating at the latest representable instant.
pub fn schedule_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Retry scheduler owning the jitter source shared by all workers.
#[derive(Debug)]
pub struct BackoffScheduler {
    policy: RetryPolicy,
    rng: Mutex<StdRng>,
}

impl BackoffScheduler {
    /// Creates a scheduler seeded from the policy.
    pub fn new(policy: RetryPolicy) -> Self {
        let rng = Mutex::new(policy.rng());
        Self { policy, rng }
    }

    /// The policy delays are computed from.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Draws the next backoff for a failed attempt.
    pub async fn next_delay(&self, attempt: u32) -> Duration {
        let mut rng = self.rng.lock().await;
        compute_backoff(attempt, &self.policy, &mut *rng)
    }

    /// Runs `f` with exclusive access to the jitter source.
    pub(crate) async fn with_rng<T>(&self, f: impl FnOnce(&RetryPolicy, &mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().await;
        f(&self.policy, &mut *rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_without_jitter() -> RetryPolicy {
        RetryPolicy::default().without_jitter()
    }

    #[test]
    fn exponential_backoff_increases_correctly() {
        let policy = policy_without_jitter();
        let mut rng = StdRng::seed_from_u64(7);

        let delays: Vec<_> =
            (0..5).map(|attempt| compute_backoff(attempt, &policy, &mut rng)).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
    }

    #[test]
    fn max_delay_enforced() {
        let policy = policy_without_jitter();
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(compute_backoff(6, &policy, &mut rng), Duration::from_secs(60));
        assert_eq!(compute_backoff(40, &policy, &mut rng), Duration::from_secs(60));
        assert_eq!(compute_backoff(u32::MAX, &policy, &mut rng), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy =
            RetryPolicy { max_jitter: Some(Duration::from_millis(500)), ..Default::default() };
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..50 {
            let delay = compute_backoff(1, &policy, &mut rng);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(2_500));
            seen.insert(delay);
        }

        assert!(seen.len() > 1, "jitter should vary the delay");
    }

    #[test]
    fn default_jitter_follows_base_delay() {
        let policy = RetryPolicy { base_delay: Duration::from_millis(100), ..Default::default() };
        assert_eq!(policy.jitter_ceiling(), Duration::from_millis(100));

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let first = compute_backoff(0, &policy, &mut rng);
            assert!(first >= Duration::from_millis(100));
            assert!(first <= Duration::from_millis(200), "first backoff {first:?} exceeds 2x base");

            let third = compute_backoff(2, &policy, &mut rng);
            assert!(third >= Duration::from_millis(400));
            assert!(third <= Duration::from_millis(500));
        }
    }

    #[test]
    fn explicit_zero_jitter_is_exact() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(250),
            max_jitter: Some(Duration::ZERO),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(compute_backoff(1, &policy, &mut rng), Duration::from_millis(500));
    }

    #[test]
    fn jittered_delay_clamped_to_max() {
        let policy = RetryPolicy {
            max_jitter: Some(Duration::from_secs(30)),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(3);

        for attempt in 0..10 {
            assert!(compute_backoff(attempt, &policy, &mut rng) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn same_seed_same_schedule() {
        let policy = RetryPolicy::default().with_seed(99);
        let first: Vec<_> = {
            let mut rng = policy.rng();
            (0..4).map(|a| compute_backoff(a, &policy, &mut rng)).collect()
        };
        let second: Vec<_> = {
            let mut rng = policy.rng();
            (0..4).map(|a| compute_backoff(a, &policy, &mut rng)).collect()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn validate_rejects_inconsistent_policies() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..Default::default() }.validate().is_err());
        assert!(RetryPolicy {
            base_delay: Duration::from_secs(120),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn schedule_after_saturates() {
        let now = Utc::now();
        assert_eq!(schedule_after(now, Duration::from_secs(5)), now + chrono::Duration::seconds(5));
        assert_eq!(schedule_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn scheduler_draws_from_seeded_source() {
        let policy = RetryPolicy::default().with_seed(5);
        let scheduler = BackoffScheduler::new(policy.clone());
        let mut rng = policy.rng();

        assert_eq!(scheduler.next_delay(0).await, compute_backoff(0, &policy, &mut rng));
        assert_eq!(scheduler.next_delay(2).await, compute_backoff(2, &policy, &mut rng));
    }
}
