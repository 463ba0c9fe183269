//! Job state machine.
//!
//! [`next_transition`] is a pure function from "what happened during this
//! attempt" to "what happens to the job next". The dispatcher gathers the
//! [`AttemptOutcome`], asks for the [`Transition`], and applies it. Time and
//! randomness are parameters, so every path is testable without timers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use payhook_core::{Job, ProcessResult};
use rand::Rng;

use crate::{
    error::{ErrorCategory, PipelineError},
    retry::{compute_backoff, schedule_after, RetryPolicy},
};

/// What happened when a job was dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The event was already processed or is being processed by another
    /// job. The handler was not invoked.
    Duplicate,

    /// The handler returned a result.
    Completed(ProcessResult),

    /// The handler did not return within its timeout.
    TimedOut {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// The handler task panicked.
    Panicked {
        /// Panic message
        message: String,
    },

    /// A store call needed to claim or finalize the job failed.
    StoreFailed {
        /// Store error message
        message: String,
    },
}

impl AttemptOutcome {
    /// The failure this outcome represents, if any.
    pub fn error(&self) -> Option<PipelineError> {
        match self {
            Self::Duplicate => None,
            Self::Completed(result) if result.success => None,
            Self::Completed(result) => {
                Some(PipelineError::handler(result.error_message(), result.should_retry))
            },
            Self::TimedOut { timeout } => Some(PipelineError::handler_timeout(*timeout)),
            Self::Panicked { message } => Some(PipelineError::handler_panicked(message.clone())),
            Self::StoreFailed { message } => {
                Some(PipelineError::store_unavailable(message.clone()))
            },
        }
    }

    /// Metrics category of the failure, if any.
    pub fn category(&self) -> Option<ErrorCategory> {
        self.error().as_ref().map(ErrorCategory::from)
    }
}

/// Next step of a job after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The job is done.
    Succeed,

    /// Re-enqueue the job.
    Retry {
        /// Zero-based index of the upcoming attempt
        attempt: u32,
        /// Earliest dispatch time of the upcoming attempt
        next_run_at: DateTime<Utc>,
        /// Error of the failed attempt
        error: String,
    },

    /// Give up and move the job to the dead-letter store.
    DeadLetter {
        /// Why the pipeline gave up
        reason: String,
        /// Error of the final attempt
        error: String,
    },
}

/// Decides what happens to `job` after an attempt ended with `outcome`.
///
/// Timeouts and panics are treated exactly like a handler returning
/// `should_retry: true`. A failure is retried only while attempts remain;
/// the backoff comes from `policy` and `rng`.
pub fn next_transition<R: Rng>(
    job: &Job,
    outcome: &AttemptOutcome,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Transition {
    let Some(error) = outcome.error() else {
        return Transition::Succeed;
    };

    let message = error.to_string();

    if !error.is_retryable() {
        return Transition::DeadLetter {
            reason: "non-retryable failure".to_string(),
            error: message,
        };
    }

    if job.is_final_attempt() {
        return Transition::DeadLetter {
            reason: format!("maximum attempts ({}) reached", job.max_attempts),
            error: message,
        };
    }

    let delay = compute_backoff(job.attempt, policy, rng);
    Transition::Retry {
        attempt: job.attempt.saturating_add(1),
        next_run_at: schedule_after(now, delay),
        error: message,
    }
}
