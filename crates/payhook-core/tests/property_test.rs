//! Property-based tests for job lifecycle invariants.
//!
//! Drives jobs through arbitrary sequences of requested transitions and
//! checks that the lifecycle rules hold no matter what callers ask for.

use chrono::Utc;
use payhook_core::{EventId, Job, JobStatus, Priority, WebhookEvent};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use serde_json::json;

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 128, failure_persistence: None, ..ProptestConfig::default() }
}

fn status_strategy() -> impl Strategy<Value = JobStatus> {
    prop::sample::select(vec![
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Succeeded,
        JobStatus::FailedRetryable,
        JobStatus::FailedTerminal,
    ])
}

fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop::sample::select(Priority::ALL.to_vec())
}

fn new_job() -> Job {
    let event = WebhookEvent::new(
        EventId::new("evt_prop").unwrap(),
        "payment.updated",
        json!({}),
        Utc::now(),
    );
    Job::new(event, Priority::Normal, 3, Utc::now())
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Once terminal, no requested transition is ever accepted.
    #[test]
    fn terminal_jobs_stay_terminal(requests in prop::collection::vec(status_strategy(), 1..40)) {
        let mut job = new_job();
        let mut reached_terminal = None;

        for next in requests {
            let before = job.status;
            let accepted = job.transition(next).is_ok();

            if let Some(terminal) = reached_terminal {
                prop_assert!(!accepted);
                prop_assert_eq!(job.status, terminal);
            } else if accepted {
                prop_assert!(before.can_transition_to(next));
            } else {
                prop_assert_eq!(job.status, before);
            }

            if job.status.is_terminal() {
                reached_terminal = Some(job.status);
            }
        }
    }

    /// The derived ordering agrees with the position in `Priority::ALL`.
    #[test]
    fn priority_order_matches_index(a in priority_strategy(), b in priority_strategy()) {
        prop_assert_eq!(a.cmp(&b), a.index().cmp(&b.index()));
    }
}
