//! Integration tests for retry scheduling and dead-lettering.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use payhook_core::{Clock, PipelineEvent, RecordStatus};
use payhook_pipeline::{ProcessorDescriptor, ProcessorRegistry};
use payhook_testing::{PipelineHarness, ScriptedProcessor};

fn registry(processor: &ScriptedProcessor) -> ProcessorRegistry {
    ProcessorRegistry::new()
        .with_processor(ProcessorDescriptor::new("payment.updated", processor.clone()))
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let processor = ScriptedProcessor::fail_times(2);
    let harness = PipelineHarness::new(registry(&processor)).unwrap();

    harness.ingest("evt_3", "payment.updated").await.unwrap();
    let dispatched = harness.run_until_idle().await.unwrap();

    assert_eq!(dispatched, 3);
    assert_eq!(processor.attempts_seen().await, vec![0, 1, 2]);

    let record = harness.record("evt_3").await.unwrap();
    assert_eq!(record.status, RecordStatus::Processed);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.result.unwrap().metadata["attempts"], 3);

    // 1s then 2s of backoff without jitter.
    assert_eq!(harness.clock.elapsed(), Duration::from_secs(3));
    assert_eq!(harness.recorder.retry_count().await, 2);
    assert_eq!(harness.recorder.succeeded_count().await, 1);
    assert!(harness.pipeline.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_notifications_carry_backoff_schedule() {
    let processor = ScriptedProcessor::fail_times(1);
    let harness = PipelineHarness::new(registry(&processor)).unwrap();
    let started = harness.clock.now();

    harness.ingest("evt_sched", "payment.updated").await.unwrap();
    harness.run_until_idle().await.unwrap();

    let events = harness.recorder.events().await;
    let PipelineEvent::RetryScheduled(retry) = &events[0] else {
        panic!("expected a retry notification first, got {:?}", events[0]);
    };
    assert_eq!(retry.next_attempt, 1);
    assert_eq!(retry.next_run_at, started + chrono::Duration::seconds(1));
    assert_eq!(retry.error, "handler failed: scripted failure 1");

    let PipelineEvent::JobSucceeded(done) = &events[1] else {
        panic!("expected success notification, got {:?}", events[1]);
    };
    assert_eq!(done.attempts, 2);
    assert_eq!(done.latency_ms, 1000);
}

#[tokio::test]
async fn exhausted_retries_move_job_to_dead_letters() {
    let processor = ScriptedProcessor::always_fail();
    let harness = PipelineHarness::new(registry(&processor)).unwrap();

    harness.ingest("evt_exhaust", "payment.updated").await.unwrap();
    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 3);

    let dead_letters = harness.pipeline.dead_letters().await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    let dead = &dead_letters[0];
    assert_eq!(dead.event.id.as_str(), "evt_exhaust");
    assert_eq!(dead.attempts, 3);
    assert_eq!(dead.reason, "maximum attempts (3) reached");
    assert_eq!(dead.error_history.len(), 3);
    assert!(dead.error_history.iter().all(|e| e == "handler failed: downstream unavailable"));

    assert_eq!(harness.record_status("evt_exhaust").await.unwrap(), RecordStatus::Failed);
    assert_eq!(harness.pipeline.queue_depth().await, 0);

    let metrics = harness.pipeline.metrics().await;
    let counters = metrics.for_type("payment.updated");
    assert_eq!(counters.attempted, 3);
    assert_eq!(counters.failed, 3);
    assert_eq!(counters.dead_lettered, 1);
    assert_eq!(metrics.failures_by_category["handler"], 3);
    assert_eq!(metrics.success_rate("payment.updated"), Some(0.0));
}

#[tokio::test]
async fn fatal_failure_is_not_retried() {
    let processor = ScriptedProcessor::fatal();
    let harness = PipelineHarness::new(registry(&processor)).unwrap();

    harness.ingest("evt_fatal", "payment.updated").await.unwrap();
    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 1);
    assert_eq!(harness.recorder.retry_count().await, 0);

    let dead = harness.pipeline.dead_letters().await.unwrap().remove(0);
    assert_eq!(dead.reason, "non-retryable failure");
    assert_eq!(dead.attempts, 1);
    assert_eq!(dead.last_error(), Some("handler failed: malformed payload"));
    assert_eq!(harness.clock.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn descriptor_attempt_ceiling_overrides_policy() {
    let processor = ScriptedProcessor::always_fail();
    let registry = ProcessorRegistry::new().with_processor(
        ProcessorDescriptor::new("payment.updated", processor.clone()).with_max_attempts(5),
    );
    let harness = PipelineHarness::new(registry).unwrap();

    harness.ingest("evt_five", "payment.updated").await.unwrap();
    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 5);
    assert_eq!(processor.attempts_seen().await, vec![0, 1, 2, 3, 4]);
    // 1 + 2 + 4 + 8 seconds between the five attempts.
    assert_eq!(harness.clock.elapsed(), Duration::from_secs(15));
}

#[tokio::test]
async fn single_attempt_jobs_dead_letter_on_first_failure() {
    let processor = ScriptedProcessor::always_fail();
    let registry = ProcessorRegistry::new().with_processor(
        ProcessorDescriptor::new("payment.updated", processor.clone()).with_max_attempts(1),
    );
    let harness = PipelineHarness::new(registry).unwrap();

    harness.ingest("evt_once", "payment.updated").await.unwrap();
    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 1);
    let dead = harness.pipeline.dead_letters().await.unwrap().remove(0);
    assert_eq!(dead.reason, "maximum attempts (1) reached");
}

#[tokio::test]
async fn backing_off_job_does_not_block_other_work() {
    let failing = ScriptedProcessor::fail_times(1);
    let healthy = ScriptedProcessor::succeed();
    let registry = ProcessorRegistry::new()
        .with_processor(ProcessorDescriptor::new("payment.updated", failing.clone()))
        .with_processor(ProcessorDescriptor::new("payment.created", healthy.clone()));
    let harness = PipelineHarness::new(registry).unwrap();

    harness.ingest("evt_flaky", "payment.updated").await.unwrap();
    assert!(harness.pipeline.process_next().await.unwrap());

    harness.ingest("evt_healthy", "payment.created").await.unwrap();
    assert!(harness.pipeline.process_next().await.unwrap());
    assert_eq!(healthy.invocations(), 1);

    // Retry is not due yet.
    assert!(!harness.pipeline.process_next().await.unwrap());
    assert_eq!(harness.pipeline.queue_depth().await, 1);

    harness.clock.advance(Duration::from_secs(1));
    assert!(harness.pipeline.process_next().await.unwrap());
    assert_eq!(failing.invocations(), 2);
    assert_eq!(harness.record_status("evt_flaky").await.unwrap(), RecordStatus::Processed);
}
