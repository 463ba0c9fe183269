//! Integration tests for event and dead-letter store outages.

#![allow(clippy::unwrap_used)]

use payhook_core::RecordStatus;
use payhook_pipeline::{IngestError, ProcessorDescriptor, ProcessorRegistry, StoreOperation};
use payhook_testing::{PipelineHarness, ScriptedProcessor};

fn harness_with(processor: &ScriptedProcessor) -> PipelineHarness {
    let registry = ProcessorRegistry::new()
        .with_processor(ProcessorDescriptor::new("payment.created", processor.clone()));
    PipelineHarness::new(registry).unwrap()
}

#[tokio::test]
async fn ingest_fails_while_event_store_is_down() {
    let processor = ScriptedProcessor::succeed();
    let harness = harness_with(&processor);

    harness.events.set_unavailable(true).await;
    let event = payhook_testing::EventBuilder::with_defaults().id("evt_down").build();
    let error = harness.pipeline.ingest(event.clone()).await.unwrap_err();
    assert!(matches!(error, IngestError::StoreUnavailable { .. }));
    assert_eq!(harness.pipeline.queue_depth().await, 0);

    // The provider retries the delivery once the store is back.
    harness.events.set_unavailable(false).await;
    let outcome = harness.pipeline.ingest(event).await.unwrap();
    assert!(!outcome.duplicate);

    harness.run_until_idle().await.unwrap();
    assert_eq!(processor.invocations(), 1);
}

#[tokio::test]
async fn unrecorded_success_is_not_reprocessed() {
    let processor = ScriptedProcessor::succeed();
    let harness = harness_with(&processor);
    harness.events.fail_next(StoreOperation::MarkProcessed, 1).await;

    harness.ingest("evt_write", "payment.created").await.unwrap();
    let dispatched = harness.run_until_idle().await.unwrap();

    assert_eq!(dispatched, 2);
    assert_eq!(processor.invocations(), 1);
    assert_eq!(harness.recorder.retry_count().await, 1);
    assert_eq!(harness.recorder.succeeded_count().await, 1);

    let record = harness.record("evt_write").await.unwrap();
    assert_eq!(record.status, RecordStatus::Processed);
    assert_eq!(record.attempts, 1);
    assert_eq!(harness.pipeline.metrics().await.failures_by_category["store"], 1);
}

#[tokio::test]
async fn persistent_write_failure_dead_letters_with_result_metadata() {
    let processor = ScriptedProcessor::succeed();
    let harness = harness_with(&processor);
    harness.events.fail_next(StoreOperation::MarkProcessed, 3).await;

    harness.ingest("evt_lost_write", "payment.created").await.unwrap();
    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 1);
    let dead = harness.pipeline.dead_letters().await.unwrap().remove(0);
    assert_eq!(dead.reason, "maximum attempts (3) reached");
    assert!(dead.last_error().unwrap().starts_with("store unavailable"));
    assert_eq!(dead.metadata["attempts"], 1);
}

#[tokio::test]
async fn claim_failure_is_retried() {
    let processor = ScriptedProcessor::succeed();
    let harness = harness_with(&processor);
    harness.events.fail_next(StoreOperation::TryClaim, 1).await;

    harness.ingest("evt_claim", "payment.created").await.unwrap();
    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 1);
    assert_eq!(processor.attempts_seen().await, vec![1]);
    assert_eq!(harness.record_status("evt_claim").await.unwrap(), RecordStatus::Processed);
}

#[tokio::test]
async fn failed_release_still_allows_the_retry_to_claim() {
    let processor = ScriptedProcessor::fail_times(1);
    let harness = harness_with(&processor);
    harness.events.fail_next(StoreOperation::Release, 1).await;

    harness.ingest("evt_release", "payment.created").await.unwrap();
    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 2);
    let record = harness.record("evt_release").await.unwrap();
    assert_eq!(record.status, RecordStatus::Processed);
    assert_eq!(record.attempts, 2);
}

#[tokio::test]
async fn dead_letter_write_is_retried_until_accepted() {
    let processor = ScriptedProcessor::fatal();
    let harness = harness_with(&processor);
    harness.dead_letters.fail_next_puts(2).await;

    harness.ingest("evt_dlq", "payment.created").await.unwrap();
    harness.run_until_idle().await.unwrap();

    let dead_letters = harness.pipeline.dead_letters().await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].event.id.as_str(), "evt_dlq");
    assert_eq!(harness.recorder.dead_lettered_count().await, 1);
}

#[tokio::test]
async fn failed_record_write_is_retried_before_dead_lettering_completes() {
    let processor = ScriptedProcessor::fatal();
    let harness = harness_with(&processor);
    harness.events.fail_next(StoreOperation::MarkFailed, 2).await;

    harness.ingest("evt_mark_failed", "payment.created").await.unwrap();
    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 1);
    let record = harness.record("evt_mark_failed").await.unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.claimed_by, None);

    let dead_letters = harness.pipeline.dead_letters().await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].event.id.as_str(), "evt_mark_failed");
    assert_eq!(harness.recorder.dead_lettered_count().await, 1);
}
