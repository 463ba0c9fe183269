//! Integration tests for event deduplication.
//!
//! A provider may redeliver an event any number of times; the processor
//! must run once and every redelivery must still be acknowledged.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use payhook_core::{Clock, EventKind, PipelineEvent, RecordStatus};
use payhook_pipeline::{EventStore, ProcessResult, ProcessorDescriptor, ProcessorRegistry};
use payhook_testing::{EventBuilder, PipelineHarness, ScriptedProcessor};

fn registry(processor: &ScriptedProcessor) -> ProcessorRegistry {
    ProcessorRegistry::new()
        .with_processor(ProcessorDescriptor::for_kind(EventKind::PaymentCreated, processor.clone()))
}

#[tokio::test]
async fn second_delivery_is_acknowledged_as_duplicate() {
    let processor = ScriptedProcessor::succeed();
    let harness = PipelineHarness::new(registry(&processor)).unwrap();

    let first = harness.ingest("evt_1", "payment.created").await.unwrap();
    assert!(first.accepted);
    assert!(!first.duplicate);
    assert!(first.job_id.is_some());

    let second = harness.ingest("evt_1", "payment.created").await.unwrap();
    assert!(second.accepted);
    assert!(second.duplicate);
    assert_eq!(second.job_id, None);

    assert_eq!(harness.pipeline.queue_depth().await, 1);
    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 1);
    assert_eq!(harness.record_status("evt_1").await.unwrap(), RecordStatus::Processed);
}

#[tokio::test]
async fn repeated_deliveries_invoke_processor_once() {
    let processor = ScriptedProcessor::succeed();
    let harness = PipelineHarness::new(registry(&processor)).unwrap();

    for _ in 0..25 {
        let outcome = harness.ingest("evt_many", "payment.created").await.unwrap();
        assert!(outcome.accepted);
    }
    harness.run_until_idle().await.unwrap();

    // Redeliveries after processing are still duplicates.
    let late = harness.ingest("evt_many", "payment.created").await.unwrap();
    assert!(late.duplicate);
    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 1);
    let metrics = harness.pipeline.metrics().await;
    assert_eq!(metrics.for_type("payment.created").duplicates, 25);
    assert_eq!(metrics.for_type("payment.created").succeeded, 1);
}

#[tokio::test]
async fn redelivery_after_dead_letter_is_not_reprocessed() {
    let processor = ScriptedProcessor::fatal();
    let harness = PipelineHarness::new(registry(&processor)).unwrap();

    harness.ingest("evt_dead", "payment.created").await.unwrap();
    harness.run_until_idle().await.unwrap();
    assert_eq!(harness.record_status("evt_dead").await.unwrap(), RecordStatus::Failed);

    let outcome = harness.ingest("evt_dead", "payment.created").await.unwrap();
    assert!(outcome.duplicate);
    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 1);
    assert_eq!(harness.pipeline.dead_letters().await.unwrap().len(), 1);
}

#[tokio::test]
async fn job_for_already_processed_event_is_skipped() {
    let processor = ScriptedProcessor::succeed();
    let harness = PipelineHarness::new(registry(&processor)).unwrap();

    let event = EventBuilder::with_defaults().id("evt_raced").build();
    harness.ingest_event(event.clone()).await.unwrap();

    // Another replica finished the event while our job sat in the queue.
    harness
        .events
        .mark_processed(&event, ProcessResult::success(), harness.clock.now())
        .await
        .unwrap();

    harness.run_until_idle().await.unwrap();

    assert_eq!(processor.invocations(), 0);
    assert_eq!(harness.recorder.duplicate_count().await, 1);
    assert_eq!(harness.recorder.succeeded_count().await, 0);
    assert!(matches!(harness.recorder.events().await[0], PipelineEvent::DuplicateSkipped(_)));
    assert_eq!(harness.record_status("evt_raced").await.unwrap(), RecordStatus::Processed);
}

#[tokio::test]
async fn distinct_ids_are_all_processed() {
    let processor = ScriptedProcessor::succeed();
    let harness = PipelineHarness::new(registry(&processor)).unwrap();

    for i in 0..10 {
        harness.ingest(&format!("evt_{i}"), "payment.created").await.unwrap();
    }
    let dispatched = harness.run_until_idle().await.unwrap();

    assert_eq!(dispatched, 10);
    assert_eq!(processor.invocations(), 10);
    assert_eq!(harness.events.len().await, 10);
}
