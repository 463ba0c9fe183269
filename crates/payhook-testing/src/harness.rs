//! Pipeline wired to a test clock and inspectable stores.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use payhook_core::{EventRecord, RecordStatus, TestClock, WebhookEvent};
use payhook_pipeline::{
    IngestOutcome, InMemoryDeadLetterStore, InMemoryEventStore, PipelineConfig, ProcessorRegistry,
    RetryPolicy, WebhookPipeline,
};

use crate::{events::RecordingEventHandler, fixtures::EventBuilder};

/// Installs a test-writer tracing subscriber once per process.
///
/// Honours `RUST_LOG`, defaulting to errors only.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_test_writer()
        .try_init();
}

/// A pipeline plus handles to everything it was wired with.
pub struct PipelineHarness {
    /// Pipeline under test.
    pub pipeline: WebhookPipeline,
    /// Shared virtual clock.
    pub clock: TestClock,
    /// Event store, for failure injection and inspection.
    pub events: Arc<InMemoryEventStore>,
    /// Dead-letter store, for failure injection and inspection.
    pub dead_letters: Arc<InMemoryDeadLetterStore>,
    /// Lifecycle notification recorder.
    pub recorder: Arc<RecordingEventHandler>,
}

impl PipelineHarness {
    /// Deterministic engine configuration: two workers, 1s base backoff
    /// without jitter, three attempts.
    pub fn test_config() -> PipelineConfig {
        PipelineConfig {
            worker_count: 2,
            default_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default().without_jitter(),
            shutdown_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_millis(10),
            ..PipelineConfig::default()
        }
    }

    /// Builds a harness with [`Self::test_config`].
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline cannot be built.
    pub fn new(registry: ProcessorRegistry) -> Result<Self> {
        Self::with_config(registry, Self::test_config())
    }

    /// Builds a harness with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn with_config(registry: ProcessorRegistry, config: PipelineConfig) -> Result<Self> {
        init_test_tracing();

        let clock = TestClock::new();
        let events = Arc::new(InMemoryEventStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let recorder = Arc::new(RecordingEventHandler::new());

        let pipeline = WebhookPipeline::builder(registry)
            .config(config)
            .clock(Arc::new(clock.clone()))
            .event_store(events.clone())
            .dead_letter_store(dead_letters.clone())
            .event_handler(recorder.clone())
            .build()?;

        Ok(Self { pipeline, clock, events, dead_letters, recorder })
    }

    /// Ingests a fresh event of `event_type` with the given id.
    ///
    /// # Errors
    ///
    /// Returns error if ingestion fails.
    pub async fn ingest(&self, id: &str, event_type: &str) -> Result<IngestOutcome> {
        let event = EventBuilder::with_defaults().id(id).event_type(event_type).build();
        self.ingest_event(event).await
    }

    /// Ingests a prepared event.
    ///
    /// # Errors
    ///
    /// Returns error if ingestion fails.
    pub async fn ingest_event(&self, event: WebhookEvent) -> Result<IngestOutcome> {
        Ok(self.pipeline.ingest(event).await?)
    }

    /// Drains the queue on the test task.
    ///
    /// # Errors
    ///
    /// Returns error if a dispatch fails.
    pub async fn run_until_idle(&self) -> Result<usize> {
        Ok(self.pipeline.run_until_idle().await?)
    }

    /// Event store record for `id`.
    ///
    /// # Errors
    ///
    /// Returns error if the id is empty, the store fails, or no record exists.
    pub async fn record(&self, id: &str) -> Result<EventRecord> {
        let event_id = payhook_core::EventId::new(id)?;
        self.pipeline
            .event_record(&event_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no event record for {id}"))
    }

    /// Status of the event store record for `id`.
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be read.
    pub async fn record_status(&self, id: &str) -> Result<RecordStatus> {
        Ok(self.record(id).await?.status)
    }
}
