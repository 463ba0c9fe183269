//! Webhook ingestion pipeline with idempotency and retry guarantees.
//!
//! Route handlers hand already verified provider events to
//! [`WebhookPipeline::ingest`], which deduplicates them against the event
//! store and enqueues a job. A pool of workers drains the queue in priority
//! order and runs the processor registered for each event type.
//!
//! # Architecture
//!
//! Each worker runs the complete job lifecycle:
//!
//! 1. **Wait** - Block until the highest-priority job is due
//! 2. **Claim** - Claim the event in the event store, skipping duplicates
//! 3. **Process** - Run the processor on its own task under a hard timeout
//! 4. **Finalize** - Record the result, then retry with backoff or
//!    dead-letter
//!
//! # Example
//!
//! ```no_run
//! use payhook_pipeline::{
//!     processor_fn, PipelineConfig, PipelineError, ProcessResult, ProcessorDescriptor,
//!     ProcessorRegistry, WebhookPipeline,
//! };
//!
//! # async fn example() -> Result<(), PipelineError> {
//! let registry = ProcessorRegistry::new().with_processor(ProcessorDescriptor::new(
//!     "payment.succeeded",
//!     processor_fn(|_event, _ctx| async move { ProcessResult::success() }),
//! ));
//!
//! let mut pipeline = WebhookPipeline::new(registry, PipelineConfig::default())?;
//! pipeline.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod store;
pub mod transition;
mod worker;
mod worker_pool;

pub use error::{ErrorCategory, IngestError, PipelineError, Result};
pub use metrics::{LatencySummary, MetricsSnapshot, PipelineMetrics, TypeCounters};
pub use payhook_core::{
    DeadLetter, EventId, EventKind, EventRecord, JobContext, JobId, JobStatus, Priority,
    ProcessResult, RecordStatus, WebhookEvent,
};
pub use pipeline::{IngestOutcome, PipelineBuilder, PipelineConfig, WebhookPipeline};
pub use queue::{JobSnapshot, PriorityQueue};
pub use registry::{
    processor_fn, FnProcessor, LogOnlyProcessor, Processor, ProcessorDescriptor,
    ProcessorRegistry, FALLBACK_EVENT_TYPE,
};
pub use retry::{BackoffScheduler, RetryPolicy};
pub use store::{
    ClaimOutcome, DeadLetterStore, EventStore, InMemoryDeadLetterStore, InMemoryEventStore,
    StoreFuture, StoreOperation,
};

/// Default number of concurrent workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default handler timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
