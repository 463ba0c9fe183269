//! Lifecycle notifications published by the dispatcher.
//!
//! The pipeline itself does no alerting. Anything that wants to react to a
//! job finishing (paging on dead letters, audit exports) subscribes through
//! [`EventHandler`] without the dispatcher knowing about it.
//!
//! ```text
//! ┌────────────┐  JobSucceeded / RetryScheduled  ┌────────────────────┐
//! │ Dispatcher │ ───────────────────────────────▶│ MulticastHandler   │
//! └────────────┘  JobDeadLettered / Duplicate    └────────────────────┘
//!                                                     │      │
//!                                                     ▼      ▼
//!                                               alerting   audit log
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EventId, JobId, Priority};

/// Notifications emitted as jobs move through their lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Handler succeeded and the result was recorded.
    JobSucceeded(JobSucceededEvent),

    /// An attempt failed and the job was re-enqueued.
    RetryScheduled(RetryScheduledEvent),

    /// The job was moved to the dead-letter store.
    JobDeadLettered(JobDeadLetteredEvent),

    /// A redelivered event was acknowledged without running its handler.
    DuplicateSkipped(DuplicateSkippedEvent),
}

impl PipelineEvent {
    /// Event the notification is about.
    pub fn event_id(&self) -> &EventId {
        match self {
            Self::JobSucceeded(e) => &e.event_id,
            Self::RetryScheduled(e) => &e.event_id,
            Self::JobDeadLettered(e) => &e.event_id,
            Self::DuplicateSkipped(e) => &e.event_id,
        }
    }
}

/// Emitted when a job reaches SUCCEEDED after running its handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSucceededEvent {
    /// Job that finished.
    pub job_id: JobId,
    /// Event that was processed.
    pub event_id: EventId,
    /// Event type tag.
    pub event_type: String,
    /// Number of handler invocations (1-based).
    pub attempts: u32,
    /// Time from ingestion to completion.
    pub latency_ms: u64,
    /// When the job completed.
    pub completed_at: DateTime<Utc>,
}

/// Emitted when a failed attempt is rescheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryScheduledEvent {
    /// Job being retried.
    pub job_id: JobId,
    /// Event being retried.
    pub event_id: EventId,
    /// Event type tag.
    pub event_type: String,
    /// Zero-based index of the upcoming attempt.
    pub next_attempt: u32,
    /// Earliest dispatch time of the upcoming attempt.
    pub next_run_at: DateTime<Utc>,
    /// Error of the failed attempt.
    pub error: String,
}

/// Emitted when a job reaches FAILED_TERMINAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDeadLetteredEvent {
    /// Job that was given up on.
    pub job_id: JobId,
    /// Event that could not be processed.
    pub event_id: EventId,
    /// Event type tag.
    pub event_type: String,
    /// Priority of the job.
    pub priority: Priority,
    /// Attempts made.
    pub attempts: u32,
    /// Why the pipeline gave up.
    pub reason: String,
    /// Error of the final attempt.
    pub error: String,
    /// When the job was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

/// Emitted when a job is dropped because its event was already handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateSkippedEvent {
    /// Job that was skipped.
    pub job_id: JobId,
    /// Event that was already handled or is being handled elsewhere.
    pub event_id: EventId,
    /// Event type tag.
    pub event_type: String,
}

/// Subscriber to pipeline lifecycle notifications.
///
/// Implementations must not block the dispatcher for long and must not
/// fail: errors are theirs to log.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one notification.
    async fn handle_event(&self, event: PipelineEvent);
}

/// Handler that discards every notification.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: PipelineEvent) {}
}

/// Forwards every notification to all subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: PipelineEvent) {
        let deliveries = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move { handler.handle_event(event).await }
        });

        futures::future::join_all(deliveries).await;
    }
}
