//! Core domain models and strongly-typed identifiers.
//!
//! Defines inbound webhook events, queued jobs, processing results, and the
//! audit records the pipeline hands over to its stores once a job is
//! terminal. Job status transitions are validated here so every component
//! agrees on the lifecycle.

use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Provider-assigned event identifier.
///
/// This is the idempotency key of the pipeline: the payment provider may
/// redeliver the same notification any number of times, and every delivery
/// carries the same id.
///
/// # Example
///
/// ```
/// use payhook_core::models::EventId;
/// let event_id = EventId::new("evt_1").unwrap();
/// assert_eq!(event_id.as_str(), "evt_1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    /// Creates an event id, rejecting empty or whitespace-only input.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CoreError::empty_field("event id"));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for EventId {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

/// Identifier of one queued job.
///
/// A job id is minted once at enqueue time and survives retries, so log
/// lines for every attempt of the same job can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One inbound webhook notification, already verified by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Provider-assigned unique identifier (dedupe key).
    pub id: EventId,

    /// Type tag selecting a processor, e.g. `payment.created`.
    pub event_type: String,

    /// Opaque structured data specific to `event_type`.
    pub payload: Value,

    /// When the pipeline ingested the event.
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Creates a new event.
    pub fn new(
        id: EventId,
        event_type: impl Into<String>,
        payload: Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self { id, event_type: event_type.into(), payload, received_at }
    }

    /// Classifies the event type.
    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }
}

/// Webhook event types emitted by the payment provider.
///
/// Matching on this enum is exhaustive, so adding a provider event type
/// forces every classification site to decide how to treat it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A payment was created.
    PaymentCreated,
    /// A payment changed state (completed, cancelled, ...).
    PaymentUpdated,
    /// A refund was requested.
    RefundCreated,
    /// A refund changed state.
    RefundUpdated,
    /// A cardholder opened a dispute.
    DisputeCreated,
    /// A dispute moved to a new state.
    DisputeStateUpdated,
    /// An order was created.
    OrderCreated,
    /// An order was updated.
    OrderUpdated,
    /// An invoice received a payment.
    InvoicePaymentMade,
    /// Anything the pipeline has no dedicated handling for.
    Other(String),
}

impl EventKind {
    /// Parses a provider type tag. Unknown tags become `Other`.
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "payment.created" => Self::PaymentCreated,
            "payment.updated" => Self::PaymentUpdated,
            "refund.created" => Self::RefundCreated,
            "refund.updated" => Self::RefundUpdated,
            "dispute.created" => Self::DisputeCreated,
            "dispute.state.updated" => Self::DisputeStateUpdated,
            "order.created" => Self::OrderCreated,
            "order.updated" => Self::OrderUpdated,
            "invoice.payment_made" => Self::InvoicePaymentMade,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the provider type tag.
    pub fn as_str(&self) -> &str {
        match self {
            Self::PaymentCreated => "payment.created",
            Self::PaymentUpdated => "payment.updated",
            Self::RefundCreated => "refund.created",
            Self::RefundUpdated => "refund.updated",
            Self::DisputeCreated => "dispute.created",
            Self::DisputeStateUpdated => "dispute.state.updated",
            Self::OrderCreated => "order.created",
            Self::OrderUpdated => "order.updated",
            Self::InvoicePaymentMade => "invoice.payment_made",
            Self::Other(tag) => tag,
        }
    }

    /// Default scheduling priority for this kind of event.
    ///
    /// Disputes carry response deadlines, so they are never allowed to wait
    /// behind a payment backlog.
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::DisputeCreated | Self::DisputeStateUpdated => Priority::Critical,
            Self::PaymentCreated
            | Self::PaymentUpdated
            | Self::RefundCreated
            | Self::RefundUpdated => Priority::High,
            Self::OrderCreated | Self::OrderUpdated | Self::InvoicePaymentMade => Priority::Normal,
            Self::Other(_) => Priority::Low,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority of a job.
///
/// Variants are declared from most to least urgent, so the derived `Ord`
/// sorts `Critical` first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dispatched before anything else, regardless of age.
    Critical,
    /// Money-movement events.
    High,
    /// Regular business events.
    #[default]
    Normal,
    /// Unrecognised or informational events.
    Low,
}

impl Priority {
    /// All priorities, most urgent first.
    pub const ALL: [Self; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Position of this priority in [`Priority::ALL`].
    pub const fn index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// PENDING ──▶ IN_PROGRESS ──▶ SUCCEEDED
///    │  ▲          │
///    │  │          ├──▶ FAILED_RETRYABLE ──▶ PENDING (later)
///    │  └──────────┘
///    │             └──▶ FAILED_TERMINAL
///    └──▶ SUCCEEDED | FAILED_* (duplicate short-circuit, store failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue.
    Pending,
    /// A worker is running the handler.
    InProgress,
    /// Terminal success. The job is discarded.
    Succeeded,
    /// Failed, will be re-enqueued with a later `next_run_at`.
    FailedRetryable,
    /// Terminal failure. The job moves to the dead-letter store.
    FailedTerminal,
}

impl JobStatus {
    /// Returns true for states a job never leaves.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal)
    }

    /// Returns true if `next` is reachable from `self` in one step.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending,
                Self::InProgress | Self::Succeeded | Self::FailedRetryable | Self::FailedTerminal
            ) | (Self::InProgress, Self::Succeeded | Self::FailedRetryable | Self::FailedTerminal)
                | (Self::FailedRetryable, Self::Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::FailedRetryable => write!(f, "failed_retryable"),
            Self::FailedTerminal => write!(f, "failed_terminal"),
        }
    }
}

/// One attempt record wrapping an event as it moves through the queue.
///
/// The queue owns a job exclusively while it is pending or in progress.
/// Terminal jobs are moved, never cloned, into the dead-letter store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Stable id across retries.
    pub id: JobId,

    /// The wrapped event.
    pub event: WebhookEvent,

    /// Scheduling priority.
    pub priority: Priority,

    /// Number of attempts made so far (zero-based index of the next attempt).
    pub attempt: u32,

    /// Ceiling on attempts, always at least one.
    pub max_attempts: u32,

    /// The job must not be dispatched before this instant.
    pub next_run_at: DateTime<Utc>,

    /// Current lifecycle state.
    pub status: JobStatus,

    /// Error message of every failed attempt, oldest first.
    pub error_history: Vec<String>,

    /// Handler result still waiting to be persisted.
    ///
    /// Set when the handler succeeded but recording the result failed; the
    /// next attempt only retries the store write.
    pub pending_result: Option<ProcessResult>,

    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Creates a pending job that is ready immediately.
    pub fn new(
        event: WebhookEvent,
        priority: Priority,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            event,
            priority,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            next_run_at: now,
            status: JobStatus::Pending,
            error_history: Vec::new(),
            pending_result: None,
            enqueued_at: now,
        }
    }

    /// Moves the job to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::illegal_transition(self.status, next));
        }
        self.status = next;
        Ok(())
    }

    /// Returns true if a failure of the current attempt exhausts the job.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt.saturating_add(1) >= self.max_attempts
    }

    /// Most recent failure message, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.error_history.last().map(String::as_str)
    }

    /// Builds the handler-facing view of this job.
    pub fn context(&self, deadline: DateTime<Utc>, cancellation: CancellationToken) -> JobContext {
        JobContext {
            job_id: self.id,
            event_id: self.event.id.clone(),
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            deadline,
            cancellation,
        }
    }
}

/// What a handler is allowed to know about the job it runs for.
///
/// Queue internals stay hidden; handlers get identifiers for logging, the
/// attempt number for idempotency decisions, and a deadline they can watch.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job being processed.
    pub job_id: JobId,
    /// Event being processed.
    pub event_id: EventId,
    /// Zero-based attempt index.
    pub attempt: u32,
    /// Attempt ceiling for this job.
    pub max_attempts: u32,
    /// Wall-clock deadline after which the pipeline abandons the attempt.
    pub deadline: DateTime<Utc>,
    cancellation: CancellationToken,
}

impl JobContext {
    /// 1-based attempt number, convenient for log lines.
    pub fn attempt_number(&self) -> u32 {
        self.attempt.saturating_add(1)
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Returns true once the attempt timed out. Shutdown never cancels a
    /// running attempt.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the attempt times out.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }
}

/// Outcome reported by a handler.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessResult {
    /// Whether the business effect was applied.
    pub success: bool,

    /// Failure description.
    pub error: Option<String>,

    /// Whether a failure is transient.
    pub should_retry: bool,

    /// Free-form audit data.
    pub metadata: HashMap<String, Value>,
}

impl ProcessResult {
    /// Successful processing.
    pub fn success() -> Self {
        Self { success: true, ..Self::default() }
    }

    /// Transient failure that should be retried.
    pub fn retryable(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), should_retry: true, ..Self::default() }
    }

    /// Permanent failure; the job is dead-lettered immediately.
    pub fn fatal(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), should_retry: false, ..Self::default() }
    }

    /// Attaches an audit value.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Failure message, or a placeholder when the handler gave none.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("handler reported failure without a message")
    }
}

/// Processing state of an event as seen by the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Seen, waiting for (or between) attempts.
    Received,
    /// Claimed by a worker.
    InProgress,
    /// Business effect applied.
    Processed,
    /// Gave up; the job lives in the dead-letter store.
    Failed,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Durable audit record of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event this record describes.
    pub event_id: EventId,
    /// Type tag at first sighting.
    pub event_type: String,
    /// Current processing state.
    pub status: RecordStatus,
    /// Number of times a worker claimed the event.
    pub attempts: u32,
    /// Job currently holding the processing claim.
    pub claimed_by: Option<JobId>,
    /// Last recorded handler result.
    pub result: Option<ProcessResult>,
    /// First sighting.
    pub first_seen_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    /// Creates a record for a freshly seen event.
    pub fn received(event: &WebhookEvent, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            status: RecordStatus::Received,
            attempts: 0,
            claimed_by: None,
            result: None,
            first_seen_at: now,
            updated_at: now,
        }
    }
}

/// A job that exhausted its attempts or failed permanently.
///
/// Retained with the full error history for manual inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Job id, stable across the job's attempts.
    pub job_id: JobId,
    /// The event that could not be processed.
    pub event: WebhookEvent,
    /// Priority the job ran with.
    pub priority: Priority,
    /// Number of attempts made.
    pub attempts: u32,
    /// Why the pipeline gave up.
    pub reason: String,
    /// Error of every attempt, oldest first.
    pub error_history: Vec<String>,
    /// Metadata of the last handler result.
    pub metadata: HashMap<String, Value>,
    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When the job was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Takes ownership of a terminal job.
    pub fn from_job(
        job: Job,
        reason: impl Into<String>,
        metadata: HashMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job.id,
            attempts: job.attempt.saturating_add(1),
            event: job.event,
            priority: job.priority,
            reason: reason.into(),
            error_history: job.error_history,
            metadata,
            enqueued_at: job.enqueued_at,
            dead_lettered_at: now,
        }
    }

    /// Most recent error.
    pub fn last_error(&self) -> Option<&str> {
        self.error_history.last().map(String::as_str)
    }
}
