//! Core domain models, clock abstraction and lifecycle events.
//!
//! Provides the strongly-typed primitives every payhook crate shares: the
//! inbound [`WebhookEvent`], the queued [`Job`] and its status lifecycle,
//! handler results, and the audit records handed to the event and
//! dead-letter stores.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DuplicateSkippedEvent, EventHandler, JobDeadLetteredEvent, JobSucceededEvent,
    MulticastEventHandler, NoOpEventHandler, PipelineEvent, RetryScheduledEvent,
};
pub use models::{
    DeadLetter, EventId, EventKind, EventRecord, Job, JobContext, JobId, JobStatus, Priority,
    ProcessResult, RecordStatus, WebhookEvent,
};
pub use time::{Clock, RealClock, TestClock};
