//! Error types for pipeline operations.
//!
//! Handler failures never leave the dispatcher as errors: they are folded
//! into the retry state machine. The variants here describe why an attempt
//! failed (for error history and metrics) and the infrastructure problems
//! that callers of the pipeline do see.

use std::{fmt, time::Duration};

use payhook_core::{CoreError, EventId};
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error conditions raised while ingesting, dispatching or finalizing jobs.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The event was already received. Informational: `ingest` reports it as
    /// an accepted duplicate instead of failing.
    #[error("event {event_id} was already received")]
    DuplicateEvent {
        /// Event that was redelivered
        event_id: EventId,
    },

    /// Handler did not return within its timeout.
    #[error("handler timed out after {timeout_ms}ms")]
    HandlerTimeout {
        /// Timeout that was exceeded, in milliseconds
        timeout_ms: u64,
    },

    /// Handler reported a business-level failure.
    #[error("handler failed: {message}")]
    HandlerError {
        /// Failure reported by the handler
        message: String,
        /// Whether the handler asked for a retry
        retryable: bool,
    },

    /// Handler task panicked.
    #[error("handler panicked: {message}")]
    HandlerPanicked {
        /// Panic payload, if it was a string
        message: String,
    },

    /// Event or dead-letter store could not be reached.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        /// Store error message
        message: String,
    },

    /// Invalid pipeline configuration.
    #[error("invalid pipeline configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the worker
        worker_id: usize,
        /// Join error description
        error: String,
    },

    /// A job was driven through an illegal lifecycle step.
    #[error(transparent)]
    Lifecycle(#[from] CoreError),
}

impl PipelineError {
    /// Creates a duplicate-event error.
    pub fn duplicate(event_id: EventId) -> Self {
        Self::DuplicateEvent { event_id }
    }

    /// Creates a handler timeout error.
    pub fn handler_timeout(timeout: Duration) -> Self {
        Self::HandlerTimeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a handler error.
    pub fn handler(message: impl Into<String>, retryable: bool) -> Self {
        Self::HandlerError { message: message.into(), retryable }
    }

    /// Creates a handler panic error.
    pub fn handler_panicked(message: impl Into<String>) -> Self {
        Self::HandlerPanicked { message: message.into() }
    }

    /// Creates a store unavailable error.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Determines if the failed attempt may be retried.
    ///
    /// Timeouts, panics and store outages are transient. Handler errors are
    /// retryable when the handler said so. Duplicates are not failures at
    /// all, and configuration or lifecycle errors will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HandlerTimeout { .. }
            | Self::HandlerPanicked { .. }
            | Self::StoreUnavailable { .. } => true,

            Self::HandlerError { retryable, .. } => *retryable,

            Self::DuplicateEvent { .. }
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::Lifecycle(_) => false,
        }
    }
}

/// Boundary error of [`crate::WebhookPipeline::ingest`].
///
/// Ingestion fails loudly so the provider redelivers; nothing is silently
/// dropped.
#[derive(Debug, Clone, Error)]
pub enum IngestError {
    /// The event store rejected the dedupe check.
    #[error("event store unavailable: {message}")]
    StoreUnavailable {
        /// Store error message
        message: String,
    },

    /// The pipeline was shut down and accepts no more events.
    #[error("pipeline is shut down")]
    ShutDown,
}

impl From<PipelineError> for IngestError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::StoreUnavailable { message } => Self::StoreUnavailable { message },
            other => Self::StoreUnavailable { message: other.to_string() },
        }
    }
}

/// Category of pipeline error for metrics and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// Redelivered events.
    Duplicate,
    /// Handler timeouts.
    Timeout,
    /// Business failures reported by handlers.
    Handler,
    /// Handler panics.
    Panic,
    /// Event or dead-letter store outages.
    Store,
    /// Configuration problems.
    Configuration,
    /// Worker and lifecycle failures.
    Internal,
}

impl From<&PipelineError> for ErrorCategory {
    fn from(error: &PipelineError) -> Self {
        match error {
            PipelineError::DuplicateEvent { .. } => Self::Duplicate,
            PipelineError::HandlerTimeout { .. } => Self::Timeout,
            PipelineError::HandlerError { .. } => Self::Handler,
            PipelineError::HandlerPanicked { .. } => Self::Panic,
            PipelineError::StoreUnavailable { .. } => Self::Store,
            PipelineError::Configuration { .. } => Self::Configuration,
            PipelineError::ShutdownTimeout { .. }
            | PipelineError::WorkerPanic { .. }
            | PipelineError::Lifecycle(_) => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate"),
            Self::Timeout => write!(f, "timeout"),
            Self::Handler => write!(f, "handler"),
            Self::Panic => write!(f, "panic"),
            Self::Store => write!(f, "store"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
