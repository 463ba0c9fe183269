//! Error types for domain value validation.
//!
//! Core types are mostly infallible to construct; the errors here cover the
//! few places where caller input has to be checked before it can enter the
//! pipeline (empty identifiers, illegal job status transitions).

use thiserror::Error;

use crate::models::JobStatus;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for domain validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A required identifier was empty.
    #[error("invalid input: {field} must not be empty")]
    EmptyField {
        /// Name of the offending field
        field: &'static str,
    },

    /// A job was asked to move between two states that are not connected.
    #[error("illegal job status transition from {from} to {to}")]
    IllegalTransition {
        /// Status the job was in
        from: JobStatus,
        /// Status that was requested
        to: JobStatus,
    },
}

impl CoreError {
    /// Creates an empty-field error.
    pub fn empty_field(field: &'static str) -> Self {
        Self::EmptyField { field }
    }

    /// Creates an illegal-transition error.
    pub fn illegal_transition(from: JobStatus, to: JobStatus) -> Self {
        Self::IllegalTransition { from, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_format() {
        assert_eq!(
            CoreError::empty_field("event id").to_string(),
            "invalid input: event id must not be empty"
        );
        assert_eq!(
            CoreError::illegal_transition(JobStatus::Succeeded, JobStatus::Pending).to_string(),
            "illegal job status transition from succeeded to pending"
        );
    }
}
