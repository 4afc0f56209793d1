//! Typed errors for commits and propagation.
//!
//! A `CommitError` fails the mutation. A `PropagationError` never does: it is
//! retried or turned into an abandoned outcome by the fan-out core.

use thiserror::Error;

use crate::types::EntityId;

/// Payload or token rejected before it reaches storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{field} is {len} bytes, limit is {max}")]
    TooLong {
        field: &'static str,
        max: usize,
        len: usize,
    },
}

/// The primary store rejected the mutation or could not be reached.
#[derive(Debug, Error)]
pub enum CommitError {
    /// Store unreachable. Nothing was written.
    #[error("primary store unavailable: {0}")]
    Unavailable(String),

    /// Payload violates store-level constraints.
    #[error("invalid mutation: {0}")]
    Invalid(String),

    /// Update targets a key that was never committed.
    #[error("entity not found: {0}")]
    NotFound(EntityId),
}

impl From<ValidationError> for CommitError {
    fn from(err: ValidationError) -> Self {
        CommitError::Invalid(err.to_string())
    }
}

/// Failure of one secondary adapter call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropagationError {
    /// Timeout, unreachable backend, open circuit. Retried per policy.
    #[error("transient: {0}")]
    Retryable(String),

    /// Malformed payload, poisoned state. Abandoned after this attempt.
    #[error("permanent: {0}")]
    NonRetryable(String),
}

impl PropagationError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        PropagationError::Retryable(reason.into())
    }

    pub fn non_retryable(reason: impl Into<String>) -> Self {
        PropagationError::NonRetryable(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PropagationError::Retryable(_))
    }
}
