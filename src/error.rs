//! Error types for quotepool.
//!
//! All errors are strongly typed using thiserror. Pool control operations
//! (subscribe, unsubscribe, stats) never return these; they surface at the
//! request boundary (validation) and on the consumer side of a session
//! stream (execution).

use thiserror::Error;

/// Validation errors raised while parsing boundary input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Key cannot be empty")]
    EmptyKey,

    #[error("Key '{key}' contains invalid characters")]
    InvalidKey {
        key: String,
    },

    #[error("Client id cannot be empty")]
    EmptyClientId,

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },

    #[error("Request carries {actual} keys, maximum is {max}")]
    TooManyKeys {
        max: usize,
        actual: usize,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors observed by consumers of pool-backed streams.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Failed to spawn worker '{name}': {message}")]
    WorkerSpawn {
        name: String,
        message: String,
    },
}

/// Top-level error type for quotepool.
#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

impl QuoteError {
    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the stream was closed (as opposed to timing out).
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Disconnected { .. }))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. }),
        }
    }

    pub(crate) fn disconnected(path: &str) -> Self {
        Self::Execution(ExecutionError::Disconnected {
            path: path.to_string(),
        })
    }

    pub(crate) fn timeout(duration: std::time::Duration) -> Self {
        Self::Execution(ExecutionError::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

/// Result type alias for quotepool operations.
pub type QuoteResult<T> = Result<T, QuoteError>;
