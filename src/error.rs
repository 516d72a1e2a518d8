//! Error types for the job engine.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job load error: {0}")]
    JobLoad(#[from] JobLoadError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed job descriptors, cron expressions or options.
///
/// Raised synchronously at call time and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unsupported job method: {reason}")]
    UnsupportedMethod { reason: String },

    #[error("Argument count must be equal to method parameter count: expected {expected}, got {actual}")]
    ArgumentCountMismatch { expected: usize, actual: usize },

    #[error("The type `{declaring_type}` must be assignable from the `{job_type}` type")]
    TypeMismatch {
        declaring_type: String,
        job_type: String,
    },

    #[error("CRON expression '{expression}' is invalid: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Time zone '{0}' is not supported")]
    InvalidTimeZone(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidOption { key: String, message: String },
}

impl ValidationError {
    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedMethod {
            reason: reason.into(),
        }
    }

    pub(crate) fn option(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// A persisted job could not be turned back into a runnable descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobLoadError {
    #[error("Type `{0}` is not registered")]
    UnknownType(String),

    #[error("Method `{type_name}.{method}` is not registered")]
    UnknownMethod { type_name: String, method: String },

    #[error("Parameter types of `{type_name}.{method}` changed: stored {stored:?}, registered {registered:?}")]
    ParameterMismatch {
        type_name: String,
        method: String,
        stored: Vec<String>,
        registered: Vec<String>,
    },

    #[error("Invocation data could not be decoded: {0}")]
    Decode(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Errors surfaced by a storage implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Timeout expired while acquiring distributed lock on '{resource}' within {timeout:?}")]
    LockTimeout { resource: String, timeout: Duration },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Lock contention is an expected outcome, not a failure.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Failures of the public client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Background job creation failed: {0}")]
    JobCreation(#[source] Box<Error>),

    #[error("State change of background job failed: {0}")]
    StateChange(#[source] Box<Error>),
}

/// Returned by a job method that stopped because its server is shutting
/// down. The worker puts such a job back in its queue instead of failing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Job was aborted by server shutdown")]
pub struct JobAborted;

/// What a supervised background process may fail with.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Process was cancelled")]
    Cancelled,

    #[error(transparent)]
    Engine(#[from] Error),

    #[error("Process panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessError {
    /// Whether this error is a cooperative cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Engine(Error::Storage(StorageError::Cancelled))
        )
    }
}

impl From<StorageError> for ProcessError {
    fn from(e: StorageError) -> Self {
        Self::Engine(Error::Storage(e))
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
