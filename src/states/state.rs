//! Lifecycle states of a background job.
//!
//! Each variant has a stable, hard-coded name, a finality flag and a flat
//! key/value serialization that storage persists alongside the state name.
//! States are plain owned values: every transition builds a fresh one.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// Queue used when none is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Check that a queue name is lowercase letters, digits, `_` or `-`.
pub fn validate_queue_name(queue: &str) -> Result<(), ValidationError> {
    let valid = !queue.is_empty()
        && queue
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::option(
            "queue",
            format!("'{queue}' must consist of lowercase letters, digits, underscores and dashes"),
        ))
    }
}

/// The job is in a queue, ready to be fetched by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueuedState {
    pub queue: String,
    pub enqueued_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl EnqueuedState {
    pub const NAME: &'static str = "Enqueued";

    pub fn new(queue: impl Into<String>) -> Result<Self, ValidationError> {
        let queue = queue.into();
        validate_queue_name(&queue)?;
        Ok(Self {
            queue,
            ..Self::default()
        })
    }
}

impl Default for EnqueuedState {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            enqueued_at: Utc::now(),
            reason: None,
        }
    }
}

/// The job waits until `enqueue_at` before it is moved to a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledState {
    pub enqueue_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl ScheduledState {
    pub const NAME: &'static str = "Scheduled";

    pub fn at(enqueue_at: DateTime<Utc>) -> Self {
        Self {
            enqueue_at,
            scheduled_at: Utc::now(),
            reason: None,
        }
    }

    /// Delays past the end of representable time are clamped to it.
    pub fn after(delay: Duration) -> Self {
        let now = Utc::now();
        let enqueue_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::at(enqueue_at)
    }
}

/// A worker has claimed the job and is running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub server_id: String,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl ProcessingState {
    pub const NAME: &'static str = "Processing";

    pub fn new(server_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            worker_id: worker_id.into(),
            started_at: Utc::now(),
            reason: None,
        }
    }
}

/// The job method returned normally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SucceededState {
    pub result: Option<Value>,
    /// Milliseconds between creation and the start of processing.
    pub latency: i64,
    /// Milliseconds the method took to run.
    pub performance_duration: i64,
    pub succeeded_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl SucceededState {
    pub const NAME: &'static str = "Succeeded";

    pub fn new(result: Option<Value>, latency: i64, performance_duration: i64) -> Self {
        Self {
            result,
            latency,
            performance_duration,
            succeeded_at: Utc::now(),
            reason: None,
        }
    }
}

/// The job method failed, or the job could not be loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedState {
    pub exception_type: String,
    pub exception_message: String,
    pub exception_details: String,
    pub failed_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl FailedState {
    pub const NAME: &'static str = "Failed";

    pub fn new(
        exception_type: impl Into<String>,
        exception_message: impl Into<String>,
        exception_details: impl Into<String>,
    ) -> Self {
        Self {
            exception_type: exception_type.into(),
            exception_message: exception_message.into(),
            exception_details: exception_details.into(),
            failed_at: Utc::now(),
            reason: None,
        }
    }

    /// Capture an error returned by a job method.
    pub fn from_error(error: &anyhow::Error) -> Self {
        Self::new("JobPerformanceError", error.to_string(), format!("{error:?}"))
    }
}

/// The job was deleted; it stays visible until it expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedState {
    pub deleted_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl DeletedState {
    pub const NAME: &'static str = "Deleted";
}

impl Default for DeletedState {
    fn default() -> Self {
        Self {
            deleted_at: Utc::now(),
            reason: None,
        }
    }
}

/// When a continuation may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContinuationOptions {
    /// Run after the parent finishes, whatever its final state.
    OnAnyFinishedState,
    /// Run only when the parent succeeded; otherwise the continuation is deleted.
    #[default]
    OnlyOnSucceededState,
}

/// The job waits for its parent to finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitingState {
    pub parent_id: String,
    pub next_state: Box<State>,
    pub options: ContinuationOptions,
    pub expiration: Duration,
    pub reason: Option<String>,
}

impl AwaitingState {
    pub const NAME: &'static str = "Awaiting";

    /// Continuations never waiting longer than a year by default.
    pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    pub fn new(parent_id: impl Into<String>, next_state: State, options: ContinuationOptions) -> Self {
        Self {
            parent_id: parent_id.into(),
            next_state: Box::new(next_state),
            options,
            expiration: Self::DEFAULT_EXPIRATION,
            reason: None,
        }
    }
}

/// A lifecycle stage of a background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum State {
    Enqueued(EnqueuedState),
    Scheduled(ScheduledState),
    Processing(ProcessingState),
    Succeeded(SucceededState),
    Failed(FailedState),
    Deleted(DeletedState),
    Awaiting(AwaitingState),
}

impl State {
    /// Stable identifier of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Enqueued(_) => EnqueuedState::NAME,
            Self::Scheduled(_) => ScheduledState::NAME,
            Self::Processing(_) => ProcessingState::NAME,
            Self::Succeeded(_) => SucceededState::NAME,
            Self::Failed(_) => FailedState::NAME,
            Self::Deleted(_) => DeletedState::NAME,
            Self::Awaiting(_) => AwaitingState::NAME,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Enqueued(s) => s.reason.as_deref(),
            Self::Scheduled(s) => s.reason.as_deref(),
            Self::Processing(s) => s.reason.as_deref(),
            Self::Succeeded(s) => s.reason.as_deref(),
            Self::Failed(s) => s.reason.as_deref(),
            Self::Deleted(s) => s.reason.as_deref(),
            Self::Awaiting(s) => s.reason.as_deref(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        let reason = Some(reason.into());
        match &mut self {
            Self::Enqueued(s) => s.reason = reason,
            Self::Scheduled(s) => s.reason = reason,
            Self::Processing(s) => s.reason = reason,
            Self::Succeeded(s) => s.reason = reason,
            Self::Failed(s) => s.reason = reason,
            Self::Deleted(s) => s.reason = reason,
            Self::Awaiting(s) => s.reason = reason,
        }
        self
    }

    /// Terminal states: the job expires once one of them is applied.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_) | Self::Deleted(_))
    }

    /// Whether the state can be applied to a job whose method no longer loads.
    pub fn ignore_job_load_exception(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Deleted(_))
    }

    /// Flat key/value form persisted by storage.
    pub fn serialize_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        match self {
            Self::Enqueued(s) => {
                data.insert("EnqueuedAt".into(), s.enqueued_at.to_rfc3339());
                data.insert("Queue".into(), s.queue.clone());
            }
            Self::Scheduled(s) => {
                data.insert("EnqueueAt".into(), s.enqueue_at.to_rfc3339());
                data.insert("ScheduledAt".into(), s.scheduled_at.to_rfc3339());
            }
            Self::Processing(s) => {
                data.insert("StartedAt".into(), s.started_at.to_rfc3339());
                data.insert("ServerId".into(), s.server_id.clone());
                data.insert("WorkerId".into(), s.worker_id.clone());
            }
            Self::Succeeded(s) => {
                data.insert("SucceededAt".into(), s.succeeded_at.to_rfc3339());
                data.insert("PerformanceDuration".into(), s.performance_duration.to_string());
                data.insert("Latency".into(), s.latency.to_string());
                if let Some(result) = &s.result {
                    data.insert("Result".into(), result.to_string());
                }
            }
            Self::Failed(s) => {
                data.insert("FailedAt".into(), s.failed_at.to_rfc3339());
                data.insert("ExceptionType".into(), s.exception_type.clone());
                data.insert("ExceptionMessage".into(), s.exception_message.clone());
                data.insert("ExceptionDetails".into(), s.exception_details.clone());
            }
            Self::Deleted(s) => {
                data.insert("DeletedAt".into(), s.deleted_at.to_rfc3339());
            }
            Self::Awaiting(s) => {
                data.insert("ParentId".into(), s.parent_id.clone());
                data.insert(
                    "NextState".into(),
                    serde_json::to_string(&s.next_state).unwrap_or_default(),
                );
                data.insert("Options".into(), format!("{:?}", s.options));
                data.insert("Expiration".into(), s.expiration.as_secs().to_string());
            }
        }
        data
    }
}

impl From<EnqueuedState> for State {
    fn from(s: EnqueuedState) -> Self {
        Self::Enqueued(s)
    }
}

impl From<ScheduledState> for State {
    fn from(s: ScheduledState) -> Self {
        Self::Scheduled(s)
    }
}

impl From<ProcessingState> for State {
    fn from(s: ProcessingState) -> Self {
        Self::Processing(s)
    }
}

impl From<SucceededState> for State {
    fn from(s: SucceededState) -> Self {
        Self::Succeeded(s)
    }
}

impl From<FailedState> for State {
    fn from(s: FailedState) -> Self {
        Self::Failed(s)
    }
}

impl From<DeletedState> for State {
    fn from(s: DeletedState) -> Self {
        Self::Deleted(s)
    }
}

impl From<AwaitingState> for State {
    fn from(s: AwaitingState) -> Self {
        Self::Awaiting(s)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
