//! Reschedule failed jobs with a growing delay.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{error, warn};

use crate::error::Error;
use crate::filters::JobFilter;
use crate::states::{DeletedState, ElectStateContext, ScheduledState, State};

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 10;

pub(crate) const UNIQUE_KEY: &str = "automatic-retry";

const RETRY_COUNT_PARAMETER: &str = "RetryCount";
const MAX_MESSAGE_LENGTH: usize = 50;

/// What happens once retries run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttemptsExceededAction {
    /// Leave the job Failed.
    #[default]
    Fail,
    /// Move the job to Deleted.
    Delete,
}

/// Turns a Failed candidate into Scheduled until `attempts` retries are used.
///
/// The attempt count lives in the `RetryCount` job parameter, so it survives
/// server restarts.
#[derive(Debug, Clone)]
pub struct AutomaticRetry {
    attempts: u32,
    on_attempts_exceeded: AttemptsExceededAction,
    delay: fn(u32) -> Duration,
}

impl AutomaticRetry {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            on_attempts_exceeded: AttemptsExceededAction::Fail,
            delay: retry_delay,
        }
    }

    pub fn on_attempts_exceeded(mut self, action: AttemptsExceededAction) -> Self {
        self.on_attempts_exceeded = action;
        self
    }

    /// Replace the backoff function; it gets the 1-based attempt number.
    pub fn with_delay(mut self, delay: fn(u32) -> Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for AutomaticRetry {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_ATTEMPTS)
    }
}

#[async_trait]
impl JobFilter for AutomaticRetry {
    fn name(&self) -> &'static str {
        "AutomaticRetry"
    }

    fn order(&self) -> i32 {
        20
    }

    fn unique_key(&self) -> Option<&'static str> {
        Some(UNIQUE_KEY)
    }

    async fn on_state_election(&self, context: &mut ElectStateContext<'_>) -> Result<(), Error> {
        let State::Failed(failed) = context.candidate_state() else {
            return Ok(());
        };
        let message = truncate(&failed.exception_message, MAX_MESSAGE_LENGTH);
        let job_id = context.background_job.id.clone();

        let attempt = context
            .get_job_parameter::<u32>(RETRY_COUNT_PARAMETER)
            .await?
            .unwrap_or(0)
            + 1;

        if attempt <= self.attempts {
            context
                .set_job_parameter(RETRY_COUNT_PARAMETER, &attempt)
                .await?;

            let delay = (self.delay)(attempt);
            warn!(
                job_id = %job_id,
                attempt,
                attempts = self.attempts,
                delay_secs = delay.as_secs(),
                "Failed to process the job: it will be retried"
            );
            let reason = format!("Retry attempt {attempt} of {}: {message}", self.attempts);
            context.set_candidate_state(State::from(ScheduledState::after(delay)).with_reason(reason));
            return Ok(());
        }

        match self.on_attempts_exceeded {
            AttemptsExceededAction::Delete => {
                warn!(
                    job_id = %job_id,
                    attempts = self.attempts,
                    "Failed to process the job: retry attempts exceeded, deleting"
                );
                let reason = format!("Exceeded the maximum number of retry attempts: {message}");
                context
                    .set_candidate_state(State::from(DeletedState::default()).with_reason(reason));
            }
            AttemptsExceededAction::Fail => {
                error!(
                    job_id = %job_id,
                    attempts = self.attempts,
                    "Failed to process the job: number of retry attempts exceeded"
                );
            }
        }
        Ok(())
    }
}

/// `(n - 1)^4 + 15 + rand(0..30) * n` seconds.
fn retry_delay(attempt: u32) -> Duration {
    let n = u64::from(attempt.max(1));
    let jitter: u64 = rand::thread_rng().gen_range(0..30);
    let secs = (n - 1).saturating_pow(4).saturating_add(15).saturating_add(jitter * n);
    Duration::from_secs(secs)
}

fn truncate(message: &str, max: usize) -> String {
    if message.chars().count() <= max {
        return message.to_string();
    }
    let cut: String = message.chars().take(max).collect();
    format!("{cut}…")
}
