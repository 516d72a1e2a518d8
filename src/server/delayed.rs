//! Moves due Scheduled jobs to their queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::common::clock::to_timestamp;
use crate::common::{Clock, SystemClock};
use crate::error::ProcessError;
use crate::server::process::{BackgroundProcess, BackgroundProcessContext};
use crate::states::{BackgroundJobStateChanger, EnqueuedState, ScheduledState, State, StateChangeContext};
use crate::storage::keys;

pub const DEFAULT_POLLING_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Polls the `schedule` set and enqueues every job whose time has come.
///
/// Only one scheduler across all servers works at a time: each tick holds
/// the `locks:schedulepoller` lock. A tick that cannot get the lock in time
/// is skipped.
pub struct DelayedJobScheduler {
    polling_delay: Duration,
    lock_timeout: Duration,
    state_changer: Arc<BackgroundJobStateChanger>,
    clock: Arc<dyn Clock>,
}

impl DelayedJobScheduler {
    pub fn new(polling_delay: Duration, state_changer: Arc<BackgroundJobStateChanger>) -> Self {
        Self {
            polling_delay,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            state_changer,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// One tick: enqueue everything due now. Returns how many jobs moved.
    pub async fn enqueue_due_jobs(
        &self,
        context: &BackgroundProcessContext,
    ) -> Result<usize, ProcessError> {
        let storage = context.storage().as_ref();
        let connection = storage.connection().await?;

        let _lock = match connection
            .acquire_distributed_lock(&keys::lock("schedulepoller"), self.lock_timeout)
            .await
        {
            Ok(lock) => lock,
            Err(e) if e.is_lock_timeout() => {
                debug!(error = %e, "Another scheduler is enqueueing due jobs, skipping this tick");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut enqueued = 0;
        while !context.is_shutdown_requested() {
            let now = to_timestamp(self.clock.now());
            let Some(job_id) = connection
                .get_first_by_lowest_score_from_set(keys::SCHEDULE, f64::MIN, now)
                .await?
            else {
                break;
            };

            let state = State::from(EnqueuedState::default())
                .with_reason("Triggered by DelayedJobScheduler");
            let change = StateChangeContext::new(storage, connection.as_ref(), &job_id, state)
                .expect_state(ScheduledState::NAME);

            match self.state_changer.change_state(change).await? {
                Some(applied) => {
                    debug!(job_id = %job_id, state = applied.name(), "Moved scheduled job");
                    enqueued += 1;
                }
                None => {
                    // Missing or no longer Scheduled: the entry is stale.
                    debug!(job_id = %job_id, "Removing stale entry from the schedule");
                    let mut transaction = connection.create_write_transaction();
                    transaction.remove_from_set(keys::SCHEDULE, &job_id);
                    transaction.commit().await?;
                }
            }
        }
        Ok(enqueued)
    }
}

#[async_trait]
impl BackgroundProcess for DelayedJobScheduler {
    fn name(&self) -> String {
        "DelayedJobScheduler".to_string()
    }

    async fn execute(&self, context: &BackgroundProcessContext) -> Result<(), ProcessError> {
        let enqueued = self.enqueue_due_jobs(context).await?;
        if enqueued > 0 {
            info!(count = enqueued, "Scheduled jobs enqueued");
        }
        context.wait(self.polling_delay).await;
        Ok(())
    }
}
