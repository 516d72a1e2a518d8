//! Periodic trigger of recurring jobs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::client::BackgroundJobFactory;
use crate::common::{Clock, SystemClock};
use crate::error::{Error, ProcessError};
use crate::recurring::cron::{CronSchedule, parse_time_zone};
use crate::recurring::manager::{create_from_record, fields, format_instant, parse_instant};
use crate::server::process::{BackgroundProcess, BackgroundProcessContext};
use crate::storage::{StorageConnection, keys};

pub const DEFAULT_RECURRING_POLLING_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Scans every recurring job each tick and triggers the ones that are due.
///
/// A job is due when its cron expression has an occurrence between its last
/// execution (or creation) and now. However many occurrences were missed,
/// one tick creates at most one job per recurring job. Ticks are serialized
/// across servers by the `locks:recurring-jobs` lock.
pub struct RecurringJobScheduler {
    polling_delay: Duration,
    lock_timeout: Duration,
    factory: BackgroundJobFactory,
    clock: Arc<dyn Clock>,
}

impl RecurringJobScheduler {
    pub fn new(polling_delay: Duration, factory: BackgroundJobFactory) -> Self {
        Self {
            polling_delay,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            factory,
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

    /// One tick. Returns how many jobs were created.
    pub async fn trigger_due_jobs(
        &self,
        context: &BackgroundProcessContext,
    ) -> Result<usize, ProcessError> {
        let storage = context.storage().as_ref();
        let connection = storage.connection().await?;

        let _lock = match connection
            .acquire_distributed_lock(&keys::lock(keys::RECURRING_JOBS), self.lock_timeout)
            .await
        {
            Ok(lock) => lock,
            Err(e) if e.is_lock_timeout() => {
                debug!(error = %e, "Another server is triggering recurring jobs, skipping this tick");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let ids = connection.get_all_items_from_set(keys::RECURRING_JOBS).await?;
        let mut triggered = 0;
        for id in ids {
            if context.is_shutdown_requested() {
                break;
            }
            let Some(record) = connection
                .get_all_entries_from_hash(&keys::recurring_job(&id))
                .await?
            else {
                debug!(recurring_job_id = %id, "Recurring job record is missing, skipping");
                continue;
            };

            match self.try_trigger(context, connection.as_ref(), &id, &record).await {
                Ok(true) => triggered += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(recurring_job_id = %id, error = %e, "Recurring job could not be triggered");
                }
            }
        }
        Ok(triggered)
    }

    /// Trigger one recurring job if it is due and record the outcome on it.
    async fn try_trigger(
        &self,
        context: &BackgroundProcessContext,
        connection: &dyn StorageConnection,
        id: &str,
        record: &BTreeMap<String, String>,
    ) -> Result<bool, ProcessError> {
        let cron = record.get(fields::CRON).map(String::as_str).unwrap_or_default();
        let schedule = CronSchedule::parse(cron).map_err(Error::from)?;
        let zone = parse_time_zone(
            record
                .get(fields::TIME_ZONE_ID)
                .map(String::as_str)
                .unwrap_or("UTC"),
        )
        .map_err(Error::from)?;

        let now = self.clock.now();
        let baseline = last_run_baseline(record).unwrap_or(now);
        let due = schedule
            .next_in(baseline, &zone)
            .is_some_and(|next| next <= now);

        let mut changes = BTreeMap::new();
        if due {
            let job_id =
                create_from_record(context.storage().as_ref(), connection, &self.factory, id, record)
                    .await?;
            info!(
                recurring_job_id = id,
                job_id = job_id.as_deref().unwrap_or("<canceled>"),
                "Recurring job triggered"
            );
            changes.insert(fields::LAST_EXECUTION.to_string(), format_instant(now));
            if let Some(job_id) = job_id {
                changes.insert(fields::LAST_JOB_ID.to_string(), job_id);
            }
        } else if !record.contains_key(fields::LAST_EXECUTION)
            && !record.contains_key(fields::CREATED_AT)
        {
            // Nothing to count from yet: start from this tick.
            changes.insert(fields::LAST_EXECUTION.to_string(), format_instant(now));
        }

        if let Some(next) = schedule.next_in(now, &zone) {
            let next = format_instant(next);
            if record.get(fields::NEXT_EXECUTION) != Some(&next) {
                changes.insert(fields::NEXT_EXECUTION.to_string(), next);
            }
        }

        if !changes.is_empty() {
            let mut transaction = connection.create_write_transaction();
            transaction.set_range_in_hash(&keys::recurring_job(id), &changes);
            transaction.commit().await?;
        }
        Ok(due)
    }
}

/// The instant missed occurrences are counted from.
fn last_run_baseline(record: &BTreeMap<String, String>) -> Option<DateTime<Utc>> {
    record
        .get(fields::LAST_EXECUTION)
        .or_else(|| record.get(fields::CREATED_AT))
        .map(String::as_str)
        .and_then(parse_instant)
}

#[async_trait]
impl BackgroundProcess for RecurringJobScheduler {
    fn name(&self) -> String {
        "RecurringJobScheduler".to_string()
    }

    async fn execute(&self, context: &BackgroundProcessContext) -> Result<(), ProcessError> {
        let triggered = self.trigger_due_jobs(context).await?;
        if triggered > 0 {
            info!(count = triggered, "Recurring jobs triggered");
        }
        context.wait(self.polling_delay).await;
        Ok(())
    }
}
