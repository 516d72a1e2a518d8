//! Create, update, trigger and remove recurring jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::client::{BackgroundJobFactory, CreateContext};
use crate::common::{Clock, InvocationData, Job, SystemClock};
use crate::error::{Error, JobLoadError, ValidationError};
use crate::recurring::cron::{CronSchedule, parse_time_zone};
use crate::states::{DEFAULT_QUEUE, EnqueuedState, State};
use crate::states::state::validate_queue_name;
use crate::storage::{JobStorage, StorageConnection, keys};

/// Hash fields of a `recurring-job:{id}` record.
pub mod fields {
    pub const JOB: &str = "Job";
    pub const CRON: &str = "Cron";
    pub const TIME_ZONE_ID: &str = "TimeZoneId";
    pub const QUEUE: &str = "Queue";
    pub const CREATED_AT: &str = "CreatedAt";
    pub const LAST_EXECUTION: &str = "LastExecution";
    pub const NEXT_EXECUTION: &str = "NextExecution";
    pub const LAST_JOB_ID: &str = "LastJobId";
}

/// Job parameter linking a created job to the recurring job that produced it.
pub const RECURRING_JOB_ID_PARAMETER: &str = "RecurringJobId";

const TRIGGER_REASON: &str = "Triggered using recurring job manager";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringJobOptions {
    /// An IANA zone id, `UTC` or a fixed offset, see [`parse_time_zone`].
    pub time_zone: String,
    pub queue: String,
}

impl Default for RecurringJobOptions {
    fn default() -> Self {
        Self {
            time_zone: "UTC".to_string(),
            queue: DEFAULT_QUEUE.to_string(),
        }
    }
}

impl RecurringJobOptions {
    pub fn with_time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.time_zone = time_zone.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }
}

/// Maintains the `recurring-job:{id}` records and the `recurring-jobs` index.
#[derive(Clone)]
pub struct RecurringJobManager {
    storage: Arc<dyn JobStorage>,
    factory: BackgroundJobFactory,
    clock: Arc<dyn Clock>,
}

impl RecurringJobManager {
    pub fn new(storage: Arc<dyn JobStorage>, factory: BackgroundJobFactory) -> Self {
        Self {
            storage,
            factory,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// `"{Type}.{method}"`, the id used when the caller has no better name.
    pub fn default_id(job: &Job) -> String {
        format!("{}.{}", job.type_name(), job.method().name)
    }

    /// Insert or replace the recurring job `id`.
    ///
    /// The cron expression, time zone and queue are validated before
    /// anything is written. `CreatedAt` is only set for new records.
    pub async fn add_or_update(
        &self,
        id: &str,
        job: &Job,
        cron_expression: &str,
        options: RecurringJobOptions,
    ) -> Result<(), Error> {
        if id.trim().is_empty() {
            return Err(ValidationError::option("recurring_job_id", "must not be empty").into());
        }
        let schedule = CronSchedule::parse(cron_expression)?;
        let zone = parse_time_zone(&options.time_zone)?;
        validate_queue_name(&options.queue)?;

        let now = self.clock.now();
        let mut record = BTreeMap::from([
            (fields::JOB.to_string(), InvocationData::from_job(job).to_json()),
            (fields::CRON.to_string(), schedule.expression().to_string()),
            (fields::TIME_ZONE_ID.to_string(), options.time_zone.trim().to_string()),
            (fields::QUEUE.to_string(), options.queue.clone()),
        ]);
        if let Some(next) = schedule.next_in(now, &zone) {
            record.insert(fields::NEXT_EXECUTION.to_string(), format_instant(next));
        }

        let key = keys::recurring_job(id);
        let connection = self.storage.connection().await?;
        let existing = connection.get_all_entries_from_hash(&key).await?;
        if existing.is_none() {
            record.insert(fields::CREATED_AT.to_string(), format_instant(now));
        }

        let mut transaction = connection.create_write_transaction();
        transaction.set_range_in_hash(&key, &record);
        transaction.add_to_set(keys::RECURRING_JOBS, id, 0.0);
        transaction.commit().await?;

        info!(
            recurring_job_id = id,
            cron = schedule.expression(),
            queue = %options.queue,
            created = existing.is_none(),
            "Recurring job saved"
        );
        Ok(())
    }

    /// Create a job from the recurring job `id` right away, ignoring its
    /// schedule. Returns the new job id; `None` when `id` is unknown or a
    /// filter canceled the creation.
    pub async fn trigger(&self, id: &str) -> Result<Option<String>, Error> {
        let connection = self.storage.connection().await?;
        let Some(record) = connection
            .get_all_entries_from_hash(&keys::recurring_job(id))
            .await?
        else {
            debug!(recurring_job_id = id, "Recurring job does not exist, nothing to trigger");
            return Ok(None);
        };
        create_from_record(
            self.storage.as_ref(),
            connection.as_ref(),
            &self.factory,
            id,
            &record,
        )
        .await
    }

    /// Delete the recurring job. Unknown ids are ignored.
    pub async fn remove_if_exists(&self, id: &str) -> Result<(), Error> {
        let connection = self.storage.connection().await?;
        let mut transaction = connection.create_write_transaction();
        transaction.remove_hash(&keys::recurring_job(id));
        transaction.remove_from_set(keys::RECURRING_JOBS, id);
        transaction.commit().await?;
        debug!(recurring_job_id = id, "Recurring job removed");
        Ok(())
    }
}

impl std::fmt::Debug for RecurringJobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurringJobManager")
            .field("storage", &self.storage.describe())
            .finish()
    }
}

/// Create an Enqueued job from a stored recurring job record.
pub(crate) async fn create_from_record(
    storage: &dyn JobStorage,
    connection: &dyn StorageConnection,
    factory: &BackgroundJobFactory,
    id: &str,
    record: &BTreeMap<String, String>,
) -> Result<Option<String>, Error> {
    let payload = record.get(fields::JOB).ok_or_else(|| {
        Error::from(JobLoadError::Decode(format!(
            "recurring job '{id}' has no Job field"
        )))
    })?;
    let job = factory
        .state_changer()
        .registry()
        .resolve(&InvocationData::from_json(payload)?)?;

    let enqueued = match record.get(fields::QUEUE) {
        Some(queue) => EnqueuedState::new(queue.as_str())?,
        None => EnqueuedState::default(),
    };
    let state = State::from(enqueued).with_reason(TRIGGER_REASON);

    let mut context = CreateContext::new(storage, connection, job, Some(state))
        .with_parameter(RECURRING_JOB_ID_PARAMETER, id);
    let created = factory.create(&mut context).await?;
    Ok(created.map(|job| job.id))
}

pub(crate) fn format_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub(crate) fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}
