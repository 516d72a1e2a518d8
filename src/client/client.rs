//! Public API for creating jobs and changing their state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::client::{BackgroundJobFactory, CreateContext};
use crate::common::{Job, JobRegistry};
use crate::error::{ClientError, Error};
use crate::filters::FilterCollection;
use crate::states::{
    AwaitingState, BackgroundJobStateChanger, ContinuationOptions, DeletedState, EnqueuedState,
    ScheduledState, State, StateChangeContext,
};
use crate::storage::JobStorage;

/// Creates background jobs and moves them between states.
///
/// Every failure is wrapped in a [`ClientError`] that keeps the original
/// error as its source.
#[derive(Clone)]
pub struct BackgroundJobClient {
    storage: Arc<dyn JobStorage>,
    factory: BackgroundJobFactory,
}

impl BackgroundJobClient {
    pub fn new(
        storage: Arc<dyn JobStorage>,
        registry: Arc<JobRegistry>,
        filters: Arc<FilterCollection>,
    ) -> Self {
        let state_changer = Arc::new(BackgroundJobStateChanger::new(registry, filters));
        Self::with_factory(storage, BackgroundJobFactory::new(state_changer))
    }

    pub fn with_factory(storage: Arc<dyn JobStorage>, factory: BackgroundJobFactory) -> Self {
        Self { storage, factory }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        self.factory.state_changer().registry()
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    /// Store `job` and apply `state` to it. Returns the new job id, or `None`
    /// when a filter canceled the creation.
    pub async fn create(
        &self,
        job: Job,
        state: impl Into<State>,
    ) -> Result<Option<String>, ClientError> {
        self.try_create(job, state.into()).await.map_err(|e| {
            warn!(error = %e, "Background job creation failed");
            ClientError::JobCreation(Box::new(e))
        })
    }

    /// Move a job to `state`, optionally only when it is currently in
    /// `from_state`. Returns whether `state` (by name) is what got applied.
    pub async fn change_state(
        &self,
        job_id: &str,
        state: impl Into<State>,
        from_state: Option<&str>,
    ) -> Result<bool, ClientError> {
        self.try_change_state(job_id, state.into(), from_state)
            .await
            .map_err(|e| {
                warn!(job_id, error = %e, "Background job state change failed");
                ClientError::StateChange(Box::new(e))
            })
    }

    /// Create a job in the default queue.
    pub async fn enqueue(&self, job: Job) -> Result<Option<String>, ClientError> {
        self.create(job, EnqueuedState::default()).await
    }

    /// Create a job that is enqueued once `delay` has passed.
    pub async fn schedule(&self, job: Job, delay: Duration) -> Result<Option<String>, ClientError> {
        self.create(job, ScheduledState::after(delay)).await
    }

    pub async fn schedule_at(
        &self,
        job: Job,
        enqueue_at: DateTime<Utc>,
    ) -> Result<Option<String>, ClientError> {
        self.create(job, ScheduledState::at(enqueue_at)).await
    }

    /// Create a job that is enqueued once `parent_id` finishes.
    pub async fn continue_with(
        &self,
        parent_id: &str,
        job: Job,
        options: ContinuationOptions,
    ) -> Result<Option<String>, ClientError> {
        let awaiting = AwaitingState::new(parent_id, EnqueuedState::default().into(), options);
        self.create(job, awaiting).await
    }

    pub async fn delete(&self, job_id: &str, from_state: Option<&str>) -> Result<bool, ClientError> {
        self.change_state(job_id, DeletedState::default(), from_state)
            .await
    }

    pub async fn requeue(&self, job_id: &str, from_state: Option<&str>) -> Result<bool, ClientError> {
        self.change_state(job_id, EnqueuedState::default(), from_state)
            .await
    }

    async fn try_create(&self, job: Job, state: State) -> Result<Option<String>, Error> {
        let connection = self.storage.connection().await?;
        let mut context = CreateContext::new(self.storage.as_ref(), connection.as_ref(), job, Some(state));
        let created = self.factory.create(&mut context).await?;
        Ok(created.map(|job| job.id))
    }

    async fn try_change_state(
        &self,
        job_id: &str,
        state: State,
        from_state: Option<&str>,
    ) -> Result<bool, Error> {
        let requested = state.name();
        let connection = self.storage.connection().await?;

        let mut context =
            StateChangeContext::new(self.storage.as_ref(), connection.as_ref(), job_id, state);
        if let Some(from_state) = from_state {
            context = context.expect_state(from_state);
        }

        let applied = self
            .factory
            .state_changer()
            .change_state(context)
            .await?;
        Ok(applied.is_some_and(|s| s.name().eq_ignore_ascii_case(requested)))
    }
}

impl std::fmt::Debug for BackgroundJobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundJobClient")
            .field("storage", &self.storage.describe())
            .finish()
    }
}
