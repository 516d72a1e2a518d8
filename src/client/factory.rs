//! Creation of background jobs through the filter pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::client::CreateContext;
use crate::common::{BackgroundJob, InvocationData};
use crate::error::Error;
use crate::states::BackgroundJobStateChanger;

/// A job is stored stateless first and only persisted once its initial
/// state is applied; until then it expires after this long.
pub const DEFAULT_CREATION_EXPIRATION: Duration = Duration::from_secs(60 * 60);

/// Stores new jobs and applies their initial state.
#[derive(Debug, Clone)]
pub struct BackgroundJobFactory {
    state_changer: Arc<BackgroundJobStateChanger>,
    creation_expiration: Duration,
}

impl BackgroundJobFactory {
    pub fn new(state_changer: Arc<BackgroundJobStateChanger>) -> Self {
        Self {
            state_changer,
            creation_expiration: DEFAULT_CREATION_EXPIRATION,
        }
    }

    pub fn state_changer(&self) -> &Arc<BackgroundJobStateChanger> {
        &self.state_changer
    }

    /// Returns `None` when a filter canceled the creation or the election of
    /// the initial state.
    pub async fn create(
        &self,
        context: &mut CreateContext<'_>,
    ) -> Result<Option<BackgroundJob>, Error> {
        let filters = self
            .state_changer
            .machine()
            .filters_for(Some(&context.job));

        for filter in &filters {
            filter.on_creating(context).await?;
            if context.is_canceled() {
                debug!(job = %context.job, filter = filter.name(), "Job creation canceled by filter");
                for filter in filters.iter().rev() {
                    filter.on_created(context, None).await?;
                }
                return Ok(None);
            }
        }

        let parameters: BTreeMap<String, String> = context
            .parameters
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();

        let created_at = Utc::now();
        let id = context
            .connection
            .create_expired_job(
                &InvocationData::from_job(&context.job),
                &parameters,
                created_at,
                self.creation_expiration,
            )
            .await?;

        let background_job = BackgroundJob {
            id,
            job: Some(context.job.clone()),
            created_at,
        };

        if let Some(state) = context.initial_state.take() {
            let applied = self
                .state_changer
                .apply_initial_state(context.storage, context.connection, &background_job, state)
                .await?;
            if applied.is_none() {
                debug!(job_id = %background_job.id, "Initial state election canceled");
                return Ok(None);
            }
        }

        for filter in filters.iter().rev() {
            filter.on_created(context, Some(&background_job)).await?;
        }

        debug!(job_id = %background_job.id, job = %context.job, "Created background job");
        Ok(Some(background_job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::common::{JobRegistry, MethodInfo, TypeInfo};
    use crate::filters::{FilterCollection, JobFilter};
    use crate::states::{ElectStateContext, EnqueuedState, State};
    use crate::storage::{JobStorage, MemoryStorage, StorageConnection};

    /// Records what `on_created` saw, optionally vetoing creation first.
    struct Recorder {
        veto: bool,
        created: Arc<Mutex<Vec<Option<String>>>>,
    }

    #[async_trait]
    impl JobFilter for Recorder {
        async fn on_creating(&self, context: &mut CreateContext<'_>) -> Result<(), Error> {
            if self.veto {
                context.cancel();
            }
            Ok(())
        }

        async fn on_created(
            &self,
            _context: &CreateContext<'_>,
            job: Option<&BackgroundJob>,
        ) -> Result<(), Error> {
            self.created
                .lock()
                .unwrap()
                .push(job.map(|job| job.id.clone()));
            Ok(())
        }
    }

    /// Cancels the election of any initial state.
    struct NoInitialState;

    #[async_trait]
    impl JobFilter for NoInitialState {
        async fn on_state_election(&self, context: &mut ElectStateContext<'_>) -> Result<(), Error> {
            if context.current_state.is_none() {
                context.cancel();
            }
            Ok(())
        }
    }

    fn factory(filters: FilterCollection) -> (BackgroundJobFactory, Arc<JobRegistry>) {
        let mut registry = JobRegistry::new();
        registry.register(TypeInfo::new("Noop"), MethodInfo::new("Noop", "run"), |_| async {
            Ok(json!(null))
        });
        let registry = Arc::new(registry);
        let changer = BackgroundJobStateChanger::new(registry.clone(), Arc::new(filters));
        (BackgroundJobFactory::new(Arc::new(changer)), registry)
    }

    #[tokio::test]
    async fn veto_stores_nothing_and_still_notifies() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let mut filters = FilterCollection::empty();
        filters.add(Recorder {
            veto: true,
            created: created.clone(),
        });
        let (factory, registry) = factory(filters);

        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();
        let job = registry.job("Noop", "run", vec![]).unwrap();
        let mut context = CreateContext::new(
            &storage,
            connection.as_ref(),
            job,
            Some(EnqueuedState::default().into()),
        );

        assert!(factory.create(&mut context).await.unwrap().is_none());
        assert_eq!(storage.job_count(), 0);
        assert_eq!(*created.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn parameters_are_stored_with_the_job() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let mut filters = FilterCollection::empty();
        filters.add(Recorder {
            veto: false,
            created: created.clone(),
        });
        let (factory, registry) = factory(filters);

        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();
        let job = registry.job("Noop", "run", vec![]).unwrap();
        let mut context = CreateContext::new(
            &storage,
            connection.as_ref(),
            job,
            Some(EnqueuedState::default().into()),
        )
        .with_parameter("Origin", "tests");

        let job = factory.create(&mut context).await.unwrap().unwrap();
        let origin = connection.get_job_parameter(&job.id, "Origin").await.unwrap();
        assert_eq!(origin.as_deref(), Some("\"tests\""));
        assert_eq!(*created.lock().unwrap(), vec![Some(job.id.clone())]);
        assert_eq!(storage.queued_job_ids("default"), vec![job.id]);
    }

    #[tokio::test]
    async fn canceled_initial_state_leaves_an_expiring_stateless_job() {
        let mut filters = FilterCollection::empty();
        filters.add(NoInitialState);
        let (factory, registry) = factory(filters);

        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();
        let job = registry.job("Noop", "run", vec![]).unwrap();
        let mut context = CreateContext::new(
            &storage,
            connection.as_ref(),
            job,
            Some(State::from(EnqueuedState::default())),
        );

        assert!(factory.create(&mut context).await.unwrap().is_none());
        assert_eq!(storage.job_count(), 1);
        assert!(storage.journal().is_empty());
        assert!(storage.queued_job_ids("default").is_empty());
    }
}
