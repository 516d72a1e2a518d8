//! Election and application of state transitions.
//!
//! A transition runs in two phases. During *election* the filters in the
//! job's pipeline may inspect and replace the candidate state, or cancel the
//! transition outright. During *application* the old state's bookkeeping is
//! undone, the new state is recorded and its own bookkeeping is written, all
//! into one transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::common::{BackgroundJob, Job, JobRegistry};
use crate::error::{Error, StorageError};
use crate::filters::{FilterCollection, JobFilter};
use crate::states::changer::BackgroundJobStateChanger;
use crate::states::handlers::StateHandlerCollection;
use crate::states::state::State;
use crate::storage::{JobStorage, StorageConnection, WriteTransaction};

/// How long a job in a final state is kept.
pub const DEFAULT_JOB_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Mutable view of a transition while filters elect the state to apply.
pub struct ElectStateContext<'a> {
    pub storage: &'a dyn JobStorage,
    pub connection: &'a dyn StorageConnection,
    pub background_job: &'a BackgroundJob,
    /// Lets filters move other jobs as a consequence of this transition.
    pub state_changer: &'a BackgroundJobStateChanger,
    /// Name of the state the job is in now, if any.
    pub current_state: Option<&'a str>,
    /// Scratch space shared by the filters of this transition.
    pub items: HashMap<String, Value>,
    candidate_state: State,
    traversed_states: Vec<State>,
    canceled: bool,
}

impl<'a> ElectStateContext<'a> {
    pub fn new(
        storage: &'a dyn JobStorage,
        connection: &'a dyn StorageConnection,
        background_job: &'a BackgroundJob,
        state_changer: &'a BackgroundJobStateChanger,
        current_state: Option<&'a str>,
        candidate_state: State,
    ) -> Self {
        Self {
            storage,
            connection,
            background_job,
            state_changer,
            current_state,
            items: HashMap::new(),
            candidate_state,
            traversed_states: Vec::new(),
            canceled: false,
        }
    }

    pub fn candidate_state(&self) -> &State {
        &self.candidate_state
    }

    /// Adjust the candidate in place, without recording a traversed state.
    pub fn candidate_state_mut(&mut self) -> &mut State {
        &mut self.candidate_state
    }

    /// Replace the candidate. The replaced one is kept in the job history.
    pub fn set_candidate_state(&mut self, state: State) {
        let previous = std::mem::replace(&mut self.candidate_state, state);
        self.traversed_states.push(previous);
    }

    pub fn traversed_states(&self) -> &[State] {
        &self.traversed_states
    }

    /// Abort the transition; nothing is applied.
    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub async fn get_job_parameter<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, Error> {
        let raw = self
            .connection
            .get_job_parameter(&self.background_job.id, name)
            .await?;
        match raw {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(StorageError::from)?,
            )),
            None => Ok(None),
        }
    }

    pub async fn set_job_parameter<T: Serialize + Sync>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), Error> {
        let raw = serde_json::to_string(value).map_err(StorageError::from)?;
        self.connection
            .set_job_parameter(&self.background_job.id, name, &raw)
            .await?;
        Ok(())
    }

    fn into_outcome(self) -> (State, Vec<State>) {
        (self.candidate_state, self.traversed_states)
    }
}

/// Read-only view of a transition while it is written.
pub struct ApplyStateContext<'a> {
    pub storage: &'a dyn JobStorage,
    pub connection: &'a dyn StorageConnection,
    pub background_job: &'a BackgroundJob,
    pub new_state: &'a State,
    /// The state being left, for unapply bookkeeping.
    pub old_state_name: Option<&'a str>,
    pub job_expiration_timeout: Duration,
}

/// Runs the election pipeline and writes transitions.
#[derive(Debug, Clone)]
pub struct StateMachine {
    registry: Arc<JobRegistry>,
    filters: Arc<FilterCollection>,
    handlers: StateHandlerCollection,
    job_expiration_timeout: Duration,
}

impl StateMachine {
    pub fn new(registry: Arc<JobRegistry>, filters: Arc<FilterCollection>) -> Self {
        Self {
            registry,
            filters,
            handlers: StateHandlerCollection::default(),
            job_expiration_timeout: DEFAULT_JOB_EXPIRATION,
        }
    }

    pub fn with_handlers(mut self, handlers: StateHandlerCollection) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_job_expiration(mut self, timeout: Duration) -> Self {
        self.job_expiration_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Ordered filter pipeline for a job. Jobs that failed to load only see
    /// the global filters.
    pub fn filters_for(&self, job: Option<&Job>) -> Vec<Arc<dyn JobFilter>> {
        let job_filters = job
            .map(|job| self.registry.filters_for(job))
            .unwrap_or_default();
        self.filters.for_job(job_filters)
    }

    /// Let every filter look at the candidate, stopping early on cancel.
    pub async fn elect_state(
        &self,
        context: &mut ElectStateContext<'_>,
        filters: &[Arc<dyn JobFilter>],
    ) -> Result<(), Error> {
        for filter in filters {
            filter.on_state_election(context).await?;
            if context.is_canceled() {
                debug!(
                    job_id = %context.background_job.id,
                    candidate = context.candidate_state().name(),
                    "State election canceled by filter"
                );
                break;
            }
        }
        Ok(())
    }

    /// Write the elected state and its bookkeeping into `transaction`.
    pub fn apply_state(
        &self,
        context: &ApplyStateContext<'_>,
        traversed_states: &[State],
        filters: &[Arc<dyn JobFilter>],
        transaction: &mut dyn WriteTransaction,
    ) {
        let job_id = context.background_job.id.as_str();

        if let Some(old_state) = context.old_state_name {
            for handler in self.handlers.for_state(old_state) {
                handler.unapply(context, transaction);
            }
            for filter in filters {
                filter.on_state_unapplied(context, transaction);
            }
        }

        for state in traversed_states {
            transaction.add_job_state(job_id, state);
        }
        transaction.set_job_state(job_id, context.new_state);

        for handler in self.handlers.for_state(context.new_state.name()) {
            handler.apply(context, transaction);
        }
        for filter in filters {
            filter.on_state_applied(context, transaction);
        }

        // Awaiting jobs expire too, so a continuation whose parent never
        // finishes is eventually swept.
        match context.new_state {
            state if state.is_final() => {
                transaction.expire_job(job_id, context.job_expiration_timeout)
            }
            State::Awaiting(awaiting) => transaction.expire_job(job_id, awaiting.expiration),
            _ => transaction.persist_job(job_id),
        }
    }

    /// Elect, then apply and commit. `None` when a filter canceled.
    pub(crate) async fn transition(
        &self,
        storage: &dyn JobStorage,
        connection: &dyn StorageConnection,
        state_changer: &BackgroundJobStateChanger,
        background_job: &BackgroundJob,
        candidate_state: State,
        current_state: Option<&str>,
    ) -> Result<Option<State>, Error> {
        let filters = self.filters_for(background_job.job.as_ref());

        let mut election = ElectStateContext::new(
            storage,
            connection,
            background_job,
            state_changer,
            current_state,
            candidate_state,
        );
        self.elect_state(&mut election, &filters).await?;
        if election.is_canceled() {
            return Ok(None);
        }
        let (new_state, traversed) = election.into_outcome();

        let mut transaction = connection.create_write_transaction();
        let apply = ApplyStateContext {
            storage,
            connection,
            background_job,
            new_state: &new_state,
            old_state_name: current_state,
            job_expiration_timeout: self.job_expiration_timeout,
        };
        self.apply_state(&apply, &traversed, &filters, transaction.as_mut());
        transaction.commit().await?;

        debug!(
            job_id = %background_job.id,
            from = current_state.unwrap_or("<none>"),
            to = new_state.name(),
            "Applied job state"
        );
        Ok(Some(new_state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::client::BackgroundJobClient;
    use crate::common::{MethodInfo, TypeInfo};
    use crate::states::{
        AwaitingState, ContinuationOptions, DeletedState, EnqueuedState, StateChangeContext,
        SucceededState,
    };
    use crate::storage::{MemoryStorage, WriteOp, keys};

    /// Turns every Enqueued candidate into Deleted.
    struct DeleteInsteadOfEnqueue;

    #[async_trait]
    impl JobFilter for DeleteInsteadOfEnqueue {
        async fn on_state_election(&self, context: &mut ElectStateContext<'_>) -> Result<(), Error> {
            if matches!(context.candidate_state(), State::Enqueued(_)) {
                context.set_candidate_state(State::from(DeletedState::default()).with_reason("not today"));
            }
            Ok(())
        }
    }

    /// Refuses every transition into Deleted.
    struct NeverDelete;

    #[async_trait]
    impl JobFilter for NeverDelete {
        async fn on_state_election(&self, context: &mut ElectStateContext<'_>) -> Result<(), Error> {
            if matches!(context.candidate_state(), State::Deleted(_)) {
                context.cancel();
            }
            Ok(())
        }
    }

    fn registry() -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry.register(TypeInfo::new("Noop"), MethodInfo::new("Noop", "run"), |_| async {
            Ok(json!(null))
        });
        Arc::new(registry)
    }

    async fn create(storage: &MemoryStorage, filters: FilterCollection, state: impl Into<State>) -> String {
        let registry = registry();
        let client = BackgroundJobClient::new(Arc::new(storage.clone()), registry.clone(), Arc::new(filters));
        let job = registry.job("Noop", "run", vec![]).unwrap();
        client.create(job, state).await.unwrap().unwrap()
    }

    /// The committed batch that set `job_id`'s state last.
    fn last_batch_for(storage: &MemoryStorage, job_id: &str) -> Vec<WriteOp> {
        storage
            .journal()
            .into_iter()
            .rev()
            .find(|batch| {
                batch
                    .iter()
                    .any(|op| matches!(op, WriteOp::SetJobState { job_id: id, .. } if id == job_id))
            })
            .unwrap()
    }

    #[tokio::test]
    async fn replaced_candidates_are_kept_in_history() {
        let storage = MemoryStorage::new();
        let mut filters = FilterCollection::empty();
        filters.add(DeleteInsteadOfEnqueue);
        let id = create(&storage, filters, EnqueuedState::default()).await;

        let batch = last_batch_for(&storage, &id);
        let traversed = batch
            .iter()
            .position(|op| matches!(op, WriteOp::AddJobState { state, .. } if state.name == "Enqueued"));
        let elected = batch
            .iter()
            .position(|op| matches!(op, WriteOp::SetJobState { state, .. } if state.name == "Deleted"));
        assert!(traversed.is_some_and(|t| elected.is_some_and(|e| t < e)));
        assert!(!batch.iter().any(|op| matches!(op, WriteOp::AddToQueue { .. })));
        assert!(batch.iter().any(|op| matches!(op, WriteOp::ExpireJob { .. })));
        assert!(storage.queued_job_ids("default").is_empty());
    }

    #[tokio::test]
    async fn canceled_election_writes_nothing() {
        let storage = MemoryStorage::new();
        let mut filters = FilterCollection::empty();
        filters.add(NeverDelete);
        let id = create(&storage, filters.clone(), EnqueuedState::default()).await;
        storage.clear_journal();

        let changer = BackgroundJobStateChanger::new(registry(), Arc::new(filters));
        let connection = storage.connection().await.unwrap();
        let applied = changer
            .change_state(StateChangeContext::new(
                &storage,
                connection.as_ref(),
                &id,
                DeletedState::default().into(),
            ))
            .await
            .unwrap();

        assert!(applied.is_none());
        assert!(storage.journal().is_empty());
        let state = connection.get_state_data(&id).await.unwrap().unwrap();
        assert_eq!(state.name, "Enqueued");
    }

    #[tokio::test]
    async fn leaving_succeeded_decrements_its_counter() {
        let storage = MemoryStorage::new();
        let id = create(&storage, FilterCollection::empty(), SucceededState::new(None, 0, 0)).await;
        assert!(storage.journal().iter().flatten().any(
            |op| matches!(op, WriteOp::IncrementCounter { key, .. } if key == keys::STATS_SUCCEEDED)
        ));

        let changer = BackgroundJobStateChanger::new(registry(), Arc::new(FilterCollection::empty()));
        let connection = storage.connection().await.unwrap();
        changer
            .change_state(StateChangeContext::new(
                &storage,
                connection.as_ref(),
                &id,
                EnqueuedState::default().into(),
            ))
            .await
            .unwrap();

        let batch = last_batch_for(&storage, &id);
        assert!(batch.iter().any(
            |op| matches!(op, WriteOp::DecrementCounter { key, .. } if key == keys::STATS_SUCCEEDED)
        ));
        assert!(batch.iter().any(|op| matches!(op, WriteOp::PersistJob { .. })));
        assert_eq!(storage.queued_job_ids("default"), vec![id]);
    }

    #[tokio::test]
    async fn awaiting_jobs_expire_until_released() {
        let storage = MemoryStorage::new();
        let parent = create(&storage, FilterCollection::default(), EnqueuedState::default()).await;
        let mut awaiting = AwaitingState::new(
            &parent,
            EnqueuedState::default().into(),
            ContinuationOptions::OnlyOnSucceededState,
        );
        awaiting.expiration = Duration::from_secs(3600);
        let child = create(&storage, FilterCollection::default(), awaiting).await;

        let batch = last_batch_for(&storage, &child);
        assert!(batch.iter().any(|op| matches!(
            op,
            WriteOp::ExpireJob { job_id, expire_in } if *job_id == child && *expire_in == Duration::from_secs(3600)
        )));

        let changer = BackgroundJobStateChanger::new(registry(), Arc::new(FilterCollection::default()));
        let connection = storage.connection().await.unwrap();
        changer
            .change_state(StateChangeContext::new(
                &storage,
                connection.as_ref(),
                &parent,
                SucceededState::new(None, 0, 0).into(),
            ))
            .await
            .unwrap();

        let batch = last_batch_for(&storage, &child);
        assert!(batch
            .iter()
            .any(|op| matches!(op, WriteOp::PersistJob { job_id } if *job_id == child)));
        let state = connection.get_state_data(&child).await.unwrap().unwrap();
        assert_eq!(state.name, "Enqueued");
    }
}
