//! Continuations: jobs that start once another job finishes.
//!
//! A continuation is created in the Awaiting state. Election of that state
//! registers the child in the parent's `Continuations` job parameter; when
//! the parent later elects Succeeded or Deleted, every registered child
//! still Awaiting is moved to the state it was waiting to enter.
//!
//! Failed parents do not release their continuations: a failed job can
//! still be requeued by hand, and its children keep waiting for that.
//!
//! Registration takes the parent's state lock, which every transition of
//! the parent holds until it commits. A child therefore either lands in the
//! list before the parent elects a final state, or sees that final state.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, StorageError};
use crate::filters::JobFilter;
use crate::states::changer::state_lock;
use crate::states::{
    AwaitingState, ContinuationOptions, DeletedState, ElectStateContext, FailedState,
    StateChangeContext, State, SucceededState,
};
use crate::storage::{StateData, StorageConnection};

const CONTINUATIONS_PARAMETER: &str = "Continuations";
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
/// How long to wait for a just-registered child to get its first state.
const CHILD_STATE_WAIT: Duration = Duration::from_secs(5);
const CHILD_STATE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Continuation {
    #[serde(rename = "JobId")]
    job_id: String,
    #[serde(rename = "Options")]
    options: ContinuationOptions,
}

/// Registers and releases continuations.
#[derive(Debug, Clone)]
pub struct ContinuationsSupport {
    lock_timeout: Duration,
}

impl ContinuationsSupport {
    pub fn new(lock_timeout: Duration) -> Self {
        Self { lock_timeout }
    }

    async fn add_continuation(
        &self,
        context: &mut ElectStateContext<'_>,
        awaiting: AwaitingState,
    ) -> Result<(), Error> {
        let parent_id = awaiting.parent_id.as_str();
        let connection = context.connection;

        let _lock = connection
            .acquire_distributed_lock(&state_lock(parent_id), self.lock_timeout)
            .await?;

        let Some(parent) = connection.get_job_data(parent_id).await? else {
            warn!(
                job_id = %context.background_job.id,
                parent_id,
                "Parent job does not exist, deleting continuation"
            );
            let reason =
                format!("Can not add a continuation: parent background job '{parent_id}' does not exist.");
            context.set_candidate_state(State::from(DeletedState::default()).with_reason(reason));
            return Ok(());
        };

        let mut continuations = load_continuations(connection, parent_id).await?;
        continuations.push(Continuation {
            job_id: context.background_job.id.clone(),
            options: awaiting.options,
        });
        let raw = serde_json::to_string(&continuations).map_err(StorageError::from)?;
        connection
            .set_job_parameter(parent_id, CONTINUATIONS_PARAMETER, &raw)
            .await?;

        if let Some(parent_state) = parent.state_name.as_deref().filter(|s| releases_continuations(s)) {
            debug!(
                job_id = %context.background_job.id,
                parent_id,
                parent_state,
                "Parent already finished, starting continuation immediately"
            );
            let next = next_state(*awaiting.next_state, awaiting.options, parent_state);
            context.set_candidate_state(next);
        }
        Ok(())
    }

    /// Runs inside the parent's transition, so its state lock is held.
    async fn execute_continuations(&self, context: &ElectStateContext<'_>) -> Result<(), Error> {
        let parent_id = context.background_job.id.as_str();
        let parent_state = context.candidate_state().name();
        let connection = context.connection;

        for continuation in load_continuations(connection, parent_id).await? {
            let Some(child_state) = wait_for_state(connection, &continuation.job_id).await? else {
                warn!(
                    parent_id,
                    job_id = %continuation.job_id,
                    "Continuation is gone or never received a state, skipping"
                );
                continue;
            };
            if !child_state.name.eq_ignore_ascii_case(AwaitingState::NAME) {
                continue;
            }

            let next = match child_state
                .data
                .get("NextState")
                .map(|raw| serde_json::from_str::<State>(raw))
            {
                Some(Ok(next)) => next_state(next, continuation.options, parent_state),
                Some(Err(e)) => State::from(FailedState::new(
                    "ContinuationError",
                    e.to_string(),
                    format!("{e:?}"),
                ))
                .with_reason("Can not start the continuation due to de-serialization error of the next state."),
                None => State::from(FailedState::new(
                    "ContinuationError",
                    "next state is missing",
                    String::new(),
                ))
                .with_reason("Can not start the continuation: next state is missing."),
            };

            let change = StateChangeContext::new(
                context.storage,
                connection,
                &continuation.job_id,
                next,
            )
            .expect_state(AwaitingState::NAME);
            context.state_changer.change_state(change).await?;
        }
        Ok(())
    }
}

impl Default for ContinuationsSupport {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

#[async_trait]
impl JobFilter for ContinuationsSupport {
    fn name(&self) -> &'static str {
        "ContinuationsSupport"
    }

    async fn on_state_election(&self, context: &mut ElectStateContext<'_>) -> Result<(), Error> {
        match context.candidate_state() {
            State::Awaiting(awaiting) => {
                let awaiting = awaiting.clone();
                self.add_continuation(context, awaiting).await
            }
            state if releases_continuations(state.name()) => {
                self.execute_continuations(context).await
            }
            _ => Ok(()),
        }
    }
}

fn releases_continuations(state_name: &str) -> bool {
    state_name.eq_ignore_ascii_case(SucceededState::NAME)
        || state_name.eq_ignore_ascii_case(DeletedState::NAME)
}

fn next_state(next: State, options: ContinuationOptions, parent_state: &str) -> State {
    if options == ContinuationOptions::OnlyOnSucceededState
        && !parent_state.eq_ignore_ascii_case(SucceededState::NAME)
    {
        return State::from(DeletedState::default())
            .with_reason(format!("Missed continuation: parent job ended up in {parent_state} state"));
    }
    next
}

async fn load_continuations(
    connection: &dyn StorageConnection,
    parent_id: &str,
) -> Result<Vec<Continuation>, Error> {
    match connection
        .get_job_parameter(parent_id, CONTINUATIONS_PARAMETER)
        .await?
    {
        Some(raw) => Ok(serde_json::from_str(&raw).map_err(StorageError::from)?),
        None => Ok(Vec::new()),
    }
}

/// A child registers itself before its first state is committed. `None`
/// when the child never got one or has since expired.
async fn wait_for_state(
    connection: &dyn StorageConnection,
    job_id: &str,
) -> Result<Option<StateData>, Error> {
    let deadline = tokio::time::Instant::now() + CHILD_STATE_WAIT;
    loop {
        if connection.get_job_data(job_id).await?.is_none() {
            return Ok(None);
        }
        if let Some(state) = connection.get_state_data(job_id).await? {
            return Ok(Some(state));
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(CHILD_STATE_POLL).await;
    }
}
