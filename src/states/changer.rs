//! Guarded state changes of existing jobs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::common::{BackgroundJob, InvocationData, Job, JobRegistry};
use crate::error::{Error, JobLoadError};
use crate::filters::FilterCollection;
use crate::states::machine::StateMachine;
use crate::states::state::{FailedState, State};
use crate::storage::{JobStorage, StorageConnection, keys};

/// How long a state change waits for the per-job lock.
pub const DEFAULT_JOB_LOCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// The lock held for the whole election and commit of a job's transition.
pub(crate) fn state_lock(job_id: &str) -> String {
    keys::lock(&format!("job:{job_id}:state"))
}

/// A requested transition of one job.
pub struct StateChangeContext<'a> {
    pub storage: &'a dyn JobStorage,
    pub connection: &'a dyn StorageConnection,
    pub job_id: &'a str,
    pub new_state: State,
    /// Apply only when the current state is one of these (case-insensitive).
    pub expected_states: Option<Vec<String>>,
}

impl<'a> StateChangeContext<'a> {
    pub fn new(
        storage: &'a dyn JobStorage,
        connection: &'a dyn StorageConnection,
        job_id: &'a str,
        new_state: State,
    ) -> Self {
        Self {
            storage,
            connection,
            job_id,
            new_state,
            expected_states: None,
        }
    }

    pub fn expect_state(self, state: &str) -> Self {
        self.expect_states(&[state])
    }

    pub fn expect_states(mut self, states: &[&str]) -> Self {
        self.expected_states = Some(states.iter().map(|s| s.to_string()).collect());
        self
    }
}

/// Serializes state changes per job and runs them through the state machine.
#[derive(Debug, Clone)]
pub struct BackgroundJobStateChanger {
    machine: StateMachine,
    lock_timeout: Duration,
}

impl BackgroundJobStateChanger {
    pub fn new(registry: Arc<JobRegistry>, filters: Arc<FilterCollection>) -> Self {
        Self::with_machine(StateMachine::new(registry, filters))
    }

    pub fn with_machine(machine: StateMachine) -> Self {
        Self {
            machine,
            lock_timeout: DEFAULT_JOB_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        self.machine.registry()
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Move an existing job to `context.new_state`.
    ///
    /// Returns the state that was actually applied, which filters may have
    /// replaced, or `None` when the job is missing, is not in one of the
    /// expected states, or the election was canceled.
    pub async fn change_state(
        &self,
        context: StateChangeContext<'_>,
    ) -> Result<Option<State>, Error> {
        let StateChangeContext {
            storage,
            connection,
            job_id,
            new_state,
            expected_states,
        } = context;

        let _lock = connection
            .acquire_distributed_lock(&state_lock(job_id), self.lock_timeout)
            .await?;

        let Some(job_data) = connection.get_job_data(job_id).await? else {
            debug!(job_id, "State change skipped: job does not exist");
            return Ok(None);
        };

        if let Some(expected) = &expected_states {
            let matches = job_data.state_name.as_deref().is_some_and(|current| {
                expected.iter().any(|e| e.eq_ignore_ascii_case(current))
            });
            if !matches {
                debug!(
                    job_id,
                    current = job_data.state_name.as_deref().unwrap_or("<none>"),
                    ?expected,
                    "State change skipped: job is not in an expected state"
                );
                return Ok(None);
            }
        }

        let mut candidate = new_state;
        let job = match self.load_job(&job_data.invocation) {
            Ok(job) => Some(job),
            Err(e) => {
                if !candidate.ignore_job_load_exception() {
                    warn!(job_id, error = %e, target = candidate.name(), "Job could not be loaded");
                    let reason = format!(
                        "Can not change the state to '{}': target method was not found.",
                        candidate.name()
                    );
                    candidate = State::from(FailedState::new(
                        "JobLoadError",
                        e.to_string(),
                        format!("{e:?}"),
                    ))
                    .with_reason(reason);
                }
                None
            }
        };

        let background_job = BackgroundJob {
            id: job_id.to_string(),
            job,
            created_at: job_data.created_at,
        };

        self.machine
            .transition(
                storage,
                connection,
                self,
                &background_job,
                candidate,
                job_data.state_name.as_deref(),
            )
            .await
    }

    /// Apply a job's first state right after it was created.
    pub(crate) async fn apply_initial_state(
        &self,
        storage: &dyn JobStorage,
        connection: &dyn StorageConnection,
        background_job: &BackgroundJob,
        state: State,
    ) -> Result<Option<State>, Error> {
        let _lock = connection
            .acquire_distributed_lock(&state_lock(&background_job.id), self.lock_timeout)
            .await?;
        self.machine
            .transition(storage, connection, self, background_job, state, None)
            .await
    }

    fn load_job(&self, invocation: &str) -> Result<Job, JobLoadError> {
        let data = InvocationData::from_json(invocation)?;
        self.machine.registry().resolve(&data)
    }
}
