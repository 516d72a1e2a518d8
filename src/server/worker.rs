//! Worker: fetches one job at a time and performs it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::{InvocationData, PerformContext};
use crate::error::{JobAborted, ProcessError, StorageError};
use crate::server::process::{BackgroundProcess, BackgroundProcessContext};
use crate::states::{
    BackgroundJobStateChanger, EnqueuedState, FailedState, ProcessingState, State,
    StateChangeContext, SucceededState,
};
use crate::storage::StorageConnection;

/// Pulls jobs from its queues, claims them and records their outcome.
pub struct Worker {
    worker_id: String,
    queues: Vec<String>,
    state_changer: Arc<BackgroundJobStateChanger>,
}

impl Worker {
    pub fn new(queues: Vec<String>, state_changer: Arc<BackgroundJobStateChanger>) -> Self {
        Self {
            worker_id: Uuid::new_v4().to_string(),
            queues,
            state_changer,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim the job, perform it and elect its outcome.
    async fn process(
        &self,
        context: &BackgroundProcessContext,
        connection: &dyn StorageConnection,
        job_id: &str,
    ) -> Result<(), ProcessError> {
        let storage = context.storage().as_ref();

        let processing = State::from(ProcessingState::new(context.server_id(), &self.worker_id));
        let claim = StateChangeContext::new(storage, connection, job_id, processing)
            .expect_states(&[EnqueuedState::NAME, ProcessingState::NAME]);
        let applied = self.state_changer.change_state(claim).await?;

        if !applied.as_ref().is_some_and(|s| matches!(s, State::Processing(_))) {
            debug!(
                job_id,
                applied = applied.as_ref().map(State::name).unwrap_or("<none>"),
                "Job was not moved to Processing, dropping it from the queue"
            );
            return Ok(());
        }

        let Some(outcome) = self.perform(context, connection, job_id).await? else {
            return Ok(());
        };

        let finish = StateChangeContext::new(storage, connection, job_id, outcome)
            .expect_state(ProcessingState::NAME);
        self.state_changer.change_state(finish).await?;
        Ok(())
    }

    /// Run the job's method. `None` when the job disappeared meanwhile.
    async fn perform(
        &self,
        context: &BackgroundProcessContext,
        connection: &dyn StorageConnection,
        job_id: &str,
    ) -> Result<Option<State>, ProcessError> {
        let Some(job_data) = connection.get_job_data(job_id).await? else {
            return Ok(None);
        };

        let registry = self.state_changer.registry();
        let resolved = InvocationData::from_json(&job_data.invocation)
            .and_then(|data| registry.resolve(&data));
        let job = match resolved {
            Ok(job) => job,
            Err(e) => {
                return Ok(Some(
                    State::from(FailedState::new("JobLoadError", e.to_string(), format!("{e:?}")))
                        .with_reason("The job could not be loaded."),
                ));
            }
        };
        let Some(handler) = registry.handler(&job) else {
            return Ok(Some(
                State::from(FailedState::new(
                    "JobLoadError",
                    format!("no implementation registered for {job}"),
                    String::new(),
                ))
                .with_reason("The job could not be loaded."),
            ));
        };

        let latency = (Utc::now() - job_data.created_at).num_milliseconds();
        let perform_context = PerformContext {
            job_id: job_id.to_string(),
            args: job.args().to_vec(),
            cancellation: context.shutdown_token().child_token(),
        };

        debug!(job_id, job = %job, "Performing job");
        let started = Instant::now();
        let result = AssertUnwindSafe(handler.perform(perform_context))
            .catch_unwind()
            .await;
        let duration = started.elapsed().as_millis() as i64;

        let state = match result {
            Ok(Ok(value)) => {
                info!(job_id, job = %job, duration_ms = duration, "Job succeeded");
                let result = (!value.is_null()).then_some(value);
                State::from(SucceededState::new(result, latency, duration))
            }
            Ok(Err(e)) if context.is_shutdown_requested() && is_abort(&e) => {
                info!(job_id, "Job aborted by shutdown, it will be retried");
                return Err(ProcessError::Cancelled);
            }
            Ok(Err(e)) => {
                warn!(job_id, job = %job, error = %e, "Job failed");
                State::from(FailedState::from_error(&e))
                    .with_reason("An exception occurred during performance of the job.")
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "job panicked".to_string());
                warn!(job_id, job = %job, panic = %message, "Job panicked");
                State::from(FailedState::new("Panic", message, String::new()))
                    .with_reason("An exception occurred during performance of the job.")
            }
        };
        Ok(Some(state))
    }
}

fn is_abort(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<JobAborted>())
}

#[async_trait]
impl BackgroundProcess for Worker {
    fn name(&self) -> String {
        format!("Worker #{}", &self.worker_id[..8])
    }

    async fn execute(&self, context: &BackgroundProcessContext) -> Result<(), ProcessError> {
        let connection = context.storage().connection().await?;
        let mut fetched = match connection
            .fetch_next_job(&self.queues, context.shutdown_token())
            .await
        {
            Ok(fetched) => fetched,
            Err(StorageError::Cancelled) => return Err(ProcessError::Cancelled),
            Err(e) => return Err(e.into()),
        };
        let job_id = fetched.job_id().to_string();

        match self.process(context, connection.as_ref(), &job_id).await {
            Ok(()) => {
                fetched.remove_from_queue().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(requeue_error) = fetched.requeue().await {
                    warn!(job_id = %job_id, error = %requeue_error, "Failed to requeue job");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use crate::client::BackgroundJobClient;
    use crate::common::{JobRegistry, MethodInfo, TypeInfo};
    use crate::filters::{AutomaticRetry, FilterCollection};
    use crate::storage::{JobStorage, MemoryStorage};

    fn registry() -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry.register(
            TypeInfo::new("Math"),
            MethodInfo::new("Math", "double").param("n", "int"),
            |ctx| async move {
                let n: i64 = ctx.arg(0)?;
                Ok(json!(n * 2))
            },
        );
        registry
            .register(TypeInfo::new("Math"), MethodInfo::new("Math", "explode"), |_| async {
                panic!("division by zero")
            })
            .with_filter(AutomaticRetry::new(0));
        Arc::new(registry)
    }

    fn worker(registry: Arc<JobRegistry>) -> Worker {
        let changer = Arc::new(BackgroundJobStateChanger::new(
            registry,
            Arc::new(FilterCollection::default()),
        ));
        Worker::new(vec!["default".into()], changer)
    }

    fn context(storage: &MemoryStorage) -> BackgroundProcessContext {
        BackgroundProcessContext::new("test-server", Arc::new(storage.clone()), CancellationToken::new())
    }

    async fn enqueue(storage: &MemoryStorage, method: &str, args: Vec<serde_json::Value>) -> String {
        let registry = registry();
        let client = BackgroundJobClient::new(
            Arc::new(storage.clone()),
            registry.clone(),
            Arc::new(FilterCollection::default()),
        );
        let job = registry.job("Math", method, args).unwrap();
        client.enqueue(job).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn performs_and_records_the_result() {
        let storage = MemoryStorage::new();
        let id = enqueue(&storage, "double", vec![json!(21)]).await;

        worker(registry()).execute(&context(&storage)).await.unwrap();

        let connection = storage.connection().await.unwrap();
        let state = connection.get_state_data(&id).await.unwrap().unwrap();
        assert_eq!(state.name, "Succeeded");
        assert_eq!(state.data["Result"], "42");
        assert!(storage.queued_job_ids("default").is_empty());
    }

    #[tokio::test]
    async fn panicking_job_fails() {
        let storage = MemoryStorage::new();
        let id = enqueue(&storage, "explode", vec![]).await;

        worker(registry()).execute(&context(&storage)).await.unwrap();

        let connection = storage.connection().await.unwrap();
        let state = connection.get_state_data(&id).await.unwrap().unwrap();
        assert_eq!(state.name, "Failed");
        assert_eq!(state.data["ExceptionType"], "Panic");
        assert_eq!(state.data["ExceptionMessage"], "division by zero");
    }

    #[tokio::test]
    async fn unloadable_job_fails_instead_of_processing() {
        let storage = MemoryStorage::new();
        let id = enqueue(&storage, "double", vec![json!(1)]).await;

        worker(Arc::new(JobRegistry::new()))
            .execute(&context(&storage))
            .await
            .unwrap();

        // The load failure goes through election, so the default retry
        // filter reschedules it.
        let connection = storage.connection().await.unwrap();
        let history = connection.get_state_history(&id).await.unwrap();
        let names: Vec<&str> = history.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["Enqueued", "Failed", "Scheduled"]);
        assert_eq!(history[1].data["ExceptionType"], "JobLoadError");
        assert!(storage.queued_job_ids("default").is_empty());
    }

    /// A `Shutdown.run` job that requests shutdown itself, then fails either
    /// by observing cancellation or with an unrelated error.
    async fn run_during_shutdown(
        observes_cancellation: bool,
    ) -> (MemoryStorage, String, Result<(), ProcessError>) {
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let mut registry = JobRegistry::new();
        registry
            .register(
                TypeInfo::new("Shutdown"),
                MethodInfo::new("Shutdown", "run"),
                move |ctx| {
                    let shutdown = shutdown.clone();
                    async move {
                        shutdown.cancel();
                        if observes_cancellation {
                            ctx.check_cancellation()?;
                        }
                        Err(anyhow::anyhow!("disk full"))
                    }
                },
            )
            .with_filter(AutomaticRetry::new(0));
        let registry = Arc::new(registry);

        let storage = MemoryStorage::new();
        let client = BackgroundJobClient::new(
            Arc::new(storage.clone()),
            registry.clone(),
            Arc::new(FilterCollection::default()),
        );
        let job = registry.job("Shutdown", "run", vec![]).unwrap();
        let id = client.enqueue(job).await.unwrap().unwrap();

        let context = BackgroundProcessContext::new("s", Arc::new(storage.clone()), token);
        let result = worker(registry).execute(&context).await;
        (storage, id, result)
    }

    #[tokio::test]
    async fn aborted_job_goes_back_to_its_queue() {
        let (storage, id, result) = run_during_shutdown(true).await;
        assert!(matches!(result, Err(e) if e.is_cancellation()));

        let connection = storage.connection().await.unwrap();
        let state = connection.get_state_data(&id).await.unwrap().unwrap();
        assert_eq!(state.name, "Processing");
        assert_eq!(storage.queued_job_ids("default"), vec![id]);
    }

    #[tokio::test]
    async fn unrelated_error_during_shutdown_still_fails_the_job() {
        let (storage, id, result) = run_during_shutdown(false).await;
        assert!(result.is_ok());

        let connection = storage.connection().await.unwrap();
        let state = connection.get_state_data(&id).await.unwrap().unwrap();
        assert_eq!(state.name, "Failed");
        assert_eq!(state.data["ExceptionMessage"], "disk full");
        assert!(storage.queued_job_ids("default").is_empty());
    }

    #[tokio::test]
    async fn fetch_stops_on_shutdown() {
        let storage = MemoryStorage::new();
        let token = CancellationToken::new();
        let context = BackgroundProcessContext::new("s", Arc::new(storage.clone()), token.clone());
        token.cancel();

        let result = worker(registry()).execute(&context).await;
        assert!(matches!(result, Err(e) if e.is_cancellation()));
    }
}
