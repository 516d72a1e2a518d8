//! Drop jobs that waited too long to start.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::error::Error;
use crate::filters::JobFilter;
use crate::states::{DeletedState, ElectStateContext, State};

/// Replaces a Processing candidate with Deleted once the job is older than
/// `timeout`.
#[derive(Debug, Clone)]
pub struct LatencyTimeout {
    timeout: Duration,
}

impl LatencyTimeout {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl JobFilter for LatencyTimeout {
    fn name(&self) -> &'static str {
        "LatencyTimeout"
    }

    async fn on_state_election(&self, context: &mut ElectStateContext<'_>) -> Result<(), Error> {
        if !matches!(context.candidate_state(), State::Processing(_)) {
            return Ok(());
        }

        let elapsed = (Utc::now() - context.background_job.created_at)
            .to_std()
            .unwrap_or_default();
        if elapsed > self.timeout {
            warn!(
                job_id = %context.background_job.id,
                elapsed_secs = elapsed.as_secs(),
                timeout_secs = self.timeout.as_secs(),
                "Job exceeded its latency timeout, deleting"
            );
            let reason = format!(
                "Background job has exceeded latency timeout of {} second(s)",
                self.timeout.as_secs()
            );
            context.set_candidate_state(State::from(DeletedState::default()).with_reason(reason));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::common::{BackgroundJob, JobRegistry};
    use crate::filters::FilterCollection;
    use crate::states::{BackgroundJobStateChanger, EnqueuedState, ProcessingState};
    use crate::storage::{JobStorage, MemoryStorage};

    async fn elect(created_ago: chrono::Duration, candidate: State) -> (State, usize) {
        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();
        let changer = BackgroundJobStateChanger::new(
            Arc::new(JobRegistry::new()),
            Arc::new(FilterCollection::empty()),
        );
        let job = BackgroundJob {
            id: "1".into(),
            job: None,
            created_at: Utc::now() - created_ago,
        };
        let mut context = ElectStateContext::new(
            &storage,
            connection.as_ref(),
            &job,
            &changer,
            Some(EnqueuedState::NAME),
            candidate,
        );

        LatencyTimeout::new(Duration::from_secs(60))
            .on_state_election(&mut context)
            .await
            .unwrap();
        (context.candidate_state().clone(), context.traversed_states().len())
    }

    #[tokio::test]
    async fn stale_jobs_are_deleted_instead_of_processed() {
        let (state, traversed) = elect(
            chrono::Duration::minutes(5),
            ProcessingState::new("s", "w").into(),
        )
        .await;
        assert_eq!(state.name(), "Deleted");
        assert!(state.reason().unwrap_or_default().contains("60 second(s)"));
        assert_eq!(traversed, 1);
    }

    #[tokio::test]
    async fn fresh_jobs_and_other_states_pass() {
        let (state, _) = elect(
            chrono::Duration::seconds(5),
            ProcessingState::new("s", "w").into(),
        )
        .await;
        assert_eq!(state.name(), "Processing");

        let (state, traversed) =
            elect(chrono::Duration::minutes(5), EnqueuedState::default().into()).await;
        assert_eq!(state.name(), "Enqueued");
        assert_eq!(traversed, 0);
    }
}
