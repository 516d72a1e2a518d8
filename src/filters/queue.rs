//! Route a method's jobs to a fixed queue.

use async_trait::async_trait;

use crate::error::{Error, ValidationError};
use crate::filters::JobFilter;
use crate::states::state::validate_queue_name;
use crate::states::{ElectStateContext, State};

/// Rewrites the queue of every Enqueued candidate. Runs after all other
/// filters so that states elected by them are routed too.
#[derive(Debug, Clone)]
pub struct QueueOverride {
    queue: String,
}

impl QueueOverride {
    pub fn new(queue: impl Into<String>) -> Result<Self, ValidationError> {
        let queue = queue.into();
        validate_queue_name(&queue)?;
        Ok(Self { queue })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl JobFilter for QueueOverride {
    fn name(&self) -> &'static str {
        "QueueOverride"
    }

    fn order(&self) -> i32 {
        i32::MAX
    }

    async fn on_state_election(&self, context: &mut ElectStateContext<'_>) -> Result<(), Error> {
        if let State::Enqueued(enqueued) = context.candidate_state_mut() {
            enqueued.queue.clone_from(&self.queue);
        }
        Ok(())
    }
}
