//! Storage bookkeeping tied to entering and leaving a state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::clock::to_timestamp;
use crate::states::machine::ApplyStateContext;
use crate::states::state::{
    AwaitingState, DeletedState, EnqueuedState, ScheduledState, State, SucceededState,
};
use crate::storage::WriteTransaction;
use crate::storage::keys;

/// Side effects of one state, run inside the transition's transaction.
pub trait StateHandler: Send + Sync {
    fn state_name(&self) -> &'static str;

    fn apply(&self, context: &ApplyStateContext<'_>, transaction: &mut dyn WriteTransaction);

    fn unapply(&self, context: &ApplyStateContext<'_>, transaction: &mut dyn WriteTransaction);
}

/// Pushes the job onto its queue.
struct EnqueuedHandler;

impl StateHandler for EnqueuedHandler {
    fn state_name(&self) -> &'static str {
        EnqueuedState::NAME
    }

    fn apply(&self, context: &ApplyStateContext<'_>, transaction: &mut dyn WriteTransaction) {
        if let State::Enqueued(state) = context.new_state {
            transaction.add_to_queue(&state.queue, &context.background_job.id);
        }
    }

    fn unapply(&self, _: &ApplyStateContext<'_>, _: &mut dyn WriteTransaction) {}
}

/// Keeps the `schedule` set in step with Scheduled jobs.
struct ScheduledHandler;

impl StateHandler for ScheduledHandler {
    fn state_name(&self) -> &'static str {
        ScheduledState::NAME
    }

    fn apply(&self, context: &ApplyStateContext<'_>, transaction: &mut dyn WriteTransaction) {
        if let State::Scheduled(state) = context.new_state {
            transaction.add_to_set(
                keys::SCHEDULE,
                &context.background_job.id,
                to_timestamp(state.enqueue_at),
            );
        }
    }

    fn unapply(&self, context: &ApplyStateContext<'_>, transaction: &mut dyn WriteTransaction) {
        transaction.remove_from_set(keys::SCHEDULE, &context.background_job.id);
    }
}

/// Keeps the `awaiting` set in step with continuations.
struct AwaitingHandler;

impl StateHandler for AwaitingHandler {
    fn state_name(&self) -> &'static str {
        AwaitingState::NAME
    }

    fn apply(&self, context: &ApplyStateContext<'_>, transaction: &mut dyn WriteTransaction) {
        transaction.add_to_set(keys::AWAITING, &context.background_job.id, 0.0);
    }

    fn unapply(&self, context: &ApplyStateContext<'_>, transaction: &mut dyn WriteTransaction) {
        transaction.remove_from_set(keys::AWAITING, &context.background_job.id);
    }
}

/// Maintains a statistics counter.
struct CounterHandler {
    state_name: &'static str,
    counter: &'static str,
}

impl StateHandler for CounterHandler {
    fn state_name(&self) -> &'static str {
        self.state_name
    }

    fn apply(&self, _: &ApplyStateContext<'_>, transaction: &mut dyn WriteTransaction) {
        transaction.increment_counter(self.counter, None);
    }

    fn unapply(&self, _: &ApplyStateContext<'_>, transaction: &mut dyn WriteTransaction) {
        transaction.decrement_counter(self.counter, None);
    }
}

/// Handlers keyed by state name.
#[derive(Clone)]
pub struct StateHandlerCollection {
    handlers: HashMap<&'static str, Vec<Arc<dyn StateHandler>>>,
}

impl StateHandlerCollection {
    /// An empty collection, without even the built-in handlers.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn add(&mut self, handler: Arc<dyn StateHandler>) {
        self.handlers
            .entry(handler.state_name())
            .or_default()
            .push(handler);
    }

    pub fn for_state(&self, state_name: &str) -> &[Arc<dyn StateHandler>] {
        self.handlers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(state_name))
            .map(|(_, handlers)| handlers.as_slice())
            .unwrap_or(&[])
    }
}

impl Default for StateHandlerCollection {
    fn default() -> Self {
        let mut collection = Self::empty();
        collection.add(Arc::new(EnqueuedHandler));
        collection.add(Arc::new(ScheduledHandler));
        collection.add(Arc::new(AwaitingHandler));
        collection.add(Arc::new(CounterHandler {
            state_name: SucceededState::NAME,
            counter: keys::STATS_SUCCEEDED,
        }));
        collection.add(Arc::new(CounterHandler {
            state_name: DeletedState::NAME,
            counter: keys::STATS_DELETED,
        }));
        collection
    }
}

impl std::fmt::Debug for StateHandlerCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandlerCollection")
            .field("states", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_bookkeeping_states() {
        let handlers = StateHandlerCollection::default();
        assert_eq!(handlers.for_state("Enqueued").len(), 1);
        assert_eq!(handlers.for_state("scheduled").len(), 1);
        assert_eq!(handlers.for_state("Succeeded").len(), 1);
        assert_eq!(handlers.for_state("Deleted").len(), 1);
        assert_eq!(handlers.for_state("Awaiting").len(), 1);
        assert!(handlers.for_state("Processing").is_empty());
        assert!(handlers.for_state("Failed").is_empty());
    }
}
