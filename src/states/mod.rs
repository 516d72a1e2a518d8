//! Job states and the machinery that moves jobs between them.

pub mod changer;
pub mod handlers;
pub mod machine;
pub mod state;

pub use changer::{BackgroundJobStateChanger, StateChangeContext};
pub use handlers::{StateHandler, StateHandlerCollection};
pub use machine::{ApplyStateContext, ElectStateContext, StateMachine};
pub use state::{
    AwaitingState, ContinuationOptions, DEFAULT_QUEUE, DeletedState, EnqueuedState,
    FailedState, ProcessingState, ScheduledState, State, SucceededState,
};
