//! Job descriptors and the registry that resolves them.

pub mod clock;
pub mod invocation;
pub mod job;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use invocation::InvocationData;
pub use job::{BackgroundJob, Job, MethodInfo, ParameterInfo, ReturnShape, TypeInfo};
pub use registry::{JobMethod, JobRegistry, PerformContext, RegisteredMethod};
