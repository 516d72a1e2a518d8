//! Server side: supervised background processes and the job server.

pub mod delayed;
pub mod heartbeat;
pub mod job_server;
pub mod process;
pub mod processing_server;
pub mod supervisor;
pub mod worker;

pub use delayed::DelayedJobScheduler;
pub use heartbeat::{ServerHeartbeat, ServerWatchdog};
pub use job_server::BackgroundJobServer;
pub use process::{BackgroundProcess, BackgroundProcessContext};
pub use processing_server::{BackgroundProcessingServer, BackgroundProcessingServerOptions};
pub use supervisor::{Backoff, run_supervised};
pub use worker::Worker;
