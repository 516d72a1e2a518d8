//! Storage contract and the in-memory reference backend.

pub mod memory;
pub mod traits;

pub use memory::{MemoryStorage, MemoryStorageOptions, WriteOp};
pub use traits::{
    DistributedLock, FetchedJob, JobData, JobStorage, ServerContext, ServerRecord, StateData,
    StorageConnection, WriteTransaction,
};

/// Well-known keys.
pub mod keys {
    /// Sorted set of scheduled job ids, scored by enqueue time.
    pub const SCHEDULE: &str = "schedule";
    /// Set of job ids waiting for a parent.
    pub const AWAITING: &str = "awaiting";
    /// Set of recurring job ids.
    pub const RECURRING_JOBS: &str = "recurring-jobs";

    pub const STATS_SUCCEEDED: &str = "stats:succeeded";
    pub const STATS_DELETED: &str = "stats:deleted";

    pub fn recurring_job(id: &str) -> String {
        format!("recurring-job:{id}")
    }

    pub fn lock(resource: &str) -> String {
        format!("locks:{resource}")
    }
}
