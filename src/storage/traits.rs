//! Storage contract.
//!
//! The engine never talks to a concrete backend. Everything it persists goes
//! through [`StorageConnection`] reads, buffered [`WriteTransaction`]s that
//! commit atomically, and scoped [`DistributedLock`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::common::InvocationData;
use crate::error::StorageError;
use crate::server::BackgroundProcess;
use crate::states::State;

/// Job row as read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct JobData {
    /// Serialized [`InvocationData`]; decoding may fail if it was tampered with.
    pub invocation: String,
    pub state_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persisted form of a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    pub name: String,
    pub reason: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl From<&State> for StateData {
    fn from(state: &State) -> Self {
        Self {
            name: state.name().to_string(),
            reason: state.reason().map(str::to_string),
            data: state.serialize_data(),
        }
    }
}

/// What a server announces about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerContext {
    pub queues: Vec<String>,
    pub worker_count: usize,
}

/// A live server record.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRecord {
    pub id: String,
    pub context: ServerContext,
    pub started_at: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
}

/// Exclusive hold on a named resource; released when dropped.
pub struct DistributedLock {
    resource: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DistributedLock {
    pub fn new(resource: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            resource: resource.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("resource", &self.resource)
            .finish()
    }
}

/// A job taken off a queue. It stays invisible to other fetchers until it is
/// removed or requeued (or its lease runs out, storage permitting).
#[async_trait]
pub trait FetchedJob: Send {
    fn job_id(&self) -> &str;

    /// Acknowledge: the job leaves the queue for good.
    async fn remove_from_queue(&mut self) -> Result<(), StorageError>;

    /// Give the job back so another worker can fetch it.
    async fn requeue(&mut self) -> Result<(), StorageError>;
}

/// Buffered writes that become visible together on [`commit`](Self::commit).
#[async_trait]
pub trait WriteTransaction: Send {
    fn expire_job(&mut self, job_id: &str, expire_in: Duration);
    fn persist_job(&mut self, job_id: &str);

    /// Set the current state and append it to the history.
    fn set_job_state(&mut self, job_id: &str, state: &State);
    /// Append to the history only.
    fn add_job_state(&mut self, job_id: &str, state: &State);

    fn add_to_queue(&mut self, queue: &str, job_id: &str);

    fn increment_counter(&mut self, key: &str, expire_in: Option<Duration>);
    fn decrement_counter(&mut self, key: &str, expire_in: Option<Duration>);

    fn add_to_set(&mut self, key: &str, value: &str, score: f64);
    fn remove_from_set(&mut self, key: &str, value: &str);

    fn insert_to_list(&mut self, key: &str, value: &str);
    fn remove_from_list(&mut self, key: &str, value: &str);
    fn trim_list(&mut self, key: &str, keep_start: usize, keep_end: usize);

    fn set_range_in_hash(&mut self, key: &str, fields: &BTreeMap<String, String>);
    fn remove_hash(&mut self, key: &str);

    async fn commit(&mut self) -> Result<(), StorageError>;
}

/// A session against storage.
#[async_trait]
pub trait StorageConnection: Send + Sync {
    fn create_write_transaction(&self) -> Box<dyn WriteTransaction>;

    /// Wait up to `timeout` for exclusive ownership of `resource`.
    async fn acquire_distributed_lock(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<DistributedLock, StorageError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Store a job with no state that disappears after `expire_in` unless a
    /// state is applied and it is persisted. Returns the new id.
    async fn create_expired_job(
        &self,
        invocation: &InvocationData,
        parameters: &BTreeMap<String, String>,
        created_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> Result<String, StorageError>;

    /// Block until a job is available on one of `queues` (checked in order)
    /// or `cancellation` fires.
    async fn fetch_next_job(
        &self,
        queues: &[String],
        cancellation: &CancellationToken,
    ) -> Result<Box<dyn FetchedJob>, StorageError>;

    async fn set_job_parameter(
        &self,
        job_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), StorageError>;

    async fn get_job_parameter(&self, job_id: &str, name: &str)
    -> Result<Option<String>, StorageError>;

    async fn get_job_data(&self, job_id: &str) -> Result<Option<JobData>, StorageError>;

    async fn get_state_data(&self, job_id: &str) -> Result<Option<StateData>, StorageError>;

    /// Full state history, oldest first.
    async fn get_state_history(&self, job_id: &str) -> Result<Vec<StateData>, StorageError>;

    // ── Servers ─────────────────────────────────────────────────────

    async fn announce_server(
        &self,
        server_id: &str,
        context: &ServerContext,
    ) -> Result<(), StorageError>;

    async fn remove_server(&self, server_id: &str) -> Result<(), StorageError>;

    /// Refresh the server's heartbeat. Fails with `NotFound` if the record
    /// has been evicted.
    async fn heartbeat(&self, server_id: &str) -> Result<(), StorageError>;

    /// Evict servers whose last heartbeat is older than `timeout`.
    async fn remove_timed_out_servers(&self, timeout: Duration) -> Result<usize, StorageError>;

    async fn get_servers(&self) -> Result<Vec<ServerRecord>, StorageError>;

    // ── Sets, hashes, lists, counters ───────────────────────────────

    async fn get_all_items_from_set(&self, key: &str) -> Result<BTreeSet<String>, StorageError>;

    /// Member with the lowest score in `[from_score, to_score]`.
    async fn get_first_by_lowest_score_from_set(
        &self,
        key: &str,
        from_score: f64,
        to_score: f64,
    ) -> Result<Option<String>, StorageError>;

    async fn get_set_count(&self, key: &str) -> Result<usize, StorageError>;

    async fn get_set_score(&self, key: &str, value: &str) -> Result<Option<f64>, StorageError>;

    async fn set_range_in_hash(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), StorageError>;

    async fn get_all_entries_from_hash(
        &self,
        key: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StorageError>;

    async fn get_value_from_hash(&self, key: &str, field: &str)
    -> Result<Option<String>, StorageError>;

    async fn get_all_items_from_list(&self, key: &str) -> Result<Vec<String>, StorageError>;

    async fn get_counter(&self, key: &str) -> Result<i64, StorageError>;
}

/// A storage backend.
#[async_trait]
pub trait JobStorage: Send + Sync {
    async fn connection(&self) -> Result<Box<dyn StorageConnection>, StorageError>;

    /// Housekeeping processes the backend wants every server to run.
    fn components(&self) -> Vec<Arc<dyn BackgroundProcess>> {
        Vec::new()
    }

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}
