//! In-memory storage.
//!
//! Everything lives behind one mutex, so a committed transaction is applied
//! atomically and reads never observe half of one. Workers waiting for jobs
//! are woken through a [`Notify`] instead of polling, with a periodic poll
//! as a fallback. Every committed batch is also recorded in a journal that
//! tests can inspect.
//!
//! The data does not survive the process. It is meant for tests, demos and
//! single-process deployments that can afford to lose queued work.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::{Clock, InvocationData, SystemClock};
use crate::error::{ProcessError, StorageError};
use crate::server::{BackgroundProcess, BackgroundProcessContext};
use crate::states::State;
use crate::storage::traits::{
    DistributedLock, FetchedJob, JobData, JobStorage, ServerContext, ServerRecord, StateData,
    StorageConnection, WriteTransaction,
};

/// Tuning knobs of [`MemoryStorage`].
#[derive(Debug, Clone)]
pub struct MemoryStorageOptions {
    /// Upper bound on how long an idle fetch sleeps between queue checks.
    pub fetch_poll_interval: Duration,
    /// A fetched job that is neither removed nor requeued within this time
    /// becomes visible to other workers again.
    pub invisibility_timeout: Duration,
    /// How often expired jobs and counters are purged.
    pub expiration_check_interval: Duration,
    /// Number of committed transactions kept in the journal.
    pub journal_capacity: usize,
}

impl Default for MemoryStorageOptions {
    fn default() -> Self {
        Self {
            fetch_poll_interval: Duration::from_secs(1),
            invisibility_timeout: Duration::from_secs(30 * 60),
            expiration_check_interval: Duration::from_secs(30 * 60),
            journal_capacity: 1_000,
        }
    }
}

/// One buffered write, as recorded in the journal.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    ExpireJob { job_id: String, expire_in: Duration },
    PersistJob { job_id: String },
    SetJobState { job_id: String, state: StateData },
    AddJobState { job_id: String, state: StateData },
    AddToQueue { queue: String, job_id: String },
    IncrementCounter { key: String, expire_in: Option<Duration> },
    DecrementCounter { key: String, expire_in: Option<Duration> },
    AddToSet { key: String, value: String, score: f64 },
    RemoveFromSet { key: String, value: String },
    InsertToList { key: String, value: String },
    RemoveFromList { key: String, value: String },
    TrimList { key: String, keep_start: usize, keep_end: usize },
    SetRangeInHash { key: String, fields: BTreeMap<String, String> },
    RemoveHash { key: String },
}

// ── Data ────────────────────────────────────────────────────────────

struct JobRecord {
    invocation: String,
    parameters: HashMap<String, String>,
    created_at: DateTime<Utc>,
    expire_at: Option<DateTime<Utc>>,
    state: Option<StateData>,
    history: Vec<StateData>,
}

struct QueuedItem {
    job_id: String,
    fetch_token: Option<u64>,
    fetched_at: Option<DateTime<Utc>>,
}

struct Counter {
    value: i64,
    expire_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Data {
    next_job_id: u64,
    next_fetch_token: u64,
    jobs: HashMap<String, JobRecord>,
    queues: HashMap<String, VecDeque<QueuedItem>>,
    sets: HashMap<String, HashMap<String, f64>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
    counters: HashMap<String, Counter>,
    servers: HashMap<String, ServerRecord>,
    journal: VecDeque<Vec<WriteOp>>,
}

fn deadline(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Data {
    fn apply(&mut self, op: &WriteOp, now: DateTime<Utc>) {
        match op {
            WriteOp::ExpireJob { job_id, expire_in } => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    job.expire_at = Some(deadline(now, *expire_in));
                }
            }
            WriteOp::PersistJob { job_id } => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    job.expire_at = None;
                }
            }
            WriteOp::SetJobState { job_id, state } => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    job.state = Some(state.clone());
                    job.history.push(state.clone());
                }
            }
            WriteOp::AddJobState { job_id, state } => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    job.history.push(state.clone());
                }
            }
            WriteOp::AddToQueue { queue, job_id } => {
                self.queues
                    .entry(queue.clone())
                    .or_default()
                    .push_back(QueuedItem {
                        job_id: job_id.clone(),
                        fetch_token: None,
                        fetched_at: None,
                    });
            }
            WriteOp::IncrementCounter { key, expire_in } => self.add_to_counter(key, 1, *expire_in, now),
            WriteOp::DecrementCounter { key, expire_in } => self.add_to_counter(key, -1, *expire_in, now),
            WriteOp::AddToSet { key, value, score } => {
                self.sets
                    .entry(key.clone())
                    .or_default()
                    .insert(value.clone(), *score);
            }
            WriteOp::RemoveFromSet { key, value } => {
                if let Some(set) = self.sets.get_mut(key) {
                    set.remove(value);
                    if set.is_empty() {
                        self.sets.remove(key);
                    }
                }
            }
            WriteOp::InsertToList { key, value } => {
                self.lists.entry(key.clone()).or_default().insert(0, value.clone());
            }
            WriteOp::RemoveFromList { key, value } => {
                if let Some(list) = self.lists.get_mut(key) {
                    list.retain(|v| v != value);
                }
            }
            WriteOp::TrimList {
                key,
                keep_start,
                keep_end,
            } => {
                if let Some(list) = self.lists.get_mut(key) {
                    let kept: Vec<String> = list
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| i >= keep_start && i <= keep_end)
                        .map(|(_, v)| v.clone())
                        .collect();
                    *list = kept;
                }
            }
            WriteOp::SetRangeInHash { key, fields } => {
                self.hashes
                    .entry(key.clone())
                    .or_default()
                    .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            WriteOp::RemoveHash { key } => {
                self.hashes.remove(key);
            }
        }
    }

    fn add_to_counter(&mut self, key: &str, delta: i64, expire_in: Option<Duration>, now: DateTime<Utc>) {
        let counter = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expire_at: None,
        });
        counter.value += delta;
        if let Some(expire_in) = expire_in {
            counter.expire_at = Some(deadline(now, expire_in));
        }
    }

    fn record(&mut self, ops: Vec<WriteOp>, capacity: usize) {
        self.journal.push_back(ops);
        while self.journal.len() > capacity {
            self.journal.pop_front();
        }
    }
}

struct Inner {
    data: Mutex<Data>,
    locks: Mutex<HashSet<String>>,
    queue_signal: Notify,
    lock_released: Notify,
    clock: Arc<dyn Clock>,
    options: MemoryStorageOptions,
}

impl Inner {
    fn data(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_lock(&self, resource: &str) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(resource.to_string())
    }

    fn unlock(&self, resource: &str) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(resource);
        self.lock_released.notify_waiters();
    }

    fn try_fetch(&self, queues: &[String]) -> Option<(String, String, u64)> {
        let now = self.clock.now();
        let invisibility = chrono::Duration::from_std(self.options.invisibility_timeout)
            .unwrap_or(chrono::Duration::MAX);

        let mut data = self.data();
        let Data {
            queues: stored,
            next_fetch_token,
            ..
        } = &mut *data;

        for queue in queues {
            let Some(items) = stored.get_mut(queue) else {
                continue;
            };
            let available = items.iter_mut().find(|item| match item.fetched_at {
                None => true,
                Some(at) => now - at > invisibility,
            });
            if let Some(item) = available {
                *next_fetch_token += 1;
                item.fetch_token = Some(*next_fetch_token);
                item.fetched_at = Some(now);
                return Some((queue.clone(), item.job_id.clone(), *next_fetch_token));
            }
        }
        None
    }

    fn release_fetched(&self, queue: &str, token: u64, remove: bool) {
        {
            let mut data = self.data();
            let Some(items) = data.queues.get_mut(queue) else {
                return;
            };
            if remove {
                items.retain(|item| item.fetch_token != Some(token));
            } else if let Some(item) = items.iter_mut().find(|i| i.fetch_token == Some(token)) {
                item.fetch_token = None;
                item.fetched_at = None;
            }
        }
        if !remove {
            self.queue_signal.notify_waiters();
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────────

/// Process-local storage backend.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_options(MemoryStorageOptions::default(), Arc::new(SystemClock))
    }

    pub fn with_options(options: MemoryStorageOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(Data::default()),
                locks: Mutex::new(HashSet::new()),
                queue_signal: Notify::new(),
                lock_released: Notify::new(),
                clock,
                options,
            }),
        }
    }

    /// Committed transactions, oldest first.
    pub fn journal(&self) -> Vec<Vec<WriteOp>> {
        self.inner.data().journal.iter().cloned().collect()
    }

    pub fn clear_journal(&self) {
        self.inner.data().journal.clear();
    }

    /// Ids in `queue`, including fetched but unacknowledged ones.
    pub fn queued_job_ids(&self, queue: &str) -> Vec<String> {
        self.inner
            .data()
            .queues
            .get(queue)
            .map(|items| items.iter().map(|i| i.job_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn job_count(&self) -> usize {
        self.inner.data().jobs.len()
    }

    /// Purge expired jobs (with their queue entries) and counters.
    pub fn remove_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let mut data = self.inner.data();

        let before = data.jobs.len();
        data.jobs
            .retain(|_, job| job.expire_at.is_none_or(|at| at > now));
        let removed = before - data.jobs.len();

        if removed > 0 {
            let Data { jobs, queues, .. } = &mut *data;
            for items in queues.values_mut() {
                items.retain(|item| jobs.contains_key(&item.job_id));
            }
        }
        data.counters
            .retain(|_, counter| counter.expire_at.is_none_or(|at| at > now));
        removed
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("options", &self.inner.options)
            .finish()
    }
}

#[async_trait]
impl JobStorage for MemoryStorage {
    async fn connection(&self) -> Result<Box<dyn StorageConnection>, StorageError> {
        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn components(&self) -> Vec<Arc<dyn BackgroundProcess>> {
        vec![Arc::new(ExpirationManager {
            storage: self.clone(),
            interval: self.inner.options.expiration_check_interval,
        })]
    }

    fn describe(&self) -> String {
        "In-memory storage".to_string()
    }
}

// ── Transaction ─────────────────────────────────────────────────────

struct MemoryTransaction {
    inner: Arc<Inner>,
    ops: Vec<WriteOp>,
}

#[async_trait]
impl WriteTransaction for MemoryTransaction {
    fn expire_job(&mut self, job_id: &str, expire_in: Duration) {
        self.ops.push(WriteOp::ExpireJob {
            job_id: job_id.to_string(),
            expire_in,
        });
    }

    fn persist_job(&mut self, job_id: &str) {
        self.ops.push(WriteOp::PersistJob {
            job_id: job_id.to_string(),
        });
    }

    fn set_job_state(&mut self, job_id: &str, state: &State) {
        self.ops.push(WriteOp::SetJobState {
            job_id: job_id.to_string(),
            state: StateData::from(state),
        });
    }

    fn add_job_state(&mut self, job_id: &str, state: &State) {
        self.ops.push(WriteOp::AddJobState {
            job_id: job_id.to_string(),
            state: StateData::from(state),
        });
    }

    fn add_to_queue(&mut self, queue: &str, job_id: &str) {
        self.ops.push(WriteOp::AddToQueue {
            queue: queue.to_string(),
            job_id: job_id.to_string(),
        });
    }

    fn increment_counter(&mut self, key: &str, expire_in: Option<Duration>) {
        self.ops.push(WriteOp::IncrementCounter {
            key: key.to_string(),
            expire_in,
        });
    }

    fn decrement_counter(&mut self, key: &str, expire_in: Option<Duration>) {
        self.ops.push(WriteOp::DecrementCounter {
            key: key.to_string(),
            expire_in,
        });
    }

    fn add_to_set(&mut self, key: &str, value: &str, score: f64) {
        self.ops.push(WriteOp::AddToSet {
            key: key.to_string(),
            value: value.to_string(),
            score,
        });
    }

    fn remove_from_set(&mut self, key: &str, value: &str) {
        self.ops.push(WriteOp::RemoveFromSet {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    fn insert_to_list(&mut self, key: &str, value: &str) {
        self.ops.push(WriteOp::InsertToList {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    fn remove_from_list(&mut self, key: &str, value: &str) {
        self.ops.push(WriteOp::RemoveFromList {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    fn trim_list(&mut self, key: &str, keep_start: usize, keep_end: usize) {
        self.ops.push(WriteOp::TrimList {
            key: key.to_string(),
            keep_start,
            keep_end,
        });
    }

    fn set_range_in_hash(&mut self, key: &str, fields: &BTreeMap<String, String>) {
        self.ops.push(WriteOp::SetRangeInHash {
            key: key.to_string(),
            fields: fields.clone(),
        });
    }

    fn remove_hash(&mut self, key: &str) {
        self.ops.push(WriteOp::RemoveHash {
            key: key.to_string(),
        });
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let ops = std::mem::take(&mut self.ops);
        if ops.is_empty() {
            return Ok(());
        }
        let enqueued = ops.iter().any(|op| matches!(op, WriteOp::AddToQueue { .. }));

        {
            let now = self.inner.clock.now();
            let mut data = self.inner.data();
            for op in &ops {
                data.apply(op, now);
            }
            data.record(ops, self.inner.options.journal_capacity);
        }

        if enqueued {
            self.inner.queue_signal.notify_waiters();
        }
        Ok(())
    }
}

// ── Fetched job ─────────────────────────────────────────────────────

struct MemoryFetchedJob {
    inner: Arc<Inner>,
    queue: String,
    job_id: String,
    token: u64,
    released: bool,
}

#[async_trait]
impl FetchedJob for MemoryFetchedJob {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    async fn remove_from_queue(&mut self) -> Result<(), StorageError> {
        self.inner.release_fetched(&self.queue, self.token, true);
        self.released = true;
        Ok(())
    }

    async fn requeue(&mut self) -> Result<(), StorageError> {
        self.inner.release_fetched(&self.queue, self.token, false);
        self.released = true;
        Ok(())
    }
}

impl Drop for MemoryFetchedJob {
    fn drop(&mut self) {
        if !self.released {
            debug!(job_id = %self.job_id, queue = %self.queue, "Fetched job dropped unacknowledged, requeueing");
            self.inner.release_fetched(&self.queue, self.token, false);
        }
    }
}

// ── Connection ──────────────────────────────────────────────────────

struct MemoryConnection {
    inner: Arc<Inner>,
}

impl MemoryConnection {
    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }
}

#[async_trait]
impl StorageConnection for MemoryConnection {
    fn create_write_transaction(&self) -> Box<dyn WriteTransaction> {
        Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            ops: Vec::new(),
        })
    }

    async fn acquire_distributed_lock(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<DistributedLock, StorageError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let released = self.inner.lock_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.inner.try_lock(resource) {
                let inner = Arc::clone(&self.inner);
                let name = resource.to_string();
                return Ok(DistributedLock::new(resource, move || inner.unlock(&name)));
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(StorageError::LockTimeout {
                    resource: resource.to_string(),
                    timeout,
                });
            }
        }
    }

    async fn create_expired_job(
        &self,
        invocation: &InvocationData,
        parameters: &BTreeMap<String, String>,
        created_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> Result<String, StorageError> {
        let serialized = serde_json::to_string(invocation)?;
        let expire_at = deadline(self.now(), expire_in);

        let mut data = self.inner.data();
        data.next_job_id += 1;
        let id = data.next_job_id.to_string();
        data.jobs.insert(
            id.clone(),
            JobRecord {
                invocation: serialized,
                parameters: parameters
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                created_at,
                expire_at: Some(expire_at),
                state: None,
                history: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn fetch_next_job(
        &self,
        queues: &[String],
        cancellation: &CancellationToken,
    ) -> Result<Box<dyn FetchedJob>, StorageError> {
        loop {
            if cancellation.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let signal = self.inner.queue_signal.notified();
            tokio::pin!(signal);
            signal.as_mut().enable();

            if let Some((queue, job_id, token)) = self.inner.try_fetch(queues) {
                return Ok(Box::new(MemoryFetchedJob {
                    inner: Arc::clone(&self.inner),
                    queue,
                    job_id,
                    token,
                    released: false,
                }));
            }

            tokio::select! {
                _ = cancellation.cancelled() => return Err(StorageError::Cancelled),
                _ = &mut signal => {}
                _ = tokio::time::sleep(self.inner.options.fetch_poll_interval) => {}
            }
        }
    }

    async fn set_job_parameter(
        &self,
        job_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        let mut data = self.inner.data();
        let job = data.jobs.get_mut(job_id).ok_or_else(|| StorageError::NotFound {
            entity: "Job".to_string(),
            id: job_id.to_string(),
        })?;
        job.parameters.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn get_job_parameter(
        &self,
        job_id: &str,
        name: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .inner
            .data()
            .jobs
            .get(job_id)
            .and_then(|job| job.parameters.get(name).cloned()))
    }

    async fn get_job_data(&self, job_id: &str) -> Result<Option<JobData>, StorageError> {
        Ok(self.inner.data().jobs.get(job_id).map(|job| JobData {
            invocation: job.invocation.clone(),
            state_name: job.state.as_ref().map(|s| s.name.clone()),
            created_at: job.created_at,
        }))
    }

    async fn get_state_data(&self, job_id: &str) -> Result<Option<StateData>, StorageError> {
        Ok(self
            .inner
            .data()
            .jobs
            .get(job_id)
            .and_then(|job| job.state.clone()))
    }

    async fn get_state_history(&self, job_id: &str) -> Result<Vec<StateData>, StorageError> {
        Ok(self
            .inner
            .data()
            .jobs
            .get(job_id)
            .map(|job| job.history.clone())
            .unwrap_or_default())
    }

    async fn announce_server(
        &self,
        server_id: &str,
        context: &ServerContext,
    ) -> Result<(), StorageError> {
        let now = self.now();
        self.inner.data().servers.insert(
            server_id.to_string(),
            ServerRecord {
                id: server_id.to_string(),
                context: context.clone(),
                started_at: now,
                heartbeat: now,
            },
        );
        Ok(())
    }

    async fn remove_server(&self, server_id: &str) -> Result<(), StorageError> {
        self.inner.data().servers.remove(server_id);
        Ok(())
    }

    async fn heartbeat(&self, server_id: &str) -> Result<(), StorageError> {
        let now = self.now();
        let mut data = self.inner.data();
        let server = data
            .servers
            .get_mut(server_id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "Server".to_string(),
                id: server_id.to_string(),
            })?;
        server.heartbeat = now;
        Ok(())
    }

    async fn remove_timed_out_servers(&self, timeout: Duration) -> Result<usize, StorageError> {
        let now = self.now();
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let mut data = self.inner.data();
        let before = data.servers.len();
        data.servers
            .retain(|_, server| now - server.heartbeat <= timeout);
        Ok(before - data.servers.len())
    }

    async fn get_servers(&self) -> Result<Vec<ServerRecord>, StorageError> {
        let mut servers: Vec<ServerRecord> = self.inner.data().servers.values().cloned().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(servers)
    }

    async fn get_all_items_from_set(&self, key: &str) -> Result<BTreeSet<String>, StorageError> {
        Ok(self
            .inner
            .data()
            .sets
            .get(key)
            .map(|set| set.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_first_by_lowest_score_from_set(
        &self,
        key: &str,
        from_score: f64,
        to_score: f64,
    ) -> Result<Option<String>, StorageError> {
        let data = self.inner.data();
        let Some(set) = data.sets.get(key) else {
            return Ok(None);
        };
        Ok(set
            .iter()
            .filter(|(_, score)| **score >= from_score && **score <= to_score)
            .min_by(|(va, sa), (vb, sb)| sa.total_cmp(sb).then_with(|| va.cmp(vb)))
            .map(|(value, _)| value.clone()))
    }

    async fn get_set_count(&self, key: &str) -> Result<usize, StorageError> {
        Ok(self.inner.data().sets.get(key).map_or(0, HashMap::len))
    }

    async fn get_set_score(&self, key: &str, value: &str) -> Result<Option<f64>, StorageError> {
        Ok(self
            .inner
            .data()
            .sets
            .get(key)
            .and_then(|set| set.get(value).copied()))
    }

    async fn set_range_in_hash(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        self.inner
            .data()
            .hashes
            .entry(key.to_string())
            .or_default()
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn get_all_entries_from_hash(
        &self,
        key: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StorageError> {
        Ok(self.inner.data().hashes.get(key).cloned())
    }

    async fn get_value_from_hash(
        &self,
        key: &str,
        field: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .inner
            .data()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn get_all_items_from_list(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.inner.data().lists.get(key).cloned().unwrap_or_default())
    }

    async fn get_counter(&self, key: &str) -> Result<i64, StorageError> {
        Ok(self.inner.data().counters.get(key).map_or(0, |c| c.value))
    }
}

// ── Expiration ──────────────────────────────────────────────────────

/// Periodically purges expired records.
struct ExpirationManager {
    storage: MemoryStorage,
    interval: Duration,
}

#[async_trait]
impl BackgroundProcess for ExpirationManager {
    fn name(&self) -> String {
        "ExpirationManager".to_string()
    }

    async fn execute(&self, context: &BackgroundProcessContext) -> Result<(), ProcessError> {
        let removed = self.storage.remove_expired();
        if removed > 0 {
            info!(removed, "Removed expired jobs");
        }
        context.wait(self.interval).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;
    use crate::states::EnqueuedState;

    fn invocation() -> InvocationData {
        InvocationData {
            type_name: "Mailer".into(),
            method: "send".into(),
            parameter_types: vec![],
            arguments: vec![],
        }
    }

    async fn enqueued_job(connection: &dyn StorageConnection, queue: &str) -> String {
        let id = connection
            .create_expired_job(&invocation(), &BTreeMap::new(), Utc::now(), Duration::from_secs(3600))
            .await
            .unwrap();
        let mut tx = connection.create_write_transaction();
        tx.set_job_state(&id, &State::from(EnqueuedState::new(queue).unwrap()));
        tx.add_to_queue(queue, &id);
        tx.persist_job(&id);
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn fetch_returns_jobs_in_queue_priority_order() {
        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();
        let low = enqueued_job(connection.as_ref(), "default").await;
        let high = enqueued_job(connection.as_ref(), "critical").await;

        let queues = vec!["critical".to_string(), "default".to_string()];
        let token = CancellationToken::new();

        let mut first = connection.fetch_next_job(&queues, &token).await.unwrap();
        assert_eq!(first.job_id(), high);
        first.remove_from_queue().await.unwrap();

        let mut second = connection.fetch_next_job(&queues, &token).await.unwrap();
        assert_eq!(second.job_id(), low);
        second.remove_from_queue().await.unwrap();

        assert!(storage.queued_job_ids("default").is_empty());
    }

    #[tokio::test]
    async fn fetched_job_is_invisible_until_requeued() {
        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();
        let id = enqueued_job(connection.as_ref(), "default").await;
        let queues = vec!["default".to_string()];
        let token = CancellationToken::new();

        let mut fetched = connection.fetch_next_job(&queues, &token).await.unwrap();
        assert!(storage.inner.try_fetch(&queues).is_none());

        fetched.requeue().await.unwrap();
        let again = connection.fetch_next_job(&queues, &token).await.unwrap();
        assert_eq!(again.job_id(), id);
    }

    #[tokio::test]
    async fn dropped_fetch_is_requeued() {
        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();
        enqueued_job(connection.as_ref(), "default").await;
        let queues = vec!["default".to_string()];

        drop(connection.fetch_next_job(&queues, &CancellationToken::new()).await.unwrap());
        assert!(storage.inner.try_fetch(&queues).is_some());
    }

    #[tokio::test]
    async fn fetch_wakes_up_on_enqueue() {
        let storage = MemoryStorage::new();
        let queues = vec!["default".to_string()];

        let waiter = {
            let storage = storage.clone();
            let queues = queues.clone();
            tokio::spawn(async move {
                let connection = storage.connection().await.unwrap();
                let fetched = connection
                    .fetch_next_job(&queues, &CancellationToken::new())
                    .await
                    .unwrap();
                fetched.job_id().to_string()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let connection = storage.connection().await.unwrap();
        let id = enqueued_job(connection.as_ref(), "default").await;

        let fetched = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, id);
    }

    #[tokio::test]
    async fn fetch_stops_on_cancellation() {
        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let result = connection
            .fetch_next_job(&["default".to_string()], &token)
            .await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }

    #[tokio::test]
    async fn locks_are_exclusive_and_released_on_drop() {
        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();

        let lock = connection
            .acquire_distributed_lock("locks:test", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(lock.resource(), "locks:test");

        let contended = connection
            .acquire_distributed_lock("locks:test", Duration::from_millis(50))
            .await;
        assert!(contended.as_ref().is_err_and(StorageError::is_lock_timeout));

        drop(lock);
        assert!(connection
            .acquire_distributed_lock("locks:test", Duration::from_millis(50))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn waiting_lock_is_granted_after_release() {
        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();
        let lock = connection
            .acquire_distributed_lock("locks:handoff", Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = {
            let storage = storage.clone();
            tokio::spawn(async move {
                let connection = storage.connection().await.unwrap();
                connection
                    .acquire_distributed_lock("locks:handoff", Duration::from_secs(5))
                    .await
                    .is_ok()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lock);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn transaction_is_invisible_until_commit() {
        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();

        let mut tx = connection.create_write_transaction();
        tx.add_to_set("schedule", "1", 10.0);
        tx.increment_counter("stats:succeeded", None);
        assert_eq!(connection.get_set_count("schedule").await.unwrap(), 0);

        tx.commit().await.unwrap();
        assert_eq!(connection.get_set_count("schedule").await.unwrap(), 1);
        assert_eq!(connection.get_counter("stats:succeeded").await.unwrap(), 1);
        assert_eq!(storage.journal().len(), 1);
        assert_eq!(storage.journal()[0].len(), 2);
    }

    #[tokio::test]
    async fn lowest_score_within_range() {
        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();
        let mut tx = connection.create_write_transaction();
        tx.add_to_set("schedule", "late", 30.0);
        tx.add_to_set("schedule", "early", 10.0);
        tx.add_to_set("schedule", "middle", 20.0);
        tx.commit().await.unwrap();

        let first = connection
            .get_first_by_lowest_score_from_set("schedule", 0.0, 25.0)
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("early"));

        let none = connection
            .get_first_by_lowest_score_from_set("schedule", 0.0, 5.0)
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn lists_insert_at_head_and_trim() {
        let storage = MemoryStorage::new();
        let connection = storage.connection().await.unwrap();
        let mut tx = connection.create_write_transaction();
        for value in ["a", "b", "c", "d"] {
            tx.insert_to_list("recent", value);
        }
        tx.trim_list("recent", 0, 1);
        tx.commit().await.unwrap();

        assert_eq!(
            connection.get_all_items_from_list("recent").await.unwrap(),
            vec!["d".to_string(), "c".to_string()]
        );
    }

    #[tokio::test]
    async fn expired_jobs_are_purged_with_queue_entries() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let storage = MemoryStorage::with_options(MemoryStorageOptions::default(), clock.clone());
        let connection = storage.connection().await.unwrap();

        let kept = enqueued_job(connection.as_ref(), "default").await;
        let expired = connection
            .create_expired_job(&invocation(), &BTreeMap::new(), Utc::now(), Duration::from_secs(60))
            .await
            .unwrap();
        let mut tx = connection.create_write_transaction();
        tx.add_to_queue("default", &expired);
        tx.commit().await.unwrap();

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(storage.remove_expired(), 1);
        assert!(connection.get_job_data(&expired).await.unwrap().is_none());
        assert!(connection.get_job_data(&kept).await.unwrap().is_some());
        assert_eq!(storage.queued_job_ids("default"), vec![kept]);
    }

    #[tokio::test]
    async fn timed_out_servers_are_evicted() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let storage = MemoryStorage::with_options(MemoryStorageOptions::default(), clock.clone());
        let connection = storage.connection().await.unwrap();
        let context = ServerContext {
            queues: vec!["default".into()],
            worker_count: 1,
        };

        connection.announce_server("stale", &context).await.unwrap();
        clock.advance(chrono::Duration::minutes(10));
        connection.announce_server("fresh", &context).await.unwrap();

        let removed = connection
            .remove_timed_out_servers(Duration::from_secs(5 * 60))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let servers = connection.get_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "fresh");
        assert!(matches!(
            connection.heartbeat("stale").await,
            Err(StorageError::NotFound { .. })
        ));
    }
}
