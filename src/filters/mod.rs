//! Job filters: hooks around job creation and state transitions.
//!
//! Filters come from two places: the global [`FilterCollection`] and the
//! filters attached to a registered method. For each operation the two are
//! merged into one ordered pipeline (see [`FilterCollection::for_job`]).

mod continuations;
mod latency;
mod queue;
mod retry;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

pub use continuations::ContinuationsSupport;
pub use latency::LatencyTimeout;
pub use queue::QueueOverride;
pub use retry::{AttemptsExceededAction, AutomaticRetry, DEFAULT_RETRY_ATTEMPTS};

use crate::client::CreateContext;
use crate::common::BackgroundJob;
use crate::error::Error;
use crate::states::{ApplyStateContext, ElectStateContext};
use crate::storage::WriteTransaction;

/// A hook into job creation and state transitions. Every hook defaults to
/// doing nothing.
///
/// Election hooks may replace the candidate state or cancel the transition.
/// Apply hooks run synchronously inside the transition's transaction and can
/// only add writes to it.
#[async_trait]
pub trait JobFilter: Send + Sync {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Lower runs first. Filters with equal order keep their registration order.
    fn order(&self) -> i32 {
        0
    }

    /// Filters sharing a key replace each other: a method-level filter
    /// overrides the global one with the same key.
    fn unique_key(&self) -> Option<&'static str> {
        None
    }

    async fn on_creating(&self, _context: &mut CreateContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// `job` is `None` when creation was canceled.
    async fn on_created(
        &self,
        _context: &CreateContext<'_>,
        _job: Option<&BackgroundJob>,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn on_state_election(&self, _context: &mut ElectStateContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    fn on_state_applied(
        &self,
        _context: &ApplyStateContext<'_>,
        _transaction: &mut dyn WriteTransaction,
    ) {
    }

    fn on_state_unapplied(
        &self,
        _context: &ApplyStateContext<'_>,
        _transaction: &mut dyn WriteTransaction,
    ) {
    }
}

/// Process-wide filters.
#[derive(Clone)]
pub struct FilterCollection {
    filters: Vec<Arc<dyn JobFilter>>,
}

impl FilterCollection {
    /// No filters at all, not even retries.
    pub fn empty() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    pub fn add(&mut self, filter: impl JobFilter + 'static) -> &mut Self {
        self.add_shared(Arc::new(filter))
    }

    pub fn add_shared(&mut self, filter: Arc<dyn JobFilter>) -> &mut Self {
        self.filters.push(filter);
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Merge the global filters with a job's own, then sort by order.
    ///
    /// Globals come first so that, at equal order, method-level filters run
    /// after them. A global filter is dropped when the job carries one with
    /// the same unique key.
    pub fn for_job(&self, job_filters: Vec<Arc<dyn JobFilter>>) -> Vec<Arc<dyn JobFilter>> {
        let overridden: HashSet<&'static str> =
            job_filters.iter().filter_map(|f| f.unique_key()).collect();

        let mut pipeline: Vec<Arc<dyn JobFilter>> = self
            .filters
            .iter()
            .filter(|f| f.unique_key().is_none_or(|key| !overridden.contains(key)))
            .cloned()
            .chain(job_filters)
            .collect();
        pipeline.sort_by_key(|f| f.order());
        pipeline
    }
}

impl Default for FilterCollection {
    /// Automatic retries and continuation support.
    fn default() -> Self {
        let mut filters = Self::empty();
        filters
            .add(AutomaticRetry::default())
            .add(ContinuationsSupport::default());
        filters
    }
}

impl std::fmt::Debug for FilterCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.filters.iter().map(|filter| filter.name()))
            .finish()
    }
}
