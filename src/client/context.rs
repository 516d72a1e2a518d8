use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::common::Job;
use crate::states::State;
use crate::storage::{JobStorage, StorageConnection};

/// Everything known about a job that is about to be created.
pub struct CreateContext<'a> {
    pub storage: &'a dyn JobStorage,
    pub connection: &'a dyn StorageConnection,
    pub job: Job,
    /// State applied right after the job is stored. `None` leaves the job
    /// stateless, so it simply expires.
    pub initial_state: Option<State>,
    /// Job parameters written together with the job.
    pub parameters: BTreeMap<String, Value>,
    /// Scratch space shared by the filters of this creation.
    pub items: HashMap<String, Value>,
    canceled: bool,
}

impl<'a> CreateContext<'a> {
    pub fn new(
        storage: &'a dyn JobStorage,
        connection: &'a dyn StorageConnection,
        job: Job,
        initial_state: Option<State>,
    ) -> Self {
        Self {
            storage,
            connection,
            job,
            initial_state,
            parameters: BTreeMap::new(),
            items: HashMap::new(),
            canceled: false,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Stop creation; nothing is stored.
    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }
}
