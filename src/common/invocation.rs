//! Serialized form of a job descriptor, as persisted by storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::job::Job;
use crate::error::JobLoadError;

/// `{type, method, parameter types, arguments}`: everything needed to find
/// and call the method again, possibly in another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationData {
    #[serde(rename = "Type")]
    pub type_name: String,
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "ParameterTypes")]
    pub parameter_types: Vec<String>,
    #[serde(rename = "Arguments")]
    pub arguments: Vec<Value>,
}

impl InvocationData {
    pub fn from_job(job: &Job) -> Self {
        Self {
            type_name: job.type_name().to_string(),
            method: job.method().name.clone(),
            parameter_types: job.method().parameter_types(),
            arguments: job.args().to_vec(),
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings and JSON values inside: serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, JobLoadError> {
        serde_json::from_str(json).map_err(|e| JobLoadError::Decode(e.to_string()))
    }
}
