//! Job registry: the explicit type/method table used to build and resolve jobs.
//!
//! Every invocable method is registered once at configuration time with its
//! metadata, its implementation, and optionally its own filters. Clients use
//! the registry to build validated [`Job`]s; workers use it to turn persisted
//! [`InvocationData`] back into a job and find the code to run.
//!
//! A method is identified by its name together with its parameter types, so
//! overloads live side by side.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::common::invocation::InvocationData;
use crate::common::job::{Job, MethodInfo, TypeInfo};
use crate::error::{Error, JobAborted, JobLoadError, ValidationError};
use crate::filters::JobFilter;

/// What a job method receives when it is performed.
#[derive(Debug, Clone)]
pub struct PerformContext {
    pub job_id: String,
    pub args: Vec<Value>,
    /// Fires when the hosting server shuts down. Jobs that stop early because
    /// of it should return [`JobAborted`], see [`check_cancellation`].
    ///
    /// [`check_cancellation`]: PerformContext::check_cancellation
    pub cancellation: CancellationToken,
}

impl PerformContext {
    /// Deserialize the argument at `index`.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("missing argument #{index}"))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// `Err(JobAborted)` once the server asked running jobs to stop.
    pub fn check_cancellation(&self) -> anyhow::Result<()> {
        if self.cancellation.is_cancelled() {
            Err(JobAborted.into())
        } else {
            Ok(())
        }
    }
}

/// The code behind a registered method.
#[async_trait]
pub trait JobMethod: Send + Sync {
    async fn perform(&self, context: PerformContext) -> anyhow::Result<Value>;
}

struct FnMethod<F>(F);

#[async_trait]
impl<F, Fut> JobMethod for FnMethod<F>
where
    F: Fn(PerformContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn perform(&self, context: PerformContext) -> anyhow::Result<Value> {
        (self.0)(context).await
    }
}

/// A method entry in the registry.
pub struct RegisteredMethod {
    info: MethodInfo,
    handler: Arc<dyn JobMethod>,
    filters: Vec<Arc<dyn JobFilter>>,
}

impl RegisteredMethod {
    /// Attach a filter that only applies to jobs of this method.
    pub fn with_filter(&mut self, filter: impl JobFilter + 'static) -> &mut Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn info(&self) -> &MethodInfo {
        &self.info
    }
}

struct RegisteredType {
    info: TypeInfo,
    /// Overloads by method name.
    methods: HashMap<String, Vec<RegisteredMethod>>,
}

/// Type/method table.
#[derive(Default)]
pub struct JobRegistry {
    types: HashMap<String, RegisteredType>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method implemented by an async closure.
    pub fn register<F, Fut>(
        &mut self,
        type_info: TypeInfo,
        method: MethodInfo,
        handler: F,
    ) -> &mut RegisteredMethod
    where
        F: Fn(PerformContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_method(type_info, method, Arc::new(FnMethod(handler)))
    }

    /// Register a method implemented by a [`JobMethod`].
    pub fn register_method(
        &mut self,
        type_info: TypeInfo,
        method: MethodInfo,
        handler: Arc<dyn JobMethod>,
    ) -> &mut RegisteredMethod {
        let entry = self
            .types
            .entry(type_info.name.clone())
            .or_insert_with(|| RegisteredType {
                info: type_info.clone(),
                methods: HashMap::new(),
            });
        entry.info = type_info;

        let registered = RegisteredMethod {
            info: method,
            handler,
            filters: Vec::new(),
        };
        let overloads = entry.methods.entry(registered.info.name.clone()).or_default();
        let parameter_types = registered.info.parameter_types();
        match overloads
            .iter()
            .position(|m| m.info.parameter_types() == parameter_types)
        {
            Some(index) => {
                tracing::warn!(
                    type_name = %entry.info.name,
                    method = %registered.info.name,
                    ?parameter_types,
                    "Job method registered twice, replacing the earlier registration"
                );
                overloads[index] = registered;
                &mut overloads[index]
            }
            None => {
                tracing::debug!(
                    type_name = %entry.info.name,
                    method = %registered.info.name,
                    ?parameter_types,
                    "Registered job method"
                );
                overloads.push(registered);
                let last = overloads.len() - 1;
                &mut overloads[last]
            }
        }
    }

    /// Build a validated job for a registered method. Overloads are told
    /// apart by the number of arguments.
    pub fn job(&self, type_name: &str, method: &str, args: Vec<Value>) -> Result<Job, Error> {
        let (type_info, overloads) = self.overloads(type_name, method)?;
        let mut matching = overloads
            .iter()
            .filter(|m| m.info.parameters.len() == args.len());
        let registered = match (matching.next(), matching.next()) {
            (Some(registered), None) => registered,
            (Some(_), Some(_)) => {
                return Err(ValidationError::unsupported(format!(
                    "`{type_name}.{method}` has several overloads taking {} argument(s)",
                    args.len()
                ))
                .into());
            }
            // Let the descriptor check report the count mismatch.
            (None, _) => &overloads[0],
        };
        Ok(Job::new(type_info.clone(), registered.info.clone(), args)?)
    }

    /// Turn persisted invocation data back into a job.
    pub fn resolve(&self, data: &InvocationData) -> Result<Job, JobLoadError> {
        let (type_info, overloads) = self.overloads(&data.type_name, &data.method)?;

        let Some(registered) = overloads
            .iter()
            .find(|m| m.info.parameter_types() == data.parameter_types)
        else {
            return Err(JobLoadError::ParameterMismatch {
                type_name: data.type_name.clone(),
                method: data.method.clone(),
                stored: data.parameter_types.clone(),
                registered: overloads[0].info.parameter_types(),
            });
        };

        Ok(Job::new(
            type_info.clone(),
            registered.info.clone(),
            data.arguments.clone(),
        )?)
    }

    /// Implementation of a job's method.
    pub fn handler(&self, job: &Job) -> Option<Arc<dyn JobMethod>> {
        self.method_of(job).map(|m| Arc::clone(&m.handler))
    }

    /// Filters attached to a job's method.
    pub fn filters_for(&self, job: &Job) -> Vec<Arc<dyn JobFilter>> {
        self.method_of(job)
            .map(|m| m.filters.clone())
            .unwrap_or_default()
    }

    fn method_of(&self, job: &Job) -> Option<&RegisteredMethod> {
        let parameter_types = job.method().parameter_types();
        self.overloads(job.type_name(), &job.method().name)
            .ok()?
            .1
            .iter()
            .find(|m| m.info.parameter_types() == parameter_types)
    }

    /// Every overload registered under `method`; never empty.
    fn overloads(
        &self,
        type_name: &str,
        method: &str,
    ) -> Result<(&TypeInfo, &[RegisteredMethod]), JobLoadError> {
        let registered_type = self
            .types
            .get(type_name)
            .ok_or_else(|| JobLoadError::UnknownType(type_name.to_string()))?;
        let overloads = registered_type
            .methods
            .get(method)
            .filter(|overloads| !overloads.is_empty())
            .ok_or_else(|| JobLoadError::UnknownMethod {
                type_name: type_name.to_string(),
                method: method.to_string(),
            })?;
        Ok((&registered_type.info, overloads.as_slice()))
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::AutomaticRetry;
    use serde_json::json;

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry
            .register(
                TypeInfo::new("Math"),
                MethodInfo::new("Math", "add").param("a", "i64").param("b", "i64"),
                |ctx: PerformContext| async move {
                    let a: i64 = ctx.arg(0)?;
                    let b: i64 = ctx.arg(1)?;
                    Ok(json!(a + b))
                },
            )
            .with_filter(AutomaticRetry::new(0));
        registry
    }

    #[tokio::test]
    async fn builds_and_runs_registered_method() {
        let registry = registry();
        let job = registry.job("Math", "add", vec![json!(2), json!(3)]).unwrap();
        let handler = registry.handler(&job).unwrap();
        let result = handler
            .perform(PerformContext {
                job_id: "1".into(),
                args: job.args().to_vec(),
                cancellation: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(result, json!(5));
        assert_eq!(registry.filters_for(&job).len(), 1);
    }

    #[test]
    fn resolves_invocation_data() {
        let registry = registry();
        let job = registry.job("Math", "add", vec![json!(1), json!(1)]).unwrap();
        let data = InvocationData::from_job(&job);
        assert_eq!(registry.resolve(&data).unwrap(), job);
    }

    #[test]
    fn unknown_method_fails_to_resolve() {
        let registry = registry();
        let data = InvocationData {
            type_name: "Math".into(),
            method: "mul".into(),
            parameter_types: vec![],
            arguments: vec![],
        };
        assert!(matches!(
            registry.resolve(&data),
            Err(JobLoadError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn parameter_drift_fails_to_resolve() {
        let registry = registry();
        let data = InvocationData {
            type_name: "Math".into(),
            method: "add".into(),
            parameter_types: vec!["i32".into(), "i32".into()],
            arguments: vec![json!(1), json!(2)],
        };
        assert!(matches!(
            registry.resolve(&data),
            Err(JobLoadError::ParameterMismatch { .. })
        ));
    }

    #[test]
    fn overloads_are_kept_apart() {
        let mut registry = registry();
        registry.register(
            TypeInfo::new("Math"),
            MethodInfo::new("Math", "add").param("a", "i64"),
            |ctx: PerformContext| async move {
                let a: i64 = ctx.arg(0)?;
                Ok(json!(a + 1))
            },
        );

        let binary = registry.job("Math", "add", vec![json!(2), json!(3)]).unwrap();
        let unary = registry.job("Math", "add", vec![json!(2)]).unwrap();
        assert_eq!(binary.method().parameter_types(), vec!["i64", "i64"]);
        assert_eq!(unary.method().parameter_types(), vec!["i64"]);

        // Only the binary overload carries the retry filter.
        assert_eq!(registry.filters_for(&binary).len(), 1);
        assert!(registry.filters_for(&unary).is_empty());
        assert_eq!(
            registry.resolve(&InvocationData::from_job(&unary)).unwrap(),
            unary
        );
    }

    #[test]
    fn registering_the_same_signature_replaces_it() {
        let mut registry = registry();
        registry.register(
            TypeInfo::new("Math"),
            MethodInfo::new("Math", "add").param("a", "i64").param("b", "i64"),
            |_| async { Ok(json!(0)) },
        );
        let job = registry.job("Math", "add", vec![json!(1), json!(1)]).unwrap();
        assert!(registry.filters_for(&job).is_empty());
    }

    #[test]
    fn same_arity_overloads_are_ambiguous_to_build() {
        let mut registry = registry();
        registry.register(
            TypeInfo::new("Math"),
            MethodInfo::new("Math", "add").param("a", "f64").param("b", "f64"),
            |_| async { Ok(json!(0.0)) },
        );
        assert!(matches!(
            registry.job("Math", "add", vec![json!(1), json!(2)]),
            Err(Error::Validation(ValidationError::UnsupportedMethod { .. }))
        ));
    }

    #[test]
    fn wrong_argument_count_is_rejected_at_build_time() {
        let registry = registry();
        assert!(matches!(
            registry.job("Math", "add", vec![json!(1)]),
            Err(Error::Validation(_))
        ));
    }
}
