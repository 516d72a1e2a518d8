//! Job descriptor: an immutable, validated method-call representation.
//!
//! A [`Job`] records which method of which type to invoke and with which
//! serialized arguments. Method metadata is declared explicitly through
//! [`MethodInfo`] / [`TypeInfo`] (usually via the [`JobRegistry`]) rather than
//! discovered at runtime, but the validation rules are the same: only public,
//! fully-bound methods taking plain by-value data are accepted.
//!
//! [`JobRegistry`]: crate::common::JobRegistry

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ValidationError;

/// Accessibility of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    NonPublic,
}

/// How a parameter is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterMode {
    Value,
    Ref,
    Out,
}

/// Category of a parameter's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    /// Plain serializable data.
    Data,
    /// A callable (closure, function pointer, delegate).
    Delegate,
    /// A captured expression tree.
    Expression,
}

/// Shape of a method's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    Unit,
    Value,
    /// Returns an awaitable the caller can observe.
    Future,
    /// Starts asynchronous work but returns nothing to await on.
    AsyncUnit,
}

/// A declared method parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterInfo {
    pub name: String,
    pub type_name: String,
    pub mode: ParameterMode,
    pub kind: ParameterKind,
}

impl ParameterInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            mode: ParameterMode::Value,
            kind: ParameterKind::Data,
        }
    }

    pub fn by_ref(mut self) -> Self {
        self.mode = ParameterMode::Ref;
        self
    }

    pub fn out(mut self) -> Self {
        self.mode = ParameterMode::Out;
        self
    }

    pub fn delegate(mut self) -> Self {
        self.kind = ParameterKind::Delegate;
        self
    }

    pub fn expression(mut self) -> Self {
        self.kind = ParameterKind::Expression;
        self
    }
}

/// Declared metadata of an invocable method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    /// `None` for free-standing (global) functions.
    pub declaring_type: Option<String>,
    pub visibility: Visibility,
    /// Generic parameters that are still unbound.
    pub open_generic_parameters: Vec<String>,
    pub parameters: Vec<ParameterInfo>,
    pub return_shape: ReturnShape,
}

impl MethodInfo {
    /// A public method returning a value, declared on `declaring_type`.
    pub fn new(declaring_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declaring_type: Some(declaring_type.into()),
            visibility: Visibility::Public,
            open_generic_parameters: Vec::new(),
            parameters: Vec::new(),
            return_shape: ReturnShape::Value,
        }
    }

    /// A free-standing function with no declaring type.
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            declaring_type: None,
            ..Self::new("", name)
        }
    }

    /// Add a by-value data parameter.
    pub fn param(self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.with_parameter(ParameterInfo::new(name, type_name))
    }

    pub fn with_parameter(mut self, parameter: ParameterInfo) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn non_public(mut self) -> Self {
        self.visibility = Visibility::NonPublic;
        self
    }

    pub fn generic(mut self, parameter: impl Into<String>) -> Self {
        self.open_generic_parameters.push(parameter.into());
        self
    }

    pub fn returns(mut self, shape: ReturnShape) -> Self {
        self.return_shape = shape;
        self
    }

    /// Type names of the parameters, in declaration order.
    pub fn parameter_types(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.type_name.clone()).collect()
    }
}

/// Declared metadata of a job type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub name: String,
    /// Base types and implemented interfaces this type can stand in for.
    pub assignable_to: Vec<String>,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            assignable_to: Vec::new(),
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.assignable_to.push(base.into());
        self
    }

    /// Whether a value of this type can be used where `other` is expected.
    pub fn is_assignable_to(&self, other: &str) -> bool {
        self.name == other || self.assignable_to.iter().any(|b| b == other)
    }
}

/// A validated, immutable `{Type, Method, Args}` descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    type_info: TypeInfo,
    method: MethodInfo,
    args: Vec<Value>,
}

impl Job {
    /// Build a job, rejecting methods that cannot be invoked out of process.
    pub fn new(
        type_info: TypeInfo,
        method: MethodInfo,
        args: Vec<Value>,
    ) -> Result<Self, ValidationError> {
        validate(&type_info, &method, args.len())?;
        Ok(Self {
            type_info,
            method,
            args,
        })
    }

    pub fn type_info(&self) -> &TypeInfo {
        &self.type_info
    }

    pub fn type_name(&self) -> &str {
        &self.type_info.name
    }

    pub fn method(&self) -> &MethodInfo {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_info.name, self.method.name)
    }
}

/// A persisted job as seen by the state machine.
///
/// `job` is `None` when the stored descriptor no longer resolves.
#[derive(Debug, Clone)]
pub struct BackgroundJob {
    pub id: String,
    pub job: Option<Job>,
    pub created_at: DateTime<Utc>,
}

fn validate(
    type_info: &TypeInfo,
    method: &MethodInfo,
    argument_count: usize,
) -> Result<(), ValidationError> {
    if method.visibility != Visibility::Public {
        return Err(ValidationError::unsupported(
            "Only public methods can be invoked in the background",
        ));
    }

    if !method.open_generic_parameters.is_empty() {
        return Err(ValidationError::unsupported(format!(
            "Job method can not contain unassigned generic type parameters: {}",
            method.open_generic_parameters.join(", ")
        )));
    }

    let Some(declaring_type) = method.declaring_type.as_deref() else {
        return Err(ValidationError::unsupported(
            "Global methods are not supported, use type methods instead",
        ));
    };

    if !type_info.is_assignable_to(declaring_type) {
        return Err(ValidationError::TypeMismatch {
            declaring_type: declaring_type.to_string(),
            job_type: type_info.name.clone(),
        });
    }

    if method.return_shape == ReturnShape::AsyncUnit {
        return Err(ValidationError::unsupported(
            "Async methods returning nothing awaitable are not supported",
        ));
    }

    if method.parameters.len() != argument_count {
        return Err(ValidationError::ArgumentCountMismatch {
            expected: method.parameters.len(),
            actual: argument_count,
        });
    }

    for parameter in &method.parameters {
        match parameter.mode {
            ParameterMode::Out => {
                return Err(ValidationError::unsupported(format!(
                    "Output parameter '{}' is not supported: the method may run in another process",
                    parameter.name
                )));
            }
            ParameterMode::Ref => {
                return Err(ValidationError::unsupported(format!(
                    "Parameter '{}' passed by reference is not supported: the method may run in another process",
                    parameter.name
                )));
            }
            ParameterMode::Value => {}
        }

        if parameter.kind != ParameterKind::Data {
            return Err(ValidationError::unsupported(format!(
                "Parameter '{}' is a delegate or expression, which can not be serialized",
                parameter.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mailer() -> TypeInfo {
        TypeInfo::new("Mailer")
    }

    fn send() -> MethodInfo {
        MethodInfo::new("Mailer", "send").param("to", "string")
    }

    fn unsupported(result: Result<Job, ValidationError>) -> bool {
        matches!(result, Err(ValidationError::UnsupportedMethod { .. }))
    }

    #[test]
    fn accepts_public_bound_method() {
        let job = Job::new(mailer(), send(), vec![json!("a@b.c")]).unwrap();
        assert_eq!(job.to_string(), "Mailer.send");
        assert_eq!(job.args().len(), 1);
    }

    #[test]
    fn accepts_method_declared_on_base_type() {
        let derived = TypeInfo::new("SmtpMailer").with_base("Mailer");
        assert!(Job::new(derived, send(), vec![json!("x")]).is_ok());
    }

    #[test]
    fn rejects_non_public_method() {
        assert!(unsupported(Job::new(mailer(), send().non_public(), vec![json!("x")])));
    }

    #[test]
    fn rejects_open_generic_method() {
        assert!(unsupported(Job::new(mailer(), send().generic("T"), vec![json!("x")])));
    }

    #[test]
    fn rejects_global_method() {
        let method = MethodInfo::global("cleanup");
        assert!(unsupported(Job::new(mailer(), method, vec![])));
    }

    #[test]
    fn rejects_unrelated_declaring_type() {
        let result = Job::new(TypeInfo::new("Billing"), send(), vec![json!("x")]);
        assert!(matches!(result, Err(ValidationError::TypeMismatch { .. })));
    }

    #[test]
    fn rejects_async_unit_method() {
        let method = send().returns(ReturnShape::AsyncUnit);
        assert!(unsupported(Job::new(mailer(), method, vec![json!("x")])));
    }

    #[test]
    fn awaitable_method_is_fine() {
        let method = send().returns(ReturnShape::Future);
        assert!(Job::new(mailer(), method, vec![json!("x")]).is_ok());
    }

    #[test]
    fn rejects_argument_count_mismatch() {
        let result = Job::new(mailer(), send(), vec![]);
        assert_eq!(
            result.unwrap_err(),
            ValidationError::ArgumentCountMismatch {
                expected: 1,
                actual: 0
            }
        );
    }

    #[test]
    fn rejects_ref_and_out_parameters() {
        let by_ref = MethodInfo::new("Mailer", "send")
            .with_parameter(ParameterInfo::new("count", "int").by_ref());
        let out = MethodInfo::new("Mailer", "send")
            .with_parameter(ParameterInfo::new("count", "int").out());
        assert!(unsupported(Job::new(mailer(), by_ref, vec![json!(1)])));
        assert!(unsupported(Job::new(mailer(), out, vec![json!(1)])));
    }

    #[test]
    fn rejects_delegate_and_expression_parameters() {
        let delegate = MethodInfo::new("Mailer", "send")
            .with_parameter(ParameterInfo::new("callback", "Fn()").delegate());
        let expression = MethodInfo::new("Mailer", "send")
            .with_parameter(ParameterInfo::new("selector", "Expr").expression());
        assert!(unsupported(Job::new(mailer(), delegate, vec![json!(null)])));
        assert!(unsupported(Job::new(mailer(), expression, vec![json!(null)])));
    }
}
