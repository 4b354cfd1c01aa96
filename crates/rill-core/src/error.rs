//! Error types for every phase.
//!
//! ## Error Hierarchy
//!
//! ```text
//! InferError          - inference of one routine failed
//! ├── Typing            - carries a rendered-on-demand Diagnostic
//! ├── Silent            - failure while probing a candidate, no diagnostic
//! └── TooDeep           - on-demand compilation nested too far
//! RuntimeError        - dispatch failure, becomes a script exception
//! RegistrationError   - program building (duplicate names, bad slots)
//! ```
//!
//! Run-time errors are not propagated to the host directly: the execution
//! engine turns them into exception objects whose category is
//! [`RuntimeError::category`], so script code can rescue them.

use thiserror::Error;

use crate::diagnostics::Diagnostic;
use crate::ops::ScalarError;
use crate::types::{Ty, TypeTable};

// ============================================================================
// Inference Errors
// ============================================================================

/// Categories of typing errors found during inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferErrorKind {
    TypeNotConsistent,
    TypeNotMatching,
    NotInitialized,
    WrongContainer,
    DataCannotCreate,
    CallNotPermitted,
    FieldNotPermitted,
    FieldNotExist,
    NeedInstance,
    ItemWrongAccess,
    IndexNotValid,
    IndexWrongType,
    KeyNotValid,
    KeyWrongType,
    InvalidOperation,
    ParamError,
    ParamWrongNumber,
    ParamWrongType,
    ParamWrongName,
    ConstModified,
    NotImplemented,
    InvalidYield,
}

impl InferErrorKind {
    /// Message used in the diagnostic text.
    pub fn message(self) -> &'static str {
        match self {
            InferErrorKind::TypeNotConsistent => "Inconsistent typing",
            InferErrorKind::TypeNotMatching => "Types not matching",
            InferErrorKind::NotInitialized => "Variable not initialized",
            InferErrorKind::WrongContainer => "Wrong container type",
            InferErrorKind::DataCannotCreate => "Data cannot be created",
            InferErrorKind::CallNotPermitted => "Call not permitted",
            InferErrorKind::FieldNotPermitted => "Member not permitted",
            InferErrorKind::FieldNotExist => "Member not exist",
            InferErrorKind::NeedInstance => "Need class instance",
            InferErrorKind::ItemWrongAccess => "Invalid index/key access",
            InferErrorKind::IndexNotValid => "Invalid index access",
            InferErrorKind::IndexWrongType => "Invalid index type",
            InferErrorKind::KeyNotValid => "Invalid key access",
            InferErrorKind::KeyWrongType => "Invalid key type",
            InferErrorKind::InvalidOperation => "Invalid operation on the type",
            InferErrorKind::ParamError => "Invalid parameters for the call",
            InferErrorKind::ParamWrongNumber => "Invalid number of parameter",
            InferErrorKind::ParamWrongType => "Invalid parameter type",
            InferErrorKind::ParamWrongName => "Invalid parameter name",
            InferErrorKind::ConstModified => "Constant should not be modified",
            InferErrorKind::NotImplemented => "Call to un-implemented function",
            InferErrorKind::InvalidYield => "Invalid yield in ordinary routine",
        }
    }
}

impl std::fmt::Display for InferErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Inference of a routine failed.
#[derive(Debug, Clone, Error)]
pub enum InferError {
    #[error("{}", .0.summary())]
    Typing(Box<Diagnostic>),

    /// Failure while speculatively checking a candidate; nothing was reported.
    #[error("inference failed (silent)")]
    Silent,

    #[error("on-demand compilation nested deeper than {0} routines")]
    TooDeep(usize),
}

impl InferError {
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            InferError::Typing(d) => Some(d),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<InferErrorKind> {
        self.diagnostic().map(|d| d.kind)
    }
}

// ============================================================================
// Runtime Errors
// ============================================================================

/// Errors raised while executing bytecode.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("index out of range: {index} (size {size})")]
    InvalidIndex { index: i64, size: usize },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error("constant should not be modified")]
    ConstModification,

    #[error("division by zero")]
    DivisionByZero,

    #[error("floating point exception: {0}")]
    Float(&'static str),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid parameters for the call: {0}")]
    Param(String),

    #[error("stack overflow: call depth exceeds {0}")]
    StackOverflow(usize),

    #[error("value is not callable: {0}")]
    NotCallable(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("variable not initialized")]
    Uninitialized,

    /// Raised by script code.
    #[error("{category}: {message}")]
    User { category: String, message: String },
}

impl RuntimeError {
    /// Exception category the error is raised under.
    pub fn category(&self) -> &str {
        match self {
            RuntimeError::TypeMismatch { .. } | RuntimeError::NotCallable(_) => "Error::Type",
            RuntimeError::InvalidIndex { .. } => "Error::Index",
            RuntimeError::InvalidKey(_) => "Error::Key",
            RuntimeError::InvalidField(_) => "Error::Field",
            RuntimeError::ConstModification => "Error::Value",
            RuntimeError::DivisionByZero => "Error::Float::DivByZero",
            RuntimeError::Float(_) => "Error::Float",
            RuntimeError::InvalidOperation(_) => "Error::Operation",
            RuntimeError::Param(_) => "Error::Param",
            RuntimeError::StackOverflow(_) => "Error::Stack",
            RuntimeError::Process(_) => "Error::Process",
            RuntimeError::Cancelled => "Error::Cancelled",
            RuntimeError::Uninitialized => "Error::Value",
            RuntimeError::User { category, .. } => category,
        }
    }

    pub fn type_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        RuntimeError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl From<ScalarError> for RuntimeError {
    fn from(err: ScalarError) -> Self {
        match err {
            ScalarError::DivisionByZero => RuntimeError::DivisionByZero,
            ScalarError::Unsupported => RuntimeError::InvalidOperation("unsupported operands".into()),
        }
    }
}

/// Exception type of a `::`-separated category; each prefix is an ancestor.
///
/// `"Error::Float::DivByZero"` derives from `"Error::Float"`, which derives
/// from `"Error"`, which derives from `"Exception"`.
pub fn exception_type(category: &str) -> Ty {
    let types = TypeTable::global();
    let root = types.exception("Exception", None);
    if category == "Exception" || category.is_empty() {
        return root;
    }
    let mut current = root;
    let mut path = String::new();
    for part in category.split("::") {
        if !path.is_empty() {
            path.push_str("::");
        }
        path.push_str(part);
        current = types.exception(&path, Some(&current));
    }
    current
}

// ============================================================================
// Registration Errors
// ============================================================================

/// Errors building a program.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistrationError {
    #[error("duplicate registration: {name} already registered as {kind}")]
    DuplicateRegistration { name: String, kind: &'static str },

    #[error("unknown namespace index {0}")]
    UnknownNamespace(usize),

    #[error("global slot {slot} out of range in namespace {namespace}")]
    UnknownGlobal { namespace: usize, slot: usize },

    #[error("class id {0} already in use")]
    DuplicateClass(u32),

    #[error("not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_nest() {
        let div = exception_type("Error::Float::DivByZero");
        let float = exception_type("Error::Float");
        let error = exception_type("Error");
        assert!(div.derives_from(&float));
        assert!(div.derives_from(&error));
        assert!(div.derives_from(&exception_type("Exception")));
        assert!(!float.derives_from(&div));
        assert_eq!(div.name(), "Error::Float::DivByZero");
    }

    #[test]
    fn runtime_categories() {
        let err = RuntimeError::InvalidIndex { index: 3, size: 3 };
        assert_eq!(err.category(), "Error::Index");
        assert_eq!(err.to_string(), "index out of range: 3 (size 3)");
        let err: RuntimeError = ScalarError::DivisionByZero.into();
        assert_eq!(err, RuntimeError::DivisionByZero);
    }

    #[test]
    fn kind_messages() {
        assert_eq!(InferErrorKind::NotInitialized.message(), "Variable not initialized");
        assert_eq!(InferErrorKind::TypeNotMatching.to_string(), "Types not matching");
    }
}
