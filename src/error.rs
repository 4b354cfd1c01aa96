use std::fmt;
use std::sync::Arc;

use rill_core::heap::TraceEntry;
use rill_core::{Diagnostics, InferError, ProcessId, RegistrationError, RuntimeError};
use thiserror::Error;

/// An exception nobody rescued, copied out of the heap for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionReport {
    pub category: String,
    pub message: String,
    pub routine: Arc<str>,
    pub line: u32,
    /// Innermost call first.
    pub trace: Vec<TraceEntry>,
}

impl fmt::Display for ExceptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (in {}() at line {})", self.category, self.message, self.routine, self.line)?;
        for entry in &self.trace {
            write!(f, "\n  called from {}() at line {}", entry.routine, entry.line)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone)]
pub enum RillError {
    #[error(transparent)]
    Infer(#[from] InferError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("{} routine(s) failed to compile\n{}", .0.len(), .0.render())]
    Compile(Diagnostics),

    #[error("uncaught exception {0}")]
    Uncaught(Box<ExceptionReport>),

    #[error("no routine named '{0}'")]
    UnknownRoutine(String),

    #[error("process {id} cannot be resumed: {1}", id = .0.0)]
    Resume(ProcessId, &'static str),

    #[error("execution cancelled")]
    Cancelled,
}

impl RillError {
    /// The uncaught exception, when execution ended with one.
    pub fn exception(&self) -> Option<&ExceptionReport> {
        match self {
            RillError::Uncaught(report) => Some(report),
            _ => None,
        }
    }
}

pub type RillResult<T> = Result<T, RillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lists_the_call_chain() {
        let report = ExceptionReport {
            category: "Error::Index".into(),
            message: "index out of range: 3 (size 3)".into(),
            routine: Arc::from("at"),
            line: 4,
            trace: vec![TraceEntry {
                routine: Arc::from("main"),
                line: 9,
            }],
        };
        let text = RillError::Uncaught(Box::new(report)).to_string();
        assert!(text.starts_with("uncaught exception Error::Index: index out of range"));
        assert!(text.ends_with("called from main() at line 9"));
    }

    #[test]
    fn resume_error_names_the_process() {
        let err = RillError::Resume(ProcessId(7), "already finished");
        assert_eq!(err.to_string(), "process 7 cannot be resumed: already finished");
    }
}
