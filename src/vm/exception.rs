//! Raising, unwinding and rescuing exceptions.
//!
//! A raised exception is pushed onto the process's pending list and control
//! moves to the handler of the innermost open `Try` region, popping frames
//! that have none. Frames returning while exceptions are still pending keep
//! unwinding. An exception that leaves the last frame aborts the process and
//! reaches the host as [`RillError::Uncaught`].

use std::sync::Arc;

use rill_core::bytecode::RESCUE_ANY;
use rill_core::heap::{ExceptionObject, HeapObject, TraceEntry};
use rill_core::{Constant, Instruction, RuntimeError, Value, exception_type};

use super::Vm;
use super::frame::{Process, ProcessState};
use crate::error::{ExceptionReport, RillError, RillResult};

impl Vm {
    /// Raise a run-time error as a script exception.
    pub(super) fn raise_error(&mut self, process: &mut Process, err: RuntimeError) -> RillResult<()> {
        let message = match &err {
            RuntimeError::User { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let category = err.category().to_string();
        self.raise(process, &category, message, Value::None)
    }

    pub(super) fn raise(
        &mut self,
        process: &mut Process,
        category: &str,
        message: String,
        data: Value,
    ) -> RillResult<()> {
        let (routine, line) = match process.frames.last() {
            Some(frame) => (Arc::from(frame.routine.name()), frame.line()),
            None => (Arc::from("<host>"), 0),
        };
        let trace = process
            .frames
            .iter()
            .rev()
            .skip(1)
            .take(ExceptionObject::MAX_TRACE)
            .map(|frame| TraceEntry {
                routine: Arc::from(frame.routine.name()),
                line: frame.line(),
            })
            .collect();
        tracing::debug!(category, %message, routine = %routine, line, "exception raised");
        let exception = self.heap.new_exception(ExceptionObject {
            ty: exception_type(category),
            message,
            routine,
            line,
            trace,
            data,
        });
        self.heap.inc_ref(&exception);
        process.pending.push(exception);
        self.unwind(process)
    }

    /// Transfer control to the nearest handler, or abort the process.
    pub(super) fn unwind(&mut self, process: &mut Process) -> RillResult<()> {
        while let Some(frame) = process.frames.last_mut() {
            if let Some(handler) = frame.handlers.pop() {
                frame.pc = handler;
                return Ok(());
            }
            if let Some(frame) = process.frames.pop() {
                frame.release(&mut self.heap);
            }
        }
        let report = self.report(process);
        tracing::warn!(
            category = %report.category,
            message = %report.message,
            routine = %report.routine,
            line = report.line,
            "uncaught exception"
        );
        process.abandon(&mut self.heap);
        process.state = ProcessState::Aborted;
        Err(RillError::Uncaught(Box::new(report)))
    }

    fn report(&self, process: &Process) -> ExceptionReport {
        let latest = process
            .pending
            .last()
            .and_then(Value::handle)
            .and_then(|h| self.heap.get(h));
        match latest {
            Some(HeapObject::Exception(e)) => ExceptionReport {
                category: e.category().to_string(),
                message: e.message.clone(),
                routine: e.routine.clone(),
                line: e.line,
                trace: e.trace.clone(),
            },
            _ => ExceptionReport {
                category: "Exception".to_string(),
                message: String::new(),
                routine: Arc::from("<host>"),
                line: 0,
                trace: Vec::new(),
            },
        }
    }

    pub(super) fn raise_instr(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let frame = process.top()?;
        match instr.b {
            0 => {
                if process.pending.is_empty() {
                    return Err(RuntimeError::InvalidOperation("nothing to re-raise".into()).into());
                }
                self.unwind(process)
            }
            1 => match frame.get(instr.a).clone() {
                exception @ Value::Exception(_) => {
                    self.heap.inc_ref(&exception);
                    process.pending.push(exception);
                    self.unwind(process)
                }
                Value::String(message) => self.raise(process, "Error", message.to_string(), Value::None),
                other => {
                    let message = self.heap.display(&other);
                    self.raise(process, "Error", message, Value::None)
                }
            },
            n => {
                let category = frame.get(instr.a);
                let Some(category) = category.as_str().map(str::to_string) else {
                    return Err(RuntimeError::type_mismatch("string", self.heap.type_of(category).name()).into());
                };
                let message = self.heap.display(frame.get(instr.a + 1));
                let data = if n >= 3 {
                    frame.get(instr.a + 2).clone()
                } else {
                    Value::None
                };
                self.raise(process, &category, message, data)
            }
        }
    }

    pub(super) fn rescue(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let Some(pending) = process.pending.last().cloned() else {
            process.top_mut()?.pc = instr.c as usize;
            return Ok(());
        };
        let raised = match pending.handle().and_then(|h| self.heap.get(h)) {
            Some(HeapObject::Exception(e)) => e.ty.clone(),
            _ => exception_type("Exception"),
        };
        let wanted = if instr.b == RESCUE_ANY {
            None
        } else {
            match self.constant(process, instr.b)? {
                Constant::Type(ty) => Some(ty),
                Constant::String(category) => Some(exception_type(&category)),
                _ => {
                    return Err(RuntimeError::InvalidOperation("rescue without an exception type".into()).into());
                }
            }
        };
        let matched = wanted.is_none_or(|ty| raised.hash() == ty.hash() || raised.derives_from(&ty));
        if matched {
            process.pending.pop();
            self.store(process, instr.a, pending.clone())?;
            self.heap.dec_ref(&pending);
        } else {
            process.top_mut()?.pc = instr.c as usize;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use rill_core::bytecode::data_kind;
    use rill_core::{OpCode, OverloadSet, RoutineBuilder};

    fn raising(name: &str, category: &str) -> Arc<rill_core::Routine> {
        RoutineBuilder::new(name)
            .constant(Constant::string(category))
            .constant(Constant::string("bad value"))
            .line(7)
            .emit(OpCode::GetConst, 0, 0, 0)
            .emit(OpCode::GetConst, 0, 1, 1)
            .emit(OpCode::Raise, 0, 2, 0)
            .build()
    }

    /// `try { f() } rescue (catch) { return 1 } return 0`
    fn guarded(f: &Arc<rill_core::Routine>, catch: &str) -> Arc<rill_core::Routine> {
        RoutineBuilder::new("guarded")
            .constant(Constant::Overloads(Arc::new(OverloadSet::new("f", vec![f.clone()]))))
            .constant(Constant::string(catch))
            .line(2)
            .emit(OpCode::Try, 0, 4, 0)
            .emit(OpCode::GetConst, 0, 0, 0)
            .line(3)
            .emit(OpCode::Call, 0, 0, 1)
            .emit(OpCode::EndTry, 0, 0, 0)
            .line(5)
            .emit(OpCode::Rescue, 2, 1, 7)
            .emit(OpCode::Data, data_kind::INT, 1, 3)
            .emit(OpCode::Return, 3, 1, 0)
            .emit(OpCode::Data, data_kind::INT, 0, 3)
            .emit(OpCode::Return, 3, 1, 0)
            .build()
    }

    fn run_guarded(category: &str, catch: &str) -> RillResult<Value> {
        let f = raising("f", category);
        let mut program = Program::new();
        program.add_routine(guarded(&f, catch)).unwrap();
        let mut vm = Vm::new(Arc::new(program));
        let result = vm.call("guarded", vec![]);
        assert_eq!(vm.heap().live_count(), 0);
        result
    }

    #[test]
    fn rescue_matches_ancestor_categories() {
        assert!(matches!(run_guarded("Error::Value", "Error"), Ok(Value::Int(1))));
        assert!(matches!(run_guarded("Error::Value", "Exception"), Ok(Value::Int(1))));
        assert!(matches!(run_guarded("Error::Value", "Error::Value"), Ok(Value::Int(1))));
    }

    #[test]
    fn unmatched_exceptions_keep_unwinding() {
        let err = run_guarded("Error::Value", "Error::Index").unwrap_err();
        let report = err.exception().expect("uncaught exception");
        assert_eq!(report.category, "Error::Value");
        assert_eq!(report.message, "bad value");
        assert_eq!(&*report.routine, "f");
        assert_eq!(report.line, 7);
        assert_eq!(report.trace.len(), 1);
        assert_eq!(&*report.trace[0].routine, "guarded");
        assert_eq!(report.trace[0].line, 3);
    }

    #[test]
    fn re_raise_without_pending_exception_is_an_operation_error() {
        let f = RoutineBuilder::new("f").emit(OpCode::Raise, 0, 0, 0).build();
        let mut program = Program::new();
        program.add_routine(f).unwrap();
        let mut vm = Vm::new(Arc::new(program));
        let err = vm.call("f", vec![]).unwrap_err();
        assert_eq!(err.exception().map(|r| r.category.as_str()), Some("Error::Operation"));
    }
}
