//! Call frames and processes.

use std::sync::Arc;

use rill_core::ops::FloatFlags;
use rill_core::{CompiledBody, Handle, Heap, ProcessId, Routine, RuntimeError, Value};

/// Where the result of a finished call goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Landing {
    /// Back to the host (or to whoever resumed the process).
    Host,
    Discard,
    Register(u16),
    /// A compound operator method; a `none` result leaves the register alone.
    UnlessNone(u16),
}

/// Activation record of one script routine.
pub(crate) struct Frame {
    pub routine: Arc<Routine>,
    pub body: Arc<CompiledBody>,
    pub regs: Vec<Value>,
    /// Index of the next instruction.
    pub pc: usize,
    pub landing: Landing,
    /// Closure whose captures `GetCapture`/`SetCapture` address; holds a count.
    pub closure: Option<Handle>,
    /// Handler entry points of the enclosing `Try` regions, innermost last.
    pub handlers: Vec<usize>,
    /// A constructor: the receiver in register 0 is the result.
    pub returns_receiver: bool,
}

impl Frame {
    pub fn new(routine: Arc<Routine>, body: Arc<CompiledBody>, landing: Landing) -> Self {
        let regs = vec![Value::None; body.register_count()];
        Frame {
            routine,
            body,
            regs,
            pc: 0,
            landing,
            closure: None,
            handlers: Vec::new(),
            returns_receiver: false,
        }
    }

    #[inline]
    pub fn get(&self, reg: u16) -> &Value {
        &self.regs[reg as usize]
    }

    #[inline]
    pub fn set(&mut self, heap: &mut Heap, reg: u16, value: Value) {
        heap.shift_ref(value, &mut self.regs[reg as usize]);
    }

    /// Source line of the instruction being executed.
    pub fn line(&self) -> u32 {
        self.body
            .code
            .get(self.pc.saturating_sub(1))
            .map_or(self.routine.decl().def_line, |ai| ai.line())
    }

    /// Give back every count the frame holds.
    pub fn release(self, heap: &mut Heap) {
        for (reg, value) in self.regs.iter().enumerate() {
            if !self.body.scalar_registers.contains(reg) {
                heap.dec_ref(value);
            }
        }
        if let Some(closure) = self.closure {
            heap.dec_ref(&Value::Closure(closure));
        }
    }
}

/// Lifecycle of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Stopped at a yield, waiting to be resumed.
    Suspended,
    Finished,
    /// Ended by an uncaught exception or an engine error.
    Aborted,
}

/// How a run of a process ended.
#[derive(Debug)]
pub(crate) enum Completion {
    Returned(Value),
    Yielded(Value),
}

/// An interpreter instance with its own call stack.
pub(crate) struct Process {
    pub id: ProcessId,
    pub frames: Vec<Frame>,
    pub state: ProcessState,
    /// Raised exceptions not yet rescued, each holding a count.
    pub pending: Vec<Value>,
    /// Register of the suspended frame receiving resumption arguments.
    pub resume_into: Option<u16>,
    /// Result delivered to a `Host` landing, holding a count.
    pub result: Option<Value>,
    /// Float conditions raised by the current run of arithmetic instructions.
    pub float_flags: FloatFlags,
}

impl Process {
    pub fn new(id: ProcessId) -> Self {
        Process {
            id,
            frames: Vec::new(),
            state: ProcessState::Running,
            pending: Vec::new(),
            resume_into: None,
            result: None,
            float_flags: FloatFlags::empty(),
        }
    }

    #[inline]
    pub fn top(&self) -> Result<&Frame, RuntimeError> {
        self.frames
            .last()
            .ok_or_else(|| RuntimeError::Process("no active frame".into()))
    }

    #[inline]
    pub fn top_mut(&mut self) -> Result<&mut Frame, RuntimeError> {
        self.frames
            .last_mut()
            .ok_or_else(|| RuntimeError::Process("no active frame".into()))
    }

    /// Tear down every frame and drop pending exceptions.
    pub fn abandon(&mut self, heap: &mut Heap) {
        while let Some(frame) = self.frames.pop() {
            frame.release(heap);
        }
        for exception in self.pending.drain(..) {
            heap.dec_ref(&exception);
        }
        if let Some(result) = self.result.take() {
            heap.dec_ref(&result);
        }
        self.resume_into = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{OpCode, RoutineBuilder, TypeTable};
    use rill_infer::{StaticEnv, infer_routine};

    #[test]
    fn release_gives_back_register_counts() {
        let t = TypeTable::global();
        let f = RoutineBuilder::new("f")
            .param("xs", t.list(t.int()))
            .emit(OpCode::Return, 0, 1, 0)
            .build();
        let body = infer_routine(&f, &StaticEnv::new()).unwrap();

        let mut heap = Heap::new();
        let list = heap.new_list(t.list(t.int()), vec![Value::Int(1)]);
        let mut frame = Frame::new(f, body, Landing::Host);
        frame.set(&mut heap, 0, list.clone());
        assert_eq!(heap.ref_count(list.handle().unwrap()), Some(1));
        frame.release(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }
}
