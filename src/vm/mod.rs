//! The execution engine.
//!
//! A [`Vm`] runs the routines of a shared [`Program`] against its own heap,
//! global slots and processes. Every call from the host runs in a fresh
//! process; calling a coroutine instead creates a suspended process that the
//! host (or script code) resumes.
//!
//! ## Algorithm
//!
//! One fetch-decode-dispatch loop per process. Each instruction handler
//! returns a [`Flow`](exec::Flow) or an error. Runtime errors become script
//! exceptions that unwind to the nearest frame with an open `Try` region;
//! errors of any other kind (failed on-demand compilation, cancellation)
//! end the run and reach the host unchanged.
//!
//! ## Ownership
//!
//! Registers, globals, pending exceptions and host results each own one
//! strong count of the heap value they hold. A returned value is pinned
//! while its frame is torn down and handed to the caller's destination
//! register; a value returned to the host carries a count the host gives
//! back with [`Vm::release`].

mod access;
mod arith;
mod call;
mod exception;
mod exec;
mod frame;

pub use frame::ProcessState;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rill_core::{EngineProperties, EngineProperty, Heap, ProcessId, RuntimeError, Value};
use rustc_hash::FxHashMap;

use crate::error::{RillError, RillResult};
use crate::program::Program;
use frame::{Completion, Landing, Process};

/// Execution limits derived from [`EngineProperties`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub trap_float: bool,
    /// Allocations between automatic cycle collections; 0 disables them.
    pub gc_threshold: usize,
    /// Specialize generic callees for the argument types seen at run time.
    pub specialize_calls: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig::from(&EngineProperties::new())
    }
}

impl From<&EngineProperties> for VmConfig {
    fn from(props: &EngineProperties) -> Self {
        VmConfig {
            max_call_depth: props.get(EngineProperty::MaxCallDepth),
            trap_float: props.flag(EngineProperty::TrapFloatExceptions),
            gc_threshold: props.get(EngineProperty::GcThreshold),
            specialize_calls: props.flag(EngineProperty::TypedCode),
        }
    }
}

/// Outcome of resuming a process.
#[derive(Debug)]
pub enum Resumed {
    Yielded(Value),
    Finished(Value),
}

impl Resumed {
    pub fn value(&self) -> &Value {
        match self {
            Resumed::Yielded(v) | Resumed::Finished(v) => v,
        }
    }
}

/// Cycle collection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStatistics {
    pub collections: usize,
    pub total_freed: usize,
}

pub struct Vm {
    program: Arc<Program>,
    config: VmConfig,
    heap: Heap,
    /// Global slots by namespace.
    globals: Vec<Vec<Value>>,
    processes: FxHashMap<ProcessId, Process>,
    next_process: u32,
    cancel: Arc<AtomicBool>,
    gc_stats: GcStatistics,
}

impl Vm {
    /// Create an engine for `program`, initializing every global slot.
    pub fn new(program: Arc<Program>) -> Self {
        let config = VmConfig::from(program.properties());
        let mut heap = Heap::new();
        let globals = program
            .namespaces()
            .iter()
            .map(|ns| {
                ns.globals()
                    .iter()
                    .map(|def| {
                        let value = heap.materialize(&def.initial);
                        heap.inc_ref(&value);
                        value
                    })
                    .collect()
            })
            .collect();
        Vm {
            program,
            config,
            heap,
            globals,
            processes: FxHashMap::default(),
            next_process: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            gc_stats: GcStatistics::default(),
        }
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call the routine (overload set) registered under `name`.
    ///
    /// Calling a coroutine returns a [`Value::Process`] to resume.
    pub fn call(&mut self, name: &str, args: Vec<Value>) -> RillResult<Value> {
        let set = self
            .program
            .routines(name)
            .cloned()
            .ok_or_else(|| RillError::UnknownRoutine(name.to_string()))?;
        self.call_value(Value::Overloads(set), args)
    }

    /// Call any callable value: a routine, an overload set, a class, a closure.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call_value(&mut self, callee: Value, args: Vec<Value>) -> RillResult<Value> {
        let mut process = Process::new(self.allocate_process_id());
        tracing::trace!(process = process.id.0, callee = ?callee, "host call");
        let outcome = self
            .invoke(&mut process, callee, args, false, Landing::Host, false)
            .and_then(|_| self.run(&mut process));
        match outcome {
            Ok(Completion::Returned(value)) | Ok(Completion::Yielded(value)) => Ok(value),
            Err(err) => {
                process.abandon(&mut self.heap);
                Err(err)
            }
        }
    }

    /// Resume a suspended process, passing `args` to its pending yield.
    pub fn resume(&mut self, pid: ProcessId, args: Vec<Value>) -> RillResult<Resumed> {
        let mut process = self.take_process(pid)?;
        let outcome = self.resume_process(&mut process, args);
        self.processes.insert(pid, process);
        outcome
    }

    pub fn process_state(&self, pid: ProcessId) -> Option<ProcessState> {
        self.processes.get(&pid).map(|p| p.state)
    }

    /// Forget a process, tearing down its frames.
    pub fn remove_process(&mut self, pid: ProcessId) -> bool {
        match self.processes.remove(&pid) {
            Some(mut process) => {
                process.abandon(&mut self.heap);
                true
            }
            None => false,
        }
    }

    fn allocate_process_id(&mut self) -> ProcessId {
        let id = ProcessId(self.next_process);
        self.next_process = self.next_process.wrapping_add(1);
        id
    }

    fn take_process(&mut self, pid: ProcessId) -> RillResult<Process> {
        let process = self.processes.remove(&pid).ok_or(RillError::Resume(
            pid,
            if pid.0 < self.next_process { "process is running" } else { "no such process" },
        ))?;
        let reason = match process.state {
            ProcessState::Suspended => None,
            ProcessState::Finished => Some("process has finished"),
            ProcessState::Aborted => Some("process was aborted"),
            ProcessState::Running => Some("process is running"),
        };
        match reason {
            None => Ok(process),
            Some(reason) => {
                self.processes.insert(pid, process);
                Err(RillError::Resume(pid, reason))
            }
        }
    }

    // ========================================================================
    // Globals
    // ========================================================================

    pub fn global(&self, namespace: usize, slot: usize) -> Option<&Value> {
        self.globals.get(namespace)?.get(slot)
    }

    pub fn set_global(&mut self, namespace: usize, slot: usize, value: Value) -> RillResult<()> {
        self.store_global(namespace, slot, value)?;
        Ok(())
    }

    fn store_global(&mut self, namespace: usize, slot: usize, value: Value) -> Result<(), RuntimeError> {
        let def = self
            .program
            .global_def(namespace, slot)
            .ok_or_else(|| RuntimeError::InvalidOperation(format!("no global {namespace}:{slot}")))?;
        if def.constant {
            return Err(RuntimeError::ConstModification);
        }
        let value = call::conform(&self.heap, value, &def.ty)?;
        let slot = self
            .globals
            .get_mut(namespace)
            .and_then(|ns| ns.get_mut(slot))
            .ok_or_else(|| RuntimeError::InvalidOperation(format!("no global {namespace}:{slot}")))?;
        self.heap.shift_ref(value, slot);
        Ok(())
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Give back the count a host-held result carries.
    pub fn release(&mut self, value: &Value) {
        self.heap.dec_ref(value);
    }

    /// Run the cycle collector now; returns the number of objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        let freed = self.heap.collect_cycles();
        self.gc_stats.collections += 1;
        self.gc_stats.total_freed += freed;
        freed
    }

    pub fn gc_statistics(&self) -> GcStatistics {
        self.gc_stats
    }

    fn maybe_collect(&mut self) {
        let threshold = self.config.gc_threshold;
        if threshold > 0 && self.heap.allocations_since_collect() >= threshold {
            self.collect_garbage();
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Flag that stops the running call at its next call or return.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn check_cancelled(&self) -> RillResult<()> {
        if self.cancel.swap(false, Ordering::AcqRel) {
            tracing::debug!("execution cancelled");
            return Err(RillError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::bytecode::data_kind;
    use rill_core::{Constant, OpCode, RoutineBuilder, TypeTable};

    fn program_with(routines: Vec<Arc<rill_core::Routine>>) -> Arc<Program> {
        let mut program = Program::new();
        for r in routines {
            program.add_routine(r).unwrap();
        }
        Arc::new(program)
    }

    #[test]
    fn config_follows_properties() {
        let mut props = EngineProperties::new();
        props.set(EngineProperty::MaxCallDepth, 8);
        props.set(EngineProperty::TrapFloatExceptions, 0);
        let config = VmConfig::from(&props);
        assert_eq!(config.max_call_depth, 8);
        assert!(!config.trap_float);
        assert!(config.specialize_calls);
    }

    #[test]
    fn unknown_routine_is_reported() {
        let mut vm = Vm::new(Arc::new(Program::new()));
        assert!(matches!(
            vm.call("missing", vec![]),
            Err(RillError::UnknownRoutine(name)) if name == "missing"
        ));
    }

    #[test]
    fn globals_start_at_their_initial_values() {
        let t = TypeTable::global();
        let mut program = Program::new();
        let slot = program.define_global(0, "count", t.int(), Constant::Int(7)).unwrap();
        let pi = program.define_constant(0, "PI", Constant::Double(3.5)).unwrap();
        let mut vm = Vm::new(Arc::new(program));
        assert!(matches!(vm.global(0, slot), Some(Value::Int(7))));

        vm.set_global(0, slot, Value::Double(9.9)).unwrap();
        assert!(matches!(vm.global(0, slot), Some(Value::Int(9))));
        assert!(matches!(
            vm.set_global(0, pi, Value::Double(1.0)),
            Err(RillError::Runtime(RuntimeError::ConstModification))
        ));
    }

    #[test]
    fn cancellation_stops_the_next_call() {
        let one = RoutineBuilder::new("one")
            .emit(OpCode::Data, data_kind::INT, 1, 0)
            .emit(OpCode::Return, 0, 1, 0)
            .build();
        let mut vm = Vm::new(program_with(vec![one]));
        vm.cancel_handle().store(true, Ordering::Release);
        assert!(matches!(vm.call("one", vec![]), Err(RillError::Cancelled)));
        assert!(matches!(vm.call("one", vec![]), Ok(Value::Int(1))));
    }

    #[test]
    fn resuming_unknown_process_fails() {
        let mut vm = Vm::new(Arc::new(Program::new()));
        assert!(matches!(
            vm.resume(ProcessId(42), vec![]),
            Err(RillError::Resume(ProcessId(42), "no such process"))
        ));
    }
}
