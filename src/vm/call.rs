//! Calls, returns and yields.
//!
//! ## Algorithm
//!
//! 1. Resolve the callee against the run-time types of the arguments: a
//!    routine is checked alone, an overload set picks its best candidate, a
//!    virtual method is redirected to the receiver's override.
//! 2. With specialization enabled, a generic callee is replaced by its
//!    specialization for the argument types (compiled on first use).
//! 3. Arguments are placed by name or position, defaults filled and numeric
//!    arguments converted to the parameter kind.
//! 4. Host functions run immediately; coroutines become a new suspended
//!    process; script routines get a frame. A tail call replaces the caller's
//!    frame and inherits its landing.

use std::sync::Arc;

use rill_core::heap::HeapObject;
use rill_core::{
    CallFlags, ClassDef, CompiledBody, Handle, Heap, Instruction, OpCode, OverloadSet, ProcessId,
    RejectReason, Rejection, Routine, RoutineFlags, RuntimeError, Ty, TypeKind, TypeTable, Value,
};
use rill_infer::{MatchLevel, Resolved, Session, match_value, resolve_overload, resolve_routine, specialize};

use super::exec::Flow;
use super::frame::{Completion, Frame, Landing, Process, ProcessState};
use super::{Resumed, Vm};
use crate::error::{RillError, RillResult};

/// Arguments placed into parameter order.
struct Bound {
    slots: Vec<Value>,
    /// Extra arguments of a variadic routine.
    extras: Vec<Value>,
}

fn mismatch(heap: &Heap, target: &Ty, value: &Value) -> RuntimeError {
    RuntimeError::type_mismatch(target.name(), heap.type_of(value).name())
}

/// Convert `value` for a slot of type `ty`, or fail with a type mismatch.
pub(super) fn conform(heap: &Heap, value: Value, ty: &Ty) -> Result<Value, RuntimeError> {
    let target = ty.strip();
    if target.is_dynamic() {
        return Ok(value);
    }
    let kind = target.kind();
    if kind.is_numeric() && value.is_numeric() {
        if value.kind() == kind {
            return Ok(value);
        }
        return value
            .convert_numeric(kind)
            .ok_or_else(|| mismatch(heap, &target, &value));
    }
    if let (TypeKind::Enum, Value::Int(i)) = (kind, &value) {
        return Ok(Value::Enum(target.clone(), *i));
    }
    if kind == TypeKind::Routine && value.kind() == TypeKind::Routine {
        return Ok(value);
    }
    match match_value(heap, &value, &target) {
        MatchLevel::NoMatch => Err(mismatch(heap, &target, &value)),
        _ => Ok(value),
    }
}

fn describe(reason: &RejectReason) -> String {
    match reason {
        RejectReason::TooMany => "too many arguments".to_string(),
        RejectReason::TooFew => "too few arguments".to_string(),
        RejectReason::WrongType { found, expected } => format!("expected {expected}, found {found}"),
        RejectReason::WrongName(name) => format!("no parameter named '{name}'"),
    }
}

fn param_error(callee: &str, rejections: &[Rejection]) -> RuntimeError {
    if rejections.is_empty() {
        return RuntimeError::Param(format!("no candidate of {callee}() accepts the arguments"));
    }
    let reasons: Vec<String> = rejections
        .iter()
        .map(|r| format!("{}: {}", r.signature, describe(&r.reason)))
        .collect();
    RuntimeError::Param(reasons.join("; "))
}

/// The name and value of a `NamedArg` tuple.
fn named_argument(heap: &Heap, value: &Value) -> Option<(String, Value)> {
    let Value::Tuple(h) = value else { return None };
    match heap.get(*h) {
        Some(HeapObject::Tuple(t)) if t.ty.kind() == TypeKind::Named => Some((
            t.ty.label()?.to_string(),
            t.items.first().cloned().unwrap_or_default(),
        )),
        _ => None,
    }
}

impl Vm {
    pub(super) fn argument_types(&self, args: &[Value]) -> Vec<Ty> {
        args.iter().map(|v| self.heap.type_of(v)).collect()
    }

    /// Call `callee` with `args`, delivering the result to `landing`.
    pub(super) fn invoke(
        &mut self,
        process: &mut Process,
        callee: Value,
        args: Vec<Value>,
        method_call: bool,
        landing: Landing,
        tail: bool,
    ) -> RillResult<()> {
        self.check_cancelled()?;
        match callee {
            Value::Routine(routine) => {
                let types = self.argument_types(&args);
                let resolved =
                    resolve_routine(&routine, &types).map_err(|r| param_error(routine.name(), &[r]))?;
                self.enter(process, resolved, &types, args, None, landing, tail, false)
            }
            Value::Overloads(set) => {
                let types = self.argument_types(&args);
                let resolved = resolve_overload(&set, &types, method_call)
                    .map_err(|r| param_error(set.name(), &r))?;
                let resolved = self.devirtualize(resolved, &args, method_call);
                self.enter(process, resolved, &types, args, None, landing, tail, false)
            }
            Value::Closure(h) => {
                let routine = match self.heap.get(h) {
                    Some(HeapObject::Closure(c)) => c.routine.clone(),
                    _ => return Err(RuntimeError::InvalidOperation("dangling closure".into()).into()),
                };
                let types = self.argument_types(&args);
                let resolved =
                    resolve_routine(&routine, &types).map_err(|r| param_error(routine.name(), &[r]))?;
                self.enter(process, resolved, &types, args, Some(h), landing, tail, false)
            }
            Value::Class(class) => self.construct_instance(process, class, args, landing, tail),
            Value::Object(h) => {
                let receiver = Value::Object(h);
                let mut with_self = Vec::with_capacity(args.len() + 1);
                with_self.push(receiver.clone());
                with_self.extend(args);
                if self.call_method(process, &receiver, "()", with_self, landing)? {
                    Ok(())
                } else {
                    Err(RuntimeError::NotCallable(self.heap.type_of(&receiver).name().to_string()).into())
                }
            }
            Value::Process(pid) => self.resume_nested(process, pid, args, landing),
            other => Err(RuntimeError::NotCallable(self.heap.type_of(&other).name().to_string()).into()),
        }
    }

    /// Call operator method `symbol` of an object receiver.
    ///
    /// Returns `false` when the class has no such method or no candidate
    /// accepts `args`.
    pub(super) fn call_method(
        &mut self,
        process: &mut Process,
        receiver: &Value,
        symbol: &str,
        args: Vec<Value>,
        landing: Landing,
    ) -> RillResult<bool> {
        let Some(set) = self.method_of(receiver, symbol) else {
            return Ok(false);
        };
        let types = self.argument_types(&args);
        let Ok(resolved) = resolve_overload(&set, &types, true) else {
            return Ok(false);
        };
        let resolved = self.devirtualize(resolved, &args, true);
        self.enter(process, resolved, &types, args, None, landing, false, false)?;
        Ok(true)
    }

    pub(super) fn class_of(&self, value: &Value) -> Option<&Arc<ClassDef>> {
        let Value::Object(h) = value else { return None };
        match self.heap.get(*h) {
            Some(HeapObject::Instance(o)) => self.program.class(o.class),
            _ => None,
        }
    }

    fn method_of(&self, receiver: &Value, symbol: &str) -> Option<Arc<OverloadSet>> {
        self.class_of(receiver)?.method(symbol).cloned()
    }

    fn devirtualize(&self, resolved: Resolved, args: &[Value], method_call: bool) -> Resolved {
        if !method_call || !resolved.routine.flags().contains(RoutineFlags::VIRTUAL) {
            return resolved;
        }
        match args.first().and_then(|receiver| self.class_of(receiver)) {
            Some(class) => Resolved {
                routine: class.resolve_virtual(&resolved.routine),
                ..resolved
            },
            None => resolved,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enter(
        &mut self,
        process: &mut Process,
        resolved: Resolved,
        types: &[Ty],
        args: Vec<Value>,
        closure: Option<Handle>,
        landing: Landing,
        tail: bool,
        returns_receiver: bool,
    ) -> RillResult<()> {
        let routine = if self.config.specialize_calls && resolved.routine.native().is_none() {
            let program = self.program.clone();
            let mut session = Session::new(&*program);
            specialize(&mut session, &resolved, types)
        } else {
            resolved.routine.clone()
        };
        let bound = self.bind_arguments(&routine, resolved.order.as_deref(), args)?;
        self.start(process, routine, bound, closure, landing, tail, returns_receiver)
    }

    fn bind_arguments(
        &mut self,
        routine: &Routine,
        order: Option<&[Option<usize>]>,
        args: Vec<Value>,
    ) -> Result<Bound, RuntimeError> {
        let decl = routine.decl();
        let mut slots: Vec<Option<Value>> = vec![None; decl.params.len()];
        let mut extras = Vec::new();
        for (i, arg) in args.into_iter().enumerate() {
            let (name, value) = match named_argument(&self.heap, &arg) {
                Some((name, value)) => (Some(name), value),
                None => (None, arg),
            };
            let slot = match (order, &name) {
                (Some(order), _) => order.get(i).copied().flatten(),
                (None, Some(name)) => decl.params.iter().position(|p| *p.name == **name),
                (None, None) => (i < slots.len()).then_some(i),
            };
            match slot {
                Some(s) if slots[s].is_some() => {
                    return Err(RuntimeError::Param(format!(
                        "argument '{}' of {}() given twice",
                        decl.params[s].name, decl.name
                    )));
                }
                Some(s) => slots[s] = Some(value),
                None if decl.variadic => extras.push(value),
                None => {
                    return Err(RuntimeError::Param(match name {
                        Some(name) => format!("{}() has no parameter '{name}'", decl.name),
                        None => format!("too many arguments for {}()", decl.name),
                    }));
                }
            }
        }

        let mut bound = Vec::with_capacity(slots.len());
        for (param, slot) in decl.params.iter().zip(slots) {
            let value = match (slot, &param.default) {
                (Some(value), _) => value,
                (None, Some(default)) => self.heap.materialize(default),
                (None, None) => {
                    return Err(RuntimeError::Param(format!(
                        "missing argument '{}' for {}()",
                        param.name, decl.name
                    )));
                }
            };
            let value = conform(&self.heap, value, &param.ty).map_err(|err| match err {
                RuntimeError::TypeMismatch { expected, actual } => RuntimeError::Param(format!(
                    "argument '{}' of {}() expects {expected}, got {actual}",
                    param.name, decl.name
                )),
                other => other,
            })?;
            bound.push(value);
        }
        Ok(Bound { slots: bound, extras })
    }

    #[allow(clippy::too_many_arguments)]
    fn start(
        &mut self,
        process: &mut Process,
        routine: Arc<Routine>,
        bound: Bound,
        closure: Option<Handle>,
        landing: Landing,
        tail: bool,
        returns_receiver: bool,
    ) -> RillResult<()> {
        if let Some(native) = routine.native() {
            let mut args = bound.slots;
            args.extend(bound.extras);
            for arg in &args {
                self.heap.inc_ref(arg);
            }
            let outcome = native(&mut self.heap, &args);
            let result = match outcome {
                Ok(value) if returns_receiver => args.first().cloned().unwrap_or(value),
                Ok(value) => value,
                Err(err) => {
                    for arg in &args {
                        self.heap.dec_ref(arg);
                    }
                    return Err(err.into());
                }
            };
            self.heap.inc_ref(&result);
            for arg in &args {
                self.heap.dec_ref(arg);
            }
            let landed = self.land(process, landing, result.clone());
            self.heap.dec_ref(&result);
            return Ok(landed?);
        }

        let body = match routine.body() {
            Some(body) => body,
            None => self.program.compile(&routine)?,
        };

        if routine.is_coroutine() {
            let pid = self.allocate_process_id();
            let mut coroutine = Process::new(pid);
            let frame = self.new_frame(routine, body, bound, closure, Landing::Host);
            coroutine.frames.push(frame);
            coroutine.state = ProcessState::Suspended;
            self.processes.insert(pid, coroutine);
            tracing::trace!(process = pid.0, "created coroutine process");
            return Ok(self.land(process, landing, Value::Process(pid))?);
        }

        let inherit = tail
            && !returns_receiver
            && process
                .frames
                .last()
                .is_some_and(|f| f.handlers.is_empty() && !f.returns_receiver);
        if !inherit && process.frames.len() >= self.config.max_call_depth {
            return Err(RuntimeError::StackOverflow(self.config.max_call_depth).into());
        }
        let landing = if inherit { process.top()?.landing } else { landing };
        let mut frame = self.new_frame(routine, body, bound, closure, landing);
        frame.returns_receiver = returns_receiver;
        if inherit {
            if let Some(old) = process.frames.pop() {
                old.release(&mut self.heap);
            }
        }
        process.frames.push(frame);
        Ok(())
    }

    fn new_frame(
        &mut self,
        routine: Arc<Routine>,
        body: Arc<CompiledBody>,
        bound: Bound,
        closure: Option<Handle>,
        landing: Landing,
    ) -> Frame {
        let variadic = routine.decl().variadic;
        let mut frame = Frame::new(routine, body, landing);
        let count = bound.slots.len();
        for (reg, value) in bound.slots.into_iter().enumerate() {
            frame.set(&mut self.heap, reg as u16, value);
        }
        if variadic {
            let item_types = self.argument_types(&bound.extras);
            let extras = self
                .heap
                .new_tuple(TypeTable::global().tuple(item_types), bound.extras);
            frame.set(&mut self.heap, count as u16, extras);
        }
        if let Some(h) = closure {
            self.heap.inc_ref(&Value::Closure(h));
            frame.closure = Some(h);
        }
        frame
    }

    fn construct_instance(
        &mut self,
        process: &mut Process,
        class: Arc<ClassDef>,
        args: Vec<Value>,
        landing: Landing,
        tail: bool,
    ) -> RillResult<()> {
        let fields: Vec<Value> = class
            .fields
            .iter()
            .map(|f| self.heap.materialize(&f.default))
            .collect();
        let instance = self
            .heap
            .new_instance(class.id, class.object_type.clone(), fields);
        match &class.constructors {
            Some(set) => {
                let mut with_self = Vec::with_capacity(args.len() + 1);
                with_self.push(instance);
                with_self.extend(args);
                let types = self.argument_types(&with_self);
                let resolved = resolve_overload(set, &types, true)
                    .map_err(|r| param_error(&class.name, &r))?;
                self.enter(process, resolved, &types, with_self, None, landing, tail, true)
            }
            None if args.is_empty() => Ok(self.land(process, landing, instance)?),
            None => Err(RuntimeError::Param(format!("class {} has no constructor", class.name)).into()),
        }
    }

    fn resume_nested(
        &mut self,
        process: &mut Process,
        pid: ProcessId,
        args: Vec<Value>,
        landing: Landing,
    ) -> RillResult<()> {
        let mut other = self
            .take_process(pid)
            .map_err(|err| RuntimeError::Process(err.to_string()))?;
        let outcome = self.resume_process(&mut other, args);
        self.processes.insert(pid, other);
        match outcome {
            Ok(Resumed::Yielded(value) | Resumed::Finished(value)) => {
                let landed = self.land(process, landing, value.clone());
                self.heap.dec_ref(&value);
                Ok(landed?)
            }
            Err(RillError::Uncaught(report)) => Err(RuntimeError::User {
                category: report.category,
                message: report.message,
            }
            .into()),
            Err(err) => Err(err),
        }
    }

    /// Continue a suspended process; `args` answer its pending yield.
    pub(super) fn resume_process(&mut self, process: &mut Process, args: Vec<Value>) -> RillResult<Resumed> {
        if let Some(reg) = process.resume_into.take() {
            let value = self.pack(args);
            self.store(process, reg, value)?;
        }
        tracing::trace!(process = process.id.0, "resuming process");
        match self.run(process) {
            Ok(Completion::Yielded(value)) => Ok(Resumed::Yielded(value)),
            Ok(Completion::Returned(value)) => Ok(Resumed::Finished(value)),
            Err(err) => {
                process.abandon(&mut self.heap);
                process.state = ProcessState::Aborted;
                Err(err)
            }
        }
    }

    /// None, a single value, or a tuple of several.
    fn pack(&mut self, mut values: Vec<Value>) -> Value {
        match values.len() {
            0 => Value::None,
            1 => values.pop().unwrap_or_default(),
            _ => {
                let ty = TypeTable::global().tuple(self.argument_types(&values));
                self.heap.new_tuple(ty, values)
            }
        }
    }

    /// Deliver a call result.
    pub(super) fn land(&mut self, process: &mut Process, landing: Landing, value: Value) -> Result<(), RuntimeError> {
        match landing {
            Landing::Host => {
                self.heap.inc_ref(&value);
                if let Some(old) = process.result.replace(value) {
                    self.heap.dec_ref(&old);
                }
            }
            Landing::Discard => {}
            Landing::UnlessNone(_) if matches!(value, Value::None) => {}
            Landing::Register(reg) | Landing::UnlessNone(reg) => {
                let target = process.top()?.body.register_types[reg as usize].clone();
                let value = conform(&self.heap, value, &target)?;
                self.store(process, reg, value)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Instructions
    // ========================================================================

    pub(super) fn call_instr(&mut self, process: &mut Process, instr: Instruction, pc: usize) -> RillResult<()> {
        self.maybe_collect();
        let flags = instr.call_flags();
        let frame = process.top()?;
        let mut args: Vec<Value> = if flags.contains(CallFlags::CALLER_PARAMS) {
            frame.regs[..frame.routine.decl().params.len()].to_vec()
        } else {
            (1..=instr.call_argc() as u16)
                .map(|i| frame.get(instr.a + i).clone())
                .collect()
        };
        if flags.contains(CallFlags::EXPAND_TUPLE) {
            match args.pop() {
                Some(Value::Tuple(h)) => match self.heap.get(h) {
                    Some(HeapObject::Tuple(t)) => args.extend(t.items.iter().cloned()),
                    _ => return Err(RuntimeError::InvalidOperation("dangling tuple".into()).into()),
                },
                Some(other) => {
                    return Err(RuntimeError::Param(format!(
                        "cannot expand {} into arguments",
                        self.heap.type_of(&other).name()
                    ))
                    .into());
                }
                None => {}
            }
        }

        let callee = frame.get(instr.a).clone();
        let landing = Landing::Register(instr.c);
        let tail = flags.contains(CallFlags::TAIL);
        let typed = matches!(instr.op, OpCode::CallTyped | OpCode::MCallTyped)
            .then(|| frame.body.static_callees.get(&pc).cloned())
            .flatten();
        match typed {
            Some(routine) => {
                self.check_cancelled()?;
                let closure = match callee {
                    Value::Closure(h) => Some(h),
                    _ => None,
                };
                let bound = self.bind_arguments(&routine, None, args)?;
                self.start(process, routine, bound, closure, landing, tail, false)
            }
            None => {
                let method_call = instr.op == OpCode::MCall || flags.contains(CallFlags::METHOD);
                self.invoke(process, callee, args, method_call, landing, tail)
            }
        }
    }

    fn results(&mut self, process: &Process, instr: Instruction) -> Result<Value, RuntimeError> {
        let frame = process.top()?;
        if frame.returns_receiver {
            return Ok(frame.regs.first().cloned().unwrap_or_default());
        }
        let values: Vec<Value> = (instr.a..instr.a + instr.b).map(|r| frame.get(r).clone()).collect();
        Ok(self.pack(values))
    }

    pub(super) fn return_instr(&mut self, process: &mut Process, instr: Instruction) -> RillResult<Flow> {
        self.check_cancelled()?;
        let value = self.results(process, instr)?;
        self.heap.inc_ref(&value);
        let Some(frame) = process.frames.pop() else {
            self.heap.dec_ref(&value);
            return Err(RuntimeError::Process("no active frame".into()).into());
        };
        let landing = frame.landing;
        frame.release(&mut self.heap);

        if !process.pending.is_empty() {
            self.heap.dec_ref(&value);
            self.unwind(process)?;
            return Ok(Flow::Next);
        }
        let landed = self.land(process, landing, value.clone());
        self.heap.dec_ref(&value);
        landed?;
        Ok(Flow::Next)
    }

    pub(super) fn yield_instr(&mut self, process: &mut Process, instr: Instruction) -> RillResult<Flow> {
        if !process.top()?.routine.is_coroutine() {
            return Err(RuntimeError::InvalidOperation("yield outside a coroutine".into()).into());
        }
        let value = self.results(process, instr)?;
        self.heap.inc_ref(&value);
        process.resume_into = Some(instr.c);
        process.state = ProcessState::Suspended;
        tracing::trace!(process = process.id.0, "process yielded");
        Ok(Flow::Done(Completion::Yielded(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use rill_core::bytecode::data_kind;
    use rill_core::{Constant, EngineProperty, RoutineBuilder};

    fn sum_to() -> Arc<Routine> {
        // sum(n, acc) = n == 0 ? acc : sum(n - 1, acc + n)
        let t = TypeTable::global();
        RoutineBuilder::new("sum")
            .param("n", t.int())
            .param("acc", t.int())
            .returns(t.int())
            .emit(OpCode::Data, data_kind::INT, 0, 2)
            .emit(OpCode::Eq, 0, 2, 3)
            .emit(OpCode::Test, 3, 4, 0)
            .emit(OpCode::Return, 1, 1, 0)
            .emit(OpCode::GetGlobal, 0, 0, 4)
            .emit(OpCode::Data, data_kind::INT, 1, 7)
            .emit(OpCode::Sub, 0, 7, 5)
            .emit(OpCode::Add, 1, 0, 6)
            .emit(OpCode::Call, 4, 2, 8)
            .emit(OpCode::Return, 8, 1, 0)
            .build()
    }

    fn recursive_program(depth: usize) -> Vm {
        let mut program = Program::new();
        program.set_property(EngineProperty::MaxCallDepth, depth);
        let set = program.add_routine(sum_to()).unwrap();
        program.define_constant(0, "sum", Constant::Overloads(set)).unwrap();
        Vm::new(Arc::new(program))
    }

    #[test]
    fn tail_calls_do_not_grow_the_stack() {
        let mut vm = recursive_program(16);
        let result = vm.call("sum", vec![Value::Int(1000), Value::Int(0)]).unwrap();
        assert!(matches!(result, Value::Int(500500)));
    }

    #[test]
    fn missing_arguments_are_parameter_errors() {
        let mut vm = recursive_program(16);
        let err = vm.call("sum", vec![Value::Int(1)]).unwrap_err();
        assert!(matches!(err, RillError::Runtime(RuntimeError::Param(_))), "{err}");
    }

    #[test]
    fn conform_converts_numbers_and_checks_the_rest() {
        let t = TypeTable::global();
        let heap = Heap::new();
        assert!(matches!(conform(&heap, Value::Int(3), &t.double()), Ok(Value::Double(d)) if d == 3.0));
        assert!(matches!(conform(&heap, Value::string("x"), &t.any()), Ok(Value::String(_))));
        assert!(matches!(
            conform(&heap, Value::string("x"), &t.int()),
            Err(RuntimeError::TypeMismatch { .. })
        ));
    }
}
