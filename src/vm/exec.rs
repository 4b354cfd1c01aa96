//! The dispatch loop.
//!
//! ## Algorithm
//!
//! Fetch the instruction at the top frame's program counter, advance the
//! counter, dispatch. Handlers that jump overwrite the counter. Before any
//! non-arithmetic instruction the float conditions collected by the
//! preceding arithmetic run are polled, so a trapped condition is reported
//! against the arithmetic instruction that produced it.

use std::cmp::Ordering;

use rill_core::bytecode::data_kind;
use rill_core::heap::HeapObject;
use rill_core::ops::FloatFlags;
use rill_core::{CaseMode, Constant, Instruction, OpCode, RuntimeError, TypeKind, TypeTable, Value};
use rill_infer::{MatchLevel, match_value};

use super::Vm;
use super::frame::{Completion, Process, ProcessState};
use crate::error::{RillError, RillResult};

/// What the loop does after an instruction.
pub(super) enum Flow {
    Next,
    Done(Completion),
}

impl Vm {
    /// Run `process` until its last frame returns or it yields.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(super) fn run(&mut self, process: &mut Process) -> RillResult<Completion> {
        process.state = ProcessState::Running;
        loop {
            let Some(frame) = process.frames.last() else {
                process.state = ProcessState::Finished;
                return Ok(Completion::Returned(process.result.take().unwrap_or_default()));
            };
            let pc = frame.pc;
            let fetched = frame.body.code.get(pc).map(|ai| ai.instr);
            let Some(instr) = fetched else {
                let err = RuntimeError::Process(format!("{}() ran past its last instruction", frame.routine.name()));
                self.raise_error(process, err)?;
                continue;
            };

            if !process.float_flags.is_empty() && !instr.op.is_arithmetic() {
                let flags = std::mem::replace(&mut process.float_flags, FloatFlags::empty());
                if self.config.trap_float {
                    let err = if flags.contains(FloatFlags::DIV_BY_ZERO) {
                        RuntimeError::DivisionByZero
                    } else {
                        RuntimeError::Float(flags.describe())
                    };
                    self.raise_error(process, err)?;
                    continue;
                }
            }

            process.top_mut()?.pc = pc + 1;
            match self.step(process, instr, pc) {
                Ok(Flow::Next) => {}
                Ok(Flow::Done(completion)) => return Ok(completion),
                Err(RillError::Runtime(err)) => self.raise_error(process, err)?,
                Err(err) => return Err(err),
            }
        }
    }

    fn step(&mut self, process: &mut Process, instr: Instruction, pc: usize) -> RillResult<Flow> {
        use OpCode::*;
        match instr.op {
            Nop | Case => {}

            Data | DataI | DataF | DataD => {
                let raw = instr.b as i16;
                let value = match instr.a {
                    data_kind::INT => Value::Int(raw as i64),
                    data_kind::FLOAT => Value::Float(raw as f32),
                    data_kind::DOUBLE => Value::Double(raw as f64),
                    _ => Value::None,
                };
                self.store(process, instr.c, value)?;
            }
            GetConst | GetConstI | GetConstF | GetConstD => {
                let constant = self.constant(process, instr.b)?;
                let value = self.heap.materialize(&constant);
                self.store(process, instr.c, value)?;
            }
            GetGlobal | GetGlobalI | GetGlobalF | GetGlobalD => {
                let value = self
                    .global(instr.a as usize, instr.b as usize)
                    .cloned()
                    .ok_or_else(|| RuntimeError::InvalidOperation(format!("no global {}:{}", instr.a, instr.b)))?;
                self.store(process, instr.c, value)?;
            }
            SetGlobal | SetGlobalI | SetGlobalF | SetGlobalD => {
                let value = process.top()?.get(instr.a).clone();
                self.store_global(instr.c as usize, instr.b as usize, value)?;
            }
            GetCapture => {
                let value = self.capture(process, instr.b)?;
                self.store(process, instr.c, value)?;
            }
            SetCapture => self.set_capture(process, instr)?,

            GetItem | GetItemLI | GetItemLII | GetItemLFI | GetItemLDI | GetItemLSI | GetItemSI
            | GetItemAII | GetItemAFI | GetItemADI | GetItemM | GetItemTI => {
                self.get_item(process, instr)?
            }
            SetItem | SetItemLI | SetItemLIII | SetItemLFIF | SetItemLDID | SetItemLSIS
            | SetItemSII | SetItemAIII | SetItemAFIF | SetItemADID | SetItemM => {
                self.set_item(process, instr)?
            }
            GetField => self.get_field(process, instr)?,
            SetField => self.set_field(process, instr)?,
            GetFieldT | GetFieldTI | GetFieldTF | GetFieldTD | GetFieldTS => {
                self.get_tuple_position(process, instr)?
            }
            SetFieldT | SetFieldTII | SetFieldTFF | SetFieldTDD | SetFieldTSS => {
                self.set_tuple_position(process, instr)?
            }
            GetFieldOV => self.get_object_slot(process, instr)?,
            SetFieldOV => self.set_object_slot(process, instr)?,

            Move | MoveSS | MovePP => {
                let value = process.top()?.get(instr.a).clone();
                self.store(process, instr.c, value)?;
            }
            MoveII | MoveIF | MoveID | MoveFI | MoveFF | MoveFD | MoveDI | MoveDF | MoveDD => {
                let kind = match instr.op {
                    MoveII | MoveIF | MoveID => TypeKind::Int,
                    MoveFI | MoveFF | MoveFD => TypeKind::Float,
                    _ => TypeKind::Double,
                };
                let source = process.top()?.get(instr.a).clone();
                let value = source.convert_numeric(kind).ok_or_else(|| {
                    RuntimeError::type_mismatch(TypeTable::global().numeric(kind).name(), self.heap.type_of(&source).name())
                })?;
                self.store(process, instr.c, value)?;
            }
            Cast => {
                let frame = process.top()?;
                let target = frame.body.register_types[instr.c as usize].clone();
                let value = super::call::conform(&self.heap, frame.get(instr.a).clone(), &target)?;
                self.store(process, instr.c, value)?;
            }
            Check => {
                let frame = process.top()?;
                let Some(Constant::Type(ty)) = frame.body.constants.get(instr.b) else {
                    return Err(RuntimeError::InvalidOperation("type check without a type operand".into()).into());
                };
                let level = match_value(&self.heap, frame.get(instr.a), ty);
                let matched = level >= MatchLevel::Subtype;
                self.store(process, instr.c, Value::Int(matched as i64))?;
            }

            Not | Neg | BitNot | NotI | NotF | NotD | NegI | NegF | NegD | NegC | BitNotI => {
                self.unary(process, instr)?
            }
            op if op.binary_op().is_some() => self.binary(process, instr)?,

            NamedArg => {
                let name = self.constant(process, instr.a)?;
                let name = name
                    .as_str()
                    .ok_or_else(|| RuntimeError::Param("argument name is not a string".into()))?
                    .to_string();
                let value = process.top()?.get(instr.b).clone();
                let ty = TypeTable::global().named(&name, self.heap.type_of(&value));
                let named = self.heap.new_tuple(ty, vec![value]);
                self.store(process, instr.c, named)?;
            }
            Tuple | List | Map | Array => self.construct(process, instr)?,
            Closure => {
                let frame = process.top()?;
                let Value::Routine(routine) = frame.get(instr.a).clone() else {
                    return Err(RuntimeError::NotCallable(self.heap.type_of(frame.get(instr.a)).name().to_string()).into());
                };
                let captures = (instr.a + 1..=instr.a + instr.b)
                    .map(|r| frame.get(r).clone())
                    .collect();
                let closure = self.heap.new_closure(routine, captures);
                self.store(process, instr.c, closure)?;
            }

            Goto => process.top_mut()?.pc = instr.b as usize,
            Switch => self.switch(process, instr, pc)?,
            Test | TestI | TestF | TestD => {
                let frame = process.top_mut()?;
                if !frame.get(instr.a).is_truthy() {
                    frame.pc = instr.b as usize;
                }
            }

            Call | MCall | CallTyped | MCallTyped => self.call_instr(process, instr, pc)?,
            Return => return self.return_instr(process, instr),
            Yield => return self.yield_instr(process, instr),

            Try => process.top_mut()?.handlers.push(instr.b as usize),
            EndTry => {
                process.top_mut()?.handlers.pop();
            }
            Raise => self.raise_instr(process, instr)?,
            Rescue => self.rescue(process, instr)?,

            other => {
                return Err(RuntimeError::InvalidOperation(format!("unexpected opcode {}", other.name())).into());
            }
        }
        Ok(Flow::Next)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Write `value` into register `reg` of the top frame.
    #[inline]
    pub(super) fn store(&mut self, process: &mut Process, reg: u16, value: Value) -> Result<(), RuntimeError> {
        process.top_mut()?.set(&mut self.heap, reg, value);
        Ok(())
    }

    pub(super) fn constant(&self, process: &Process, index: u16) -> Result<Constant, RuntimeError> {
        process
            .top()?
            .body
            .constants
            .get(index)
            .cloned()
            .ok_or_else(|| RuntimeError::InvalidOperation(format!("no constant {index}")))
    }

    fn capture(&self, process: &Process, index: u16) -> Result<Value, RuntimeError> {
        let closure = process
            .top()?
            .closure
            .ok_or_else(|| RuntimeError::InvalidOperation("no captured variables".into()))?;
        match self.heap.get(closure) {
            Some(HeapObject::Closure(c)) => c
                .captures
                .get(index as usize)
                .cloned()
                .ok_or_else(|| RuntimeError::InvalidOperation(format!("no captured variable {index}"))),
            _ => Err(RuntimeError::InvalidOperation("dangling closure".into())),
        }
    }

    fn set_capture(&mut self, process: &mut Process, instr: Instruction) -> Result<(), RuntimeError> {
        let frame = process.top()?;
        let closure = frame
            .closure
            .ok_or_else(|| RuntimeError::InvalidOperation("no captured variables".into()))?;
        let value = frame.get(instr.a).clone();
        self.heap.inc_ref(&value);
        let old = match self.heap.get_mut(closure) {
            Some(HeapObject::Closure(c)) => c
                .captures
                .get_mut(instr.b as usize)
                .map(|slot| std::mem::replace(slot, value.clone())),
            _ => None,
        };
        match old {
            Some(old) => {
                self.heap.dec_ref(&old);
                Ok(())
            }
            None => {
                self.heap.dec_ref(&value);
                Err(RuntimeError::InvalidOperation(format!("no captured variable {}", instr.b)))
            }
        }
    }

    // ========================================================================
    // Switch
    // ========================================================================

    fn switch(&mut self, process: &mut Process, instr: Instruction, pc: usize) -> Result<(), RuntimeError> {
        let frame = process.top()?;
        let value = frame.get(instr.a).clone();
        let count = instr.c as usize;
        let cases = frame
            .body
            .code
            .get(pc + 1..pc + 1 + count)
            .ok_or_else(|| RuntimeError::InvalidOperation("switch runs past the routine".into()))?;
        let constants = &frame.body.constants;
        let label = |i: usize| constants.get(cases[i].instr.a);

        let mode = cases
            .first()
            .map_or(CaseMode::Unordered, |c| CaseMode::from_operand(c.instr.c));
        let found = match mode {
            CaseMode::Table => {
                let first = label(0).and_then(Constant::as_int);
                match (first, value.as_int()) {
                    (Some(first), Some(v)) => v
                        .checked_sub(first)
                        .and_then(|offset| usize::try_from(offset).ok())
                        .filter(|&offset| offset < count),
                    _ => None,
                }
            }
            CaseMode::Ordered => {
                let probe: Vec<usize> = (0..count).collect();
                probe
                    .binary_search_by(|&i| case_order(label(i), &value))
                    .ok()
            }
            CaseMode::Unordered => (0..count).find(|&i| {
                label(i)
                    .and_then(Constant::scalar_value)
                    .is_some_and(|c| c.same(&value))
            }),
        };
        let target = found.map_or(instr.b, |i| cases[i].instr.b);
        process.top_mut()?.pc = target as usize;
        Ok(())
    }
}

/// Order of a case label relative to the switched value.
fn case_order(label: Option<&Constant>, value: &Value) -> Ordering {
    match (label, value) {
        (Some(Constant::String(l)), Value::String(v)) => l.as_ref().cmp(v.as_ref()),
        (Some(l), v) => match (l.as_int(), v.as_int()) {
            (Some(l), Some(v)) => l.cmp(&v),
            _ => Ordering::Less,
        },
        (None, _) => Ordering::Less,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::program::Program;
    use rill_core::{EngineProperty, RoutineBuilder};

    fn vm_with(program: Program) -> Vm {
        Vm::new(Arc::new(program))
    }

    fn switch_routine(labels: &[i64]) -> Arc<rill_core::Routine> {
        let t = TypeTable::global();
        let count = labels.len() as u16;
        let blocks = 1 + count;
        let mut b = RoutineBuilder::new("pick").param("x", t.int());
        for &label in labels {
            b = b.constant(Constant::Int(label));
        }
        let default = blocks + 2 * 3;
        b = b.emit(OpCode::Switch, 0, default, count);
        for (i, _) in labels.iter().enumerate() {
            let target = blocks + 2 * (i as u16 % 3);
            b = b.emit(OpCode::Case, i as u16, target, 0);
        }
        for k in 0..3u16 {
            b = b.emit(OpCode::Data, data_kind::INT, k, 1).emit(OpCode::Return, 1, 1, 0);
        }
        b.emit(OpCode::Data, data_kind::INT, (-1i16) as u16, 1)
            .emit(OpCode::Return, 1, 1, 0)
            .build()
    }

    fn pick(typed: bool, labels: &[i64], x: i64) -> i64 {
        let mut program = Program::new();
        program.set_property(EngineProperty::TypedCode, typed as usize);
        program.add_routine(switch_routine(labels)).unwrap();
        let mut vm = vm_with(program);
        match vm.call("pick", vec![Value::Int(x)]).unwrap() {
            Value::Int(i) => i,
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn switch_modes_agree() {
        let sparse = [1, 50, 1000];
        for x in [0, 1, 2, 50, 999, 1000] {
            assert_eq!(pick(true, &sparse, x), pick(false, &sparse, x), "x = {x}");
        }
        let dense: Vec<i64> = (10..20).collect();
        for x in 8..22 {
            assert_eq!(pick(true, &dense, x), pick(false, &dense, x), "x = {x}");
        }
        assert_eq!(pick(true, &dense, 12), 2);
        assert_eq!(pick(true, &dense, 9), -1);
    }

    #[test]
    fn trapped_division_by_zero_is_raised() {
        let t = TypeTable::global();
        let div = RoutineBuilder::new("div")
            .param("a", t.double())
            .param("b", t.double())
            .line(3)
            .emit(OpCode::Div, 0, 1, 2)
            .line(4)
            .emit(OpCode::Return, 2, 1, 0)
            .build();
        let mut program = Program::new();
        program.add_routine(div).unwrap();
        let mut vm = vm_with(program);
        let err = vm.call("div", vec![Value::Double(1.0), Value::Double(0.0)]).unwrap_err();
        let report = err.exception().expect("uncaught exception");
        assert_eq!(report.category, "Error::Float::DivByZero");
        assert_eq!(report.line, 3);

        let mut program = Program::new();
        program.set_property(EngineProperty::TrapFloatExceptions, 0);
        program.add_routine(
            RoutineBuilder::new("div")
                .param("a", t.double())
                .param("b", t.double())
                .emit(OpCode::Div, 0, 1, 2)
                .emit(OpCode::Return, 2, 1, 0)
                .build(),
        )
        .unwrap();
        let mut vm = vm_with(program);
        assert!(matches!(
            vm.call("div", vec![Value::Double(1.0), Value::Double(0.0)]),
            Ok(Value::Double(d)) if d.is_infinite()
        ));
    }

    #[test]
    fn named_arguments_carry_their_name() {
        let t = TypeTable::global();
        let f = RoutineBuilder::new("f")
            .param("a", t.int())
            .param("b", t.int())
            .emit(OpCode::Sub, 0, 1, 2)
            .emit(OpCode::Return, 2, 1, 0)
            .build();
        let g = RoutineBuilder::new("g")
            .constant(Constant::Overloads(Arc::new(rill_core::OverloadSet::new("f", vec![f.clone()]))))
            .constant(Constant::string("a"))
            .constant(Constant::string("b"))
            .emit(OpCode::GetConst, 0, 0, 0)
            .emit(OpCode::Data, data_kind::INT, 10, 3)
            .emit(OpCode::Data, data_kind::INT, 4, 4)
            .emit(OpCode::NamedArg, 2, 3, 1)
            .emit(OpCode::NamedArg, 1, 4, 2)
            .emit(OpCode::Call, 0, 2, 5)
            .emit(OpCode::Return, 5, 1, 0)
            .build();
        let mut program = Program::new();
        program.add_routine(f).unwrap();
        program.add_routine(g).unwrap();
        let mut vm = vm_with(program);
        assert!(matches!(vm.call("g", vec![]), Ok(Value::Int(-6))));
        assert_eq!(vm.heap().live_count(), 0);
    }
}
