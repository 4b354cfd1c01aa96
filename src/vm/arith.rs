//! Unary and binary operators.
//!
//! Specialized opcodes whose operands carry the expected tags take a direct
//! path; everything else goes through the shared scalar operator table.
//! Operands it does not cover are offered to the operator methods of object
//! operands: the compound form (`+=`) for in-place updates, the plain symbol on
//! the left operand, then the mirrored comparison on the right one.

use rill_core::ops::{
    BinaryOp, FloatFlags, ScalarError, UnaryOp, double_binary, float_binary, int_binary, scalar_binary,
    scalar_unary,
};
use rill_core::{Instruction, OpCode, RuntimeError, TypeKind, Value};

use super::Vm;
use super::frame::{Landing, Process};
use crate::error::RillResult;

/// Operand layout of a specialized binary opcode.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Shape {
    Ints,
    Floats,
    Doubles,
    /// Generic operands, result converted to the kind.
    Result(TypeKind),
    Generic,
}

fn shape(op: OpCode) -> Shape {
    use OpCode::*;
    match op {
        AddIII | SubIII | MulIII | DivIII | ModIII | PowIII | AndIII | OrIII | LtIII | LeIII
        | EqIII | NeIII | BitAndIII | BitOrIII | BitXorIII | ShlIII | ShrIII => Shape::Ints,
        AddFFF | SubFFF | MulFFF | DivFFF | ModFFF | PowFFF | AndFFF | OrFFF => Shape::Floats,
        AddDDD | SubDDD | MulDDD | DivDDD | ModDDD | PowDDD | AndDDD | OrDDD => Shape::Doubles,
        AddFNN | SubFNN | MulFNN | DivFNN | ModFNN | PowFNN => Shape::Result(TypeKind::Float),
        AddDNN | SubDNN | MulDNN | DivDNN | ModDNN | PowDNN => Shape::Result(TypeKind::Double),
        LtIFF | LeIFF | EqIFF | NeIFF | LtIDD | LeIDD | EqIDD | NeIDD | LtINN | LeINN | EqINN
        | NeINN => Shape::Result(TypeKind::Int),
        _ => Shape::Generic,
    }
}

impl Vm {
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(super) fn binary(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let Some(op) = instr.op.binary_op() else {
            return Err(RuntimeError::InvalidOperation(format!("{} is not a binary operator", instr.op.name())).into());
        };
        let frame = process.top()?;
        let a = frame.get(instr.a).clone();
        let b = frame.get(instr.b).clone();

        let computed = match (shape(instr.op), &a, &b) {
            (Shape::Ints, Value::Int(x), Value::Int(y)) => int_binary(op, *x, *y).map(Value::Int),
            (Shape::Floats, Value::Float(x), Value::Float(y)) => float_binary(op, *x, *y).map(|r| {
                process.float_flags |= FloatFlags::observe(op, *x as f64, *y as f64, r as f64);
                Value::Float(r)
            }),
            (Shape::Doubles, Value::Double(x), Value::Double(y)) => double_binary(op, *x, *y).map(|r| {
                process.float_flags |= FloatFlags::observe(op, *x, *y, r);
                Value::Double(r)
            }),
            _ => scalar_binary(op, &a, &b, &mut process.float_flags),
        };
        let value = match computed {
            Ok(value) => value,
            Err(ScalarError::Unsupported) => return self.operator_method(process, op, instr, a, b),
            Err(err) => return Err(RuntimeError::from(err).into()),
        };
        let value = match shape(instr.op) {
            Shape::Result(kind) if value.is_numeric() && value.kind() != kind => {
                value.convert_numeric(kind).unwrap_or(value)
            }
            _ => value,
        };
        self.store(process, instr.c, value)?;
        Ok(())
    }

    fn operator_method(
        &mut self,
        process: &mut Process,
        op: BinaryOp,
        instr: Instruction,
        a: Value,
        b: Value,
    ) -> RillResult<()> {
        let landing = Landing::Register(instr.c);
        if instr.c == instr.a {
            if let Some(symbol) = op.compound_symbol() {
                let args = vec![a.clone(), b.clone()];
                if self.call_method(process, &a, symbol, args, Landing::UnlessNone(instr.c))? {
                    return Ok(());
                }
            }
        }
        if self.call_method(process, &a, op.symbol(), vec![a.clone(), b.clone()], landing)? {
            return Ok(());
        }
        if let Some(symbol) = op.swapped_symbol() {
            if self.call_method(process, &b, symbol, vec![b.clone(), a.clone()], landing)? {
                return Ok(());
            }
        }

        let value = match op {
            BinaryOp::Eq => Value::Int(a.same(&b) as i64),
            BinaryOp::Ne => Value::Int(!a.same(&b) as i64),
            BinaryOp::And if a.is_truthy() => b,
            BinaryOp::Or if !a.is_truthy() => b,
            BinaryOp::And | BinaryOp::Or => a,
            _ => {
                return Err(RuntimeError::InvalidOperation(format!(
                    "operator {} does not apply to {} and {}",
                    op.symbol(),
                    self.heap.type_of(&a).name(),
                    self.heap.type_of(&b).name()
                ))
                .into());
            }
        };
        self.store(process, instr.c, value)?;
        Ok(())
    }

    pub(super) fn unary(&mut self, process: &mut Process, instr: Instruction) -> RillResult<()> {
        let Some(op) = instr.op.unary_op() else {
            return Err(RuntimeError::InvalidOperation(format!("{} is not a unary operator", instr.op.name())).into());
        };
        let a = process.top()?.get(instr.a).clone();
        let value = match scalar_unary(op, &a) {
            Ok(value) => value,
            Err(ScalarError::Unsupported) => {
                let landing = Landing::Register(instr.c);
                if self.call_method(process, &a, op.symbol(), vec![a.clone()], landing)? {
                    return Ok(());
                }
                if op != UnaryOp::Not {
                    return Err(RuntimeError::InvalidOperation(format!(
                        "operator {} does not apply to {}",
                        op.symbol(),
                        self.heap.type_of(&a).name()
                    ))
                    .into());
                }
                Value::Int(!a.is_truthy() as i64)
            }
            Err(err) => return Err(RuntimeError::from(err).into()),
        };
        self.store(process, instr.c, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::error::RillError;
    use crate::program::Program;
    use rill_core::bytecode::data_kind;
    use rill_core::{ClassBuilder, ClassId, Constant, Heap, HeapObject, RoutineBuilder, Ty, TypeTable};

    fn counter_plus(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
        let n = match args[0].handle().and_then(|h| heap.get(h)) {
            Some(HeapObject::Instance(o)) => o.fields[0].as_int().unwrap_or(0),
            _ => return Err(RuntimeError::InvalidOperation("not a counter".into())),
        };
        Ok(Value::Int(n + args[1].as_int().unwrap_or(0)))
    }

    fn counter_program() -> (Vm, Ty) {
        let t = TypeTable::global();
        let builder = ClassBuilder::new(ClassId(1), "Counter", None).field("n", t.int(), Constant::Int(0));
        let counter = builder.object_type();
        let plus = RoutineBuilder::new("+")
            .param("self", counter.clone())
            .param("k", t.int())
            .returns(t.int())
            .host(ClassId(1))
            .build_native(counter_plus);
        let bump = RoutineBuilder::new("bump")
            .param("c", counter.clone())
            .emit(OpCode::Data, data_kind::INT, 5, 1)
            .emit(OpCode::Add, 0, 1, 2)
            .emit(OpCode::Return, 2, 1, 0)
            .build();
        let same = RoutineBuilder::new("same")
            .param("a", counter.clone())
            .param("b", counter.clone())
            .emit(OpCode::Eq, 0, 1, 2)
            .emit(OpCode::Return, 2, 1, 0)
            .build();

        let mut program = Program::new();
        program.add_class(builder.method(plus).build()).unwrap();
        program.add_routine(bump).unwrap();
        program.add_routine(same).unwrap();
        (Vm::new(Arc::new(program)), counter)
    }

    #[test]
    fn object_operands_use_operator_methods() {
        let (mut vm, counter) = counter_program();
        let c = vm.heap_mut().new_instance(ClassId(1), counter, vec![Value::Int(3)]);
        assert!(matches!(vm.call("bump", vec![c]), Ok(Value::Int(8))));
        assert_eq!(vm.heap().live_count(), 0);
    }

    #[test]
    fn equality_without_a_method_is_identity() {
        let (mut vm, counter) = counter_program();
        let c = vm.heap_mut().new_instance(ClassId(1), counter.clone(), vec![Value::Int(0)]);
        assert!(matches!(vm.call("same", vec![c.clone(), c]), Ok(Value::Int(1))));
        let c = vm.heap_mut().new_instance(ClassId(1), counter.clone(), vec![Value::Int(0)]);
        let d = vm.heap_mut().new_instance(ClassId(1), counter, vec![Value::Int(0)]);
        assert!(matches!(vm.call("same", vec![c, d]), Ok(Value::Int(0))));
    }

    #[test]
    fn integer_division_by_zero_raises() {
        let t = TypeTable::global();
        let div = RoutineBuilder::new("div")
            .param("a", t.int())
            .param("b", t.int())
            .emit(OpCode::Div, 0, 1, 2)
            .emit(OpCode::Return, 2, 1, 0)
            .build();
        let mut program = Program::new();
        program.add_routine(div).unwrap();
        let mut vm = Vm::new(Arc::new(program));
        assert!(matches!(vm.call("div", vec![Value::Int(7), Value::Int(2)]), Ok(Value::Int(3))));
        let err = vm.call("div", vec![Value::Int(7), Value::Int(0)]).unwrap_err();
        assert!(matches!(&err, RillError::Uncaught(_)));
        assert_eq!(
            err.exception().map(|r| r.category.as_str()),
            Some(RuntimeError::DivisionByZero.category())
        );
    }

    #[test]
    fn mixed_numeric_operands_promote() {
        let t = TypeTable::global();
        let mul = RoutineBuilder::new("mul")
            .param("a", t.int())
            .param("b", t.double())
            .emit(OpCode::Mul, 0, 1, 2)
            .emit(OpCode::Return, 2, 1, 0)
            .build();
        let mut program = Program::new();
        program.add_routine(mul).unwrap();
        let mut vm = Vm::new(Arc::new(program));
        assert!(matches!(
            vm.call("mul", vec![Value::Int(3), Value::Double(0.5)]),
            Ok(Value::Double(d)) if d == 1.5
        ));
    }
}
