//! Operators: numeric specialization, constant folding, operator overloads.
//!
//! Numeric operands of one kind specialize to the fully typed opcode
//! (`AddIII`, `LtIDD`); mixed kinds use the `N` forms, which skip the result
//! tag dispatch but still convert operands. Object operands resolve the
//! operator method in the order the execution engine tries it: the compound
//! form when the destination aliases the left operand, then the binary form,
//! then the swapped comparison on the right operand.

use rill_core::ops::{
    BinaryOp, FloatFlags, UnaryOp, numeric_result_kind, scalar_binary, scalar_unary,
};
use rill_core::{Constant, InferErrorKind, Instruction, OpCode, Rejection, Ty, TypeKind, TypeTable, Value};

use super::{Pass, Step, calls};

pub(super) fn infer_unary(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let types = TypeTable::global();
    let Some(op) = instr.op.unary_op() else {
        return Err(pass.fail(pc, InferErrorKind::InvalidOperation));
    };
    if fold(pass, pc, instr, |a, _| scalar_unary(op, a).ok())? {
        return Ok(());
    }

    let operand = pass.ty(instr.a);
    let (specialized, result) = match (op, operand.kind()) {
        (UnaryOp::Not, TypeKind::Int) => (Some(OpCode::NotI), types.int()),
        (UnaryOp::Not, TypeKind::Float) => (Some(OpCode::NotF), types.int()),
        (UnaryOp::Not, TypeKind::Double) => (Some(OpCode::NotD), types.int()),
        (UnaryOp::Not, TypeKind::None) => (None, types.int()),
        (UnaryOp::Neg, TypeKind::Int) => (Some(OpCode::NegI), types.int()),
        (UnaryOp::Neg, TypeKind::Float) => (Some(OpCode::NegF), types.float()),
        (UnaryOp::Neg, TypeKind::Double) => (Some(OpCode::NegD), types.double()),
        (UnaryOp::Neg, TypeKind::Complex) => (Some(OpCode::NegC), types.complex()),
        (UnaryOp::BitNot, TypeKind::Int) => (Some(OpCode::BitNotI), types.int()),
        (_, TypeKind::Any | TypeKind::Undefined) => (None, types.any()),
        (_, TypeKind::Object) => {
            let args = [operand.clone()];
            return match calls::operator_call(pass, pc, &operand, op.symbol(), &args)? {
                Some(Ok(ret)) => pass.bind(pc, instr.c, &ret),
                Some(Err(rejections)) if op != UnaryOp::Not => Err(invalid_operation(pass, pc, rejections)),
                None if op != UnaryOp::Not => Err(invalid_operation(pass, pc, Vec::new())),
                _ => pass.bind(pc, instr.c, &types.int()),
            };
        }
        _ => return Err(invalid_operation(pass, pc, Vec::new())),
    };
    if let Some(op) = specialized {
        pass.specialize(pc, op);
    }
    pass.bind(pc, instr.c, &result)
}

pub(super) fn infer_binary(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let types = TypeTable::global();
    let Some(op) = instr.op.binary_op() else {
        return Err(pass.fail(pc, InferErrorKind::InvalidOperation));
    };
    let folded = fold(pass, pc, instr, |a, b| {
        let mut flags = FloatFlags::empty();
        scalar_binary(op, a, b?, &mut flags)
            .ok()
            .filter(|_| flags.is_empty())
    })?;
    if folded {
        return Ok(());
    }

    let (left, right) = (pass.ty(instr.a), pass.ty(instr.b));
    let (ka, kb) = (left.kind(), right.kind());

    if ka.is_numeric() && kb.is_numeric() {
        let Some(result) = numeric_result_kind(op, ka, kb) else {
            return Err(invalid_operation(pass, pc, Vec::new()));
        };
        if let Some(specialized) = numeric_opcode(op, ka, kb) {
            pass.specialize(pc, specialized);
        }
        return pass.bind(pc, instr.c, &types.numeric(result));
    }

    let complex_operands = (ka == TypeKind::Complex || kb == TypeKind::Complex)
        && [ka, kb]
            .iter()
            .all(|k| k.is_numeric() || *k == TypeKind::Complex);
    if complex_operands {
        let result = match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                if ka == TypeKind::Complex && kb == TypeKind::Complex {
                    let specialized = match op {
                        BinaryOp::Add => OpCode::AddCC,
                        BinaryOp::Sub => OpCode::SubCC,
                        BinaryOp::Mul => OpCode::MulCC,
                        _ => OpCode::DivCC,
                    };
                    pass.specialize(pc, specialized);
                }
                types.complex()
            }
            BinaryOp::Eq | BinaryOp::Ne => types.int(),
            _ => return Err(invalid_operation(pass, pc, Vec::new())),
        };
        return pass.bind(pc, instr.c, &result);
    }

    match (ka, kb) {
        (TypeKind::String, TypeKind::String) => {
            let (specialized, result) = match op {
                BinaryOp::Add => (OpCode::AddSS, types.string()),
                BinaryOp::Lt => (OpCode::LtSS, types.int()),
                BinaryOp::Le => (OpCode::LeSS, types.int()),
                BinaryOp::Eq => (OpCode::EqSS, types.int()),
                BinaryOp::Ne => (OpCode::NeSS, types.int()),
                _ => return Err(invalid_operation(pass, pc, Vec::new())),
            };
            pass.specialize(pc, specialized);
            pass.bind(pc, instr.c, &result)
        }
        (TypeKind::Enum, TypeKind::Enum) if left.hash() == right.hash() => match op {
            BinaryOp::BitAnd | BinaryOp::BitOr => pass.bind(pc, instr.c, &left),
            _ if op.is_comparison() => pass.bind(pc, instr.c, &types.int()),
            _ => Err(invalid_operation(pass, pc, Vec::new())),
        },
        (TypeKind::Object, _) | (_, TypeKind::Object) => {
            infer_operator_method(pass, pc, instr, op, &left, &right)
        }
        _ if left.is_dynamic() || right.is_dynamic() => pass.bind(pc, instr.c, &types.any()),
        // Identity comparison of anything else.
        _ if matches!(op, BinaryOp::Eq | BinaryOp::Ne) => pass.bind(pc, instr.c, &types.int()),
        _ => Err(invalid_operation(pass, pc, Vec::new())),
    }
}

fn infer_operator_method(
    pass: &mut Pass<'_, '_, '_>,
    pc: usize,
    instr: Instruction,
    op: BinaryOp,
    left: &Ty,
    right: &Ty,
) -> Step {
    let mut attempts: Vec<(&Ty, &'static str, [Ty; 2])> = Vec::with_capacity(3);
    if let Some(compound) = op.compound_symbol().filter(|_| instr.c == instr.a) {
        attempts.push((left, compound, [left.clone(), right.clone()]));
    }
    attempts.push((left, op.symbol(), [left.clone(), right.clone()]));
    if let Some(swapped) = op.swapped_symbol() {
        attempts.push((right, swapped, [right.clone(), left.clone()]));
    }

    let mut rejections = Vec::new();
    for (i, (receiver, symbol, args)) in attempts.into_iter().enumerate() {
        if receiver.kind() != TypeKind::Object {
            continue;
        }
        match calls::operator_call(pass, pc, receiver, symbol, &args)? {
            Some(Ok(ret)) => {
                let compound = i == 0 && instr.c == instr.a && op.compound_symbol().is_some();
                let result = if compound && matches!(ret.kind(), TypeKind::None | TypeKind::Undefined) {
                    left.clone()
                } else {
                    ret
                };
                return pass.bind(pc, instr.c, &result);
            }
            Some(Err(r)) => rejections.extend(r),
            None => {}
        }
    }
    let types = TypeTable::global();
    if left.is_dynamic() || right.is_dynamic() {
        return pass.bind(pc, instr.c, &types.any());
    }
    // Without a method the engine compares identity and picks an operand by truthiness.
    match op {
        BinaryOp::Eq | BinaryOp::Ne => pass.bind(pc, instr.c, &types.int()),
        BinaryOp::And | BinaryOp::Or if left.hash() == right.hash() => pass.bind(pc, instr.c, left),
        BinaryOp::And | BinaryOp::Or => pass.bind(pc, instr.c, &types.any()),
        _ => Err(invalid_operation(pass, pc, rejections)),
    }
}

fn invalid_operation(pass: &Pass<'_, '_, '_>, pc: usize, rejections: Vec<Rejection>) -> super::Abort {
    pass.fail_with(pc, InferErrorKind::InvalidOperation, |d| d.with_rejections(rejections))
}

/// Fold an operator over known constant operands into a constant load.
///
/// Returns whether the instruction was folded.
fn fold(
    pass: &mut Pass<'_, '_, '_>,
    pc: usize,
    instr: Instruction,
    eval: impl FnOnce(&Value, Option<&Value>) -> Option<Value>,
) -> Result<bool, super::Abort> {
    if !pass.options.typed_code {
        return Ok(false);
    }
    let binary = instr.op.binary_op().is_some();
    let Some(a) = pass.constant_of(instr.a).and_then(|c| c.scalar_value()) else {
        return Ok(false);
    };
    let b = if binary {
        match pass.constant_of(instr.b).and_then(|c| c.scalar_value()) {
            Some(b) => Some(b),
            None => return Ok(false),
        }
    } else {
        None
    };
    let Some(constant) = eval(&a, b.as_ref()).and_then(|v| Constant::from_scalar(&v)) else {
        return Ok(false);
    };
    let index = pass.constants.add(constant.clone());
    let op = match constant {
        Constant::Int(_) => OpCode::GetConstI,
        Constant::Float(_) => OpCode::GetConstF,
        Constant::Double(_) => OpCode::GetConstD,
        _ => OpCode::GetConst,
    };
    *pass.instr_mut(pc) = Instruction::new(op, 0, index, instr.c);
    let ty = constant.type_of();
    pass.bind(pc, instr.c, &ty)?;
    if pass.ty(instr.c).hash() == ty.hash() {
        pass.remember(instr.c, Some(constant));
    }
    Ok(true)
}

/// Specialized opcode for numeric operands of kinds `a` and `b`.
pub(crate) fn numeric_opcode(op: BinaryOp, a: TypeKind, b: TypeKind) -> Option<OpCode> {
    use BinaryOp as B;
    use OpCode::*;
    use TypeKind::{Double, Float, Int};
    Some(match (a, b) {
        (Int, Int) => match op {
            B::Add => AddIII,
            B::Sub => SubIII,
            B::Mul => MulIII,
            B::Div => DivIII,
            B::Mod => ModIII,
            B::Pow => PowIII,
            B::And => AndIII,
            B::Or => OrIII,
            B::Lt => LtIII,
            B::Le => LeIII,
            B::Eq => EqIII,
            B::Ne => NeIII,
            B::BitAnd => BitAndIII,
            B::BitOr => BitOrIII,
            B::BitXor => BitXorIII,
            B::Shl => ShlIII,
            B::Shr => ShrIII,
        },
        (Float, Float) => match op {
            B::Add => AddFFF,
            B::Sub => SubFFF,
            B::Mul => MulFFF,
            B::Div => DivFFF,
            B::Mod => ModFFF,
            B::Pow => PowFFF,
            B::And => AndFFF,
            B::Or => OrFFF,
            B::Lt => LtIFF,
            B::Le => LeIFF,
            B::Eq => EqIFF,
            B::Ne => NeIFF,
            _ => return None,
        },
        (Double, Double) => match op {
            B::Add => AddDDD,
            B::Sub => SubDDD,
            B::Mul => MulDDD,
            B::Div => DivDDD,
            B::Mod => ModDDD,
            B::Pow => PowDDD,
            B::And => AndDDD,
            B::Or => OrDDD,
            B::Lt => LtIDD,
            B::Le => LeIDD,
            B::Eq => EqIDD,
            B::Ne => NeIDD,
            _ => return None,
        },
        _ => {
            let double = a == Double || b == Double;
            match (op, double) {
                (B::Add, false) => AddFNN,
                (B::Sub, false) => SubFNN,
                (B::Mul, false) => MulFNN,
                (B::Div, false) => DivFNN,
                (B::Mod, false) => ModFNN,
                (B::Pow, false) => PowFNN,
                (B::Add, true) => AddDNN,
                (B::Sub, true) => SubDNN,
                (B::Mul, true) => MulDNN,
                (B::Div, true) => DivDNN,
                (B::Mod, true) => ModDNN,
                (B::Pow, true) => PowDNN,
                (B::Lt, _) => LtINN,
                (B::Le, _) => LeINN,
                (B::Eq, _) => EqINN,
                (B::Ne, _) => NeINN,
                _ => return None,
            }
        }
    })
}
