//! Loads, stores, moves and data construction.

use rill_core::bytecode::data_kind;
use rill_core::{Constant, InferErrorKind, Instruction, OpCode, TypeKind, TypeTable};

use super::{Callee, Pass, Step, numeric_move};
use crate::matcher::{MatchLevel, match_type};

/// `Data` and `GetConst`.
pub(super) fn infer_load(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let constant = match instr.op {
        OpCode::Data => {
            let raw = instr.b as i16;
            match instr.a {
                data_kind::INT => Constant::Int(raw as i64),
                data_kind::FLOAT => Constant::Float(raw as f32),
                data_kind::DOUBLE => Constant::Double(raw as f64),
                _ => Constant::None,
            }
        }
        _ => pass
            .constants
            .get(instr.b)
            .cloned()
            .ok_or_else(|| pass.fail(pc, InferErrorKind::InvalidOperation))?,
    };
    let specialized = match (instr.op, &constant) {
        (OpCode::Data, Constant::Int(_)) => Some(OpCode::DataI),
        (OpCode::Data, Constant::Float(_)) => Some(OpCode::DataF),
        (OpCode::Data, Constant::Double(_)) => Some(OpCode::DataD),
        (OpCode::GetConst, Constant::Int(_)) => Some(OpCode::GetConstI),
        (OpCode::GetConst, Constant::Float(_)) => Some(OpCode::GetConstF),
        (OpCode::GetConst, Constant::Double(_)) => Some(OpCode::GetConstD),
        _ => None,
    };
    if let Some(op) = specialized {
        pass.specialize(pc, op);
    }
    let ty = constant.type_of();
    pass.bind(pc, instr.c, &ty)?;
    if pass.ty(instr.c).hash() == ty.hash() || Callee::from_constant(&constant).is_some() {
        pass.remember(instr.c, Some(constant));
    }
    Ok(())
}

/// `GetGlobal` and `SetGlobal`.
pub(super) fn infer_global(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let types = TypeTable::global();
    let (namespace, slot) = match instr.op {
        OpCode::GetGlobal => (instr.a, instr.b),
        _ => (instr.c, instr.b),
    };
    let info = pass.session.env().global(namespace as usize, slot as usize);
    let global_ty = info.as_ref().map_or_else(|| types.any(), |g| g.ty.strip());

    if instr.op == OpCode::GetGlobal {
        match global_ty.kind() {
            TypeKind::Int => pass.specialize(pc, OpCode::GetGlobalI),
            TypeKind::Float => pass.specialize(pc, OpCode::GetGlobalF),
            TypeKind::Double => pass.specialize(pc, OpCode::GetGlobalD),
            _ => {}
        }
        pass.bind(pc, instr.c, &global_ty)?;
        if let Some(value) = info.and_then(|g| g.value) {
            pass.remember(instr.c, Some(value));
        }
        return Ok(());
    }

    if info.as_ref().is_some_and(|g| g.value.is_some()) {
        return Err(pass.fail(pc, InferErrorKind::ConstModified));
    }
    let source = pass.coerce(pc, instr.a, &global_ty)?;
    pass.instr_mut(pc).a = source;
    match (global_ty.kind(), pass.kind(source)) {
        (TypeKind::Int, TypeKind::Int) => pass.specialize(pc, OpCode::SetGlobalI),
        (TypeKind::Float, TypeKind::Float) => pass.specialize(pc, OpCode::SetGlobalF),
        (TypeKind::Double, TypeKind::Double) => pass.specialize(pc, OpCode::SetGlobalD),
        _ => {}
    }
    Ok(())
}

/// `GetCapture` and `SetCapture`: closure up-values.
pub(super) fn infer_capture(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let types = TypeTable::global();
    let captured = pass
        .decl
        .captures
        .get(instr.b as usize)
        .map_or_else(|| types.any(), |t| t.strip());
    if instr.op == OpCode::GetCapture {
        return pass.bind(pc, instr.c, &captured);
    }
    let source = pass.coerce(pc, instr.a, &captured)?;
    pass.instr_mut(pc).a = source;
    Ok(())
}

/// `Move` and `Cast`.
pub(super) fn infer_move(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let source = pass.ty(instr.a);
    let dest = pass.types[instr.c as usize].clone();

    let Some(dest) = dest else {
        pass.bind(pc, instr.c, &source)?;
        if let Some(op) = plain_move(source.kind()) {
            pass.specialize(pc, op);
        }
        propagate_known(pass, instr);
        return Ok(());
    };

    if source.is_numeric() && dest.is_numeric() {
        pass.specialize(pc, numeric_move(dest.kind(), source.kind()));
    } else if dest.is_dynamic() {
        if instr.op == OpCode::Cast {
            pass.specialize(pc, OpCode::Move);
        }
    } else if source.is_dynamic() {
        if instr.op == OpCode::Move {
            pass.specialize(pc, OpCode::Cast);
        }
    } else {
        match match_type(&source, &dest) {
            MatchLevel::Equal => {
                if let Some(op) = plain_move(dest.kind()) {
                    pass.specialize(pc, op);
                }
            }
            MatchLevel::Subtype | MatchLevel::AnyWildcard => pass.specialize(pc, OpCode::MovePP),
            // Run-time checked conversion.
            MatchLevel::Relaxed => pass.specialize(pc, OpCode::Cast),
            MatchLevel::NoMatch if instr.op == OpCode::Cast => {
                return Err(pass.fail_with(pc, InferErrorKind::TypeNotMatching, |d| {
                    d.mismatch(source.name(), dest.name())
                }));
            }
            MatchLevel::NoMatch => return pass.bind(pc, instr.c, &source),
        }
    }
    propagate_known(pass, instr);
    Ok(())
}

fn plain_move(kind: TypeKind) -> Option<OpCode> {
    match kind {
        TypeKind::Int => Some(OpCode::MoveII),
        TypeKind::Float => Some(OpCode::MoveFF),
        TypeKind::Double => Some(OpCode::MoveDD),
        TypeKind::String => Some(OpCode::MoveSS),
        TypeKind::Undefined | TypeKind::Any => None,
        _ => Some(OpCode::MovePP),
    }
}

fn propagate_known(pass: &mut Pass<'_, '_, '_>, instr: Instruction) {
    if pass.ty(instr.c).hash() != pass.ty(instr.a).hash() {
        return;
    }
    if let Some(c) = pass.constant_of(instr.a).cloned() {
        pass.remember(instr.c, Some(c));
    }
    if let Some(callee) = pass.callee_of(instr.a).cloned() {
        pass.remember_callee(instr.c, callee);
    }
}

/// `Check`: type test, an int result.
pub(super) fn infer_check(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    match pass.constants.get(instr.b) {
        Some(Constant::Type(_)) => pass.bind(pc, instr.c, &TypeTable::global().int()),
        _ => Err(pass.fail(pc, InferErrorKind::InvalidOperation)),
    }
}

/// `NamedArg`: `name => value` for a call.
pub(super) fn infer_named_arg(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let Some(name) = pass.constant_name(instr.a) else {
        return Err(pass.fail(pc, InferErrorKind::ParamWrongName));
    };
    let ty = TypeTable::global().named(&name, concrete_or_any(&pass.ty(instr.b)));
    pass.bind_wrapper(pc, instr.c, &ty)
}

fn concrete_or_any(ty: &rill_core::Ty) -> rill_core::Ty {
    if ty.kind() == TypeKind::Undefined {
        TypeTable::global().any()
    } else {
        ty.strip()
    }
}

/// `Tuple`, `List`, `Map` and `Array` construction.
pub(super) fn infer_construct(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let types = TypeTable::global();
    let items: Vec<rill_core::Ty> = (instr.a..instr.a + instr.b)
        .map(|r| concrete_or_any(&pass.ty(r)))
        .collect();
    let declared = pass.types[instr.c as usize].clone();

    let ty = match instr.op {
        OpCode::Tuple => match declared.filter(|d| d.kind() == TypeKind::Tuple) {
            Some(d) if d.params().len() == items.len() => {
                for (item, slot) in items.iter().zip(d.params()) {
                    check_item(pass, pc, item, slot)?;
                }
                d
            }
            _ => types.tuple(items),
        },
        OpCode::List => {
            let elem = match declared.as_ref().and_then(|d| d.element()) {
                Some(e) if declared.as_ref().is_some_and(|d| d.kind() == TypeKind::List) => {
                    e.clone()
                }
                _ => types.common(&items),
            };
            for item in &items {
                check_item(pass, pc, item, &elem)?;
            }
            types.list(elem)
        }
        OpCode::Map => {
            if items.len() % 2 != 0 {
                return Err(pass.fail(pc, InferErrorKind::DataCannotCreate));
            }
            let keys: Vec<_> = items.iter().step_by(2).cloned().collect();
            let values: Vec<_> = items.iter().skip(1).step_by(2).cloned().collect();
            let (key, value) = match declared.as_ref().and_then(|d| d.key_value()) {
                Some((k, v)) => (k.clone(), v.clone()),
                None => (types.common(&keys), types.common(&values)),
            };
            for k in &keys {
                check_item(pass, pc, k, &key)?;
            }
            for v in &values {
                check_item(pass, pc, v, &value)?;
            }
            types.map(key, value)
        }
        _ => {
            if items.iter().any(|t| !t.is_numeric() && !t.is_dynamic()) {
                return Err(pass.fail(pc, InferErrorKind::DataCannotCreate));
            }
            let elem = match declared.as_ref().filter(|d| d.kind() == TypeKind::Array) {
                Some(d) => d.element().cloned().unwrap_or_else(|| types.int()),
                None => {
                    let numeric: Vec<_> = items.iter().filter(|t| t.is_numeric()).cloned().collect();
                    if numeric.is_empty() {
                        types.int()
                    } else {
                        types.common(&numeric)
                    }
                }
            };
            if !elem.is_numeric() {
                return Err(pass.fail(pc, InferErrorKind::DataCannotCreate));
            }
            types.array(elem)
        }
    };
    pass.bind(pc, instr.c, &ty)
}

/// An item stored into a typed container must fit its slot.
fn check_item(
    pass: &Pass<'_, '_, '_>,
    pc: usize,
    item: &rill_core::Ty,
    slot: &rill_core::Ty,
) -> Step {
    if item.is_numeric() && slot.is_numeric() {
        return Ok(());
    }
    if match_type(item, slot).is_match() {
        Ok(())
    } else {
        Err(pass.fail_with(pc, InferErrorKind::TypeNotMatching, |d| {
            d.mismatch(item.name(), slot.name())
        }))
    }
}

/// `Closure`: binds up-values to a statically known routine.
pub(super) fn infer_closure(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let Some(Callee::Routine(routine)) = pass.callee_of(instr.a).cloned() else {
        return Err(pass.fail(pc, InferErrorKind::InvalidOperation));
    };
    let captures = &routine.decl().captures;
    if captures.len() != instr.b as usize {
        return Err(pass.fail(pc, InferErrorKind::ParamWrongNumber));
    }
    for (i, slot) in captures.iter().enumerate() {
        let item = pass.ty(instr.a + 1 + i as u16);
        check_item(pass, pc, &item, slot)?;
    }
    pass.bind(pc, instr.c, &routine.signature())?;
    pass.remember_callee(instr.c, Callee::Routine(routine));
    Ok(())
}
