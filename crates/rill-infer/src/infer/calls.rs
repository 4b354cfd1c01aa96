//! Calls, returns and yields.
//!
//! A statically known callee is resolved against the argument types,
//! specialized to them when its parameters are generic, and compiled on
//! demand so its return type is known at the call site. Calls whose callee
//! and argument types are fully proven become `CallTyped`/`MCallTyped`
//! with the resolved routine recorded against the instruction.

use std::sync::Arc;

use rill_core::{
    CallFlags, InferErrorKind, Instruction, OpCode, Rejection, Routine, RoutineFlags, Ty, TypeKind,
    TypeTable,
};

use super::{Abort, Callee, Pass, Step};
use crate::matcher::{MatchLevel, Resolved, match_type, resolve_overload, resolve_routine};
use crate::specialize::specialize;

/// What a call resolved to.
struct Target {
    routine: Option<Arc<Routine>>,
    ret: Ty,
    /// Eligible for a direct, unchecked call.
    direct: bool,
}

pub(super) fn infer_call(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let types = TypeTable::global();
    let flags = instr.call_flags();
    let method_shape = instr.op == OpCode::MCall || flags.contains(CallFlags::METHOD);

    let arg_regs: Vec<u16> = if flags.contains(CallFlags::CALLER_PARAMS) {
        (0..pass.decl.params.len() as u16).collect()
    } else {
        (1..=instr.call_argc() as u16).map(|i| instr.a + i).collect()
    };
    let mut args: Vec<Ty> = arg_regs.iter().map(|&r| argument_type(&pass.ty(r))).collect();

    if flags.contains(CallFlags::EXPAND_TUPLE) {
        match args.pop() {
            Some(last) if last.kind() == TypeKind::Tuple => {
                args.extend(last.params().iter().map(|item| argument_type(&item.strip())));
            }
            Some(last) if last.is_dynamic() => return pass.bind(pc, instr.c, &types.any()),
            _ => return Err(pass.fail(pc, InferErrorKind::ParamWrongType)),
        }
    }

    let target = match pass.callee_of(instr.a).cloned() {
        Some(Callee::Routine(routine)) => {
            let resolved = resolve_routine(&routine, &args).map_err(|r| reject(pass, pc, vec![r]))?;
            settle(pass, pc, resolved, &args)?
        }
        Some(Callee::Overloads(set)) => {
            let resolved =
                resolve_overload(&set, &args, method_shape).map_err(|r| reject(pass, pc, r))?;
            settle(pass, pc, resolved, &args)?
        }
        Some(Callee::Class(class)) => {
            let object = class.object_type.clone();
            match &class.constructors {
                Some(set) => {
                    let mut with_self = Vec::with_capacity(args.len() + 1);
                    with_self.push(object.clone());
                    with_self.extend(args.iter().cloned());
                    let resolved =
                        resolve_overload(set, &with_self, true).map_err(|r| reject(pass, pc, r))?;
                    let settled = settle(pass, pc, resolved, &with_self)?;
                    Target {
                        routine: settled.routine,
                        ret: object,
                        direct: false,
                    }
                }
                None if args.is_empty() => Target {
                    routine: None,
                    ret: object,
                    direct: false,
                },
                None => return Err(pass.fail(pc, InferErrorKind::ParamWrongNumber)),
            }
        }
        None => {
            let callee = pass.ty(instr.a);
            match callee.kind() {
                TypeKind::Routine => Target {
                    routine: None,
                    ret: callee
                        .ret()
                        .filter(|r| !r.is_dynamic())
                        .cloned()
                        .unwrap_or_else(|| types.any()),
                    direct: false,
                },
                TypeKind::Object => {
                    let mut with_self = Vec::with_capacity(args.len() + 1);
                    with_self.push(callee.clone());
                    with_self.extend(args.iter().cloned());
                    match operator_call(pass, pc, &callee, "()", &with_self)? {
                        Some(Ok(ret)) => Target {
                            routine: None,
                            ret,
                            direct: false,
                        },
                        Some(Err(rejections)) => return Err(reject(pass, pc, rejections)),
                        None => return Err(pass.fail(pc, InferErrorKind::CallNotPermitted)),
                    }
                }
                TypeKind::Any | TypeKind::Undefined => Target {
                    routine: None,
                    ret: types.any(),
                    direct: false,
                },
                _ => {
                    return Err(pass.fail_with(pc, InferErrorKind::CallNotPermitted, |d| {
                        d.with_subject(callee.name())
                    }));
                }
            }
        }
    };

    pass.bind(pc, instr.c, &target.ret)?;

    let plain_args = !flags.intersects(CallFlags::EXPAND_TUPLE | CallFlags::CALLER_PARAMS);
    if let Some(routine) = target.routine.filter(|_| target.direct && plain_args) {
        if pass.options.typed_code {
            let typed = if instr.op == OpCode::MCall {
                OpCode::MCallTyped
            } else {
                OpCode::CallTyped
            };
            pass.specialize(pc, typed);
            pass.static_callees.insert(pc, routine);
        }
    }
    Ok(())
}

/// Undefined argument registers are passed as `any`.
fn argument_type(ty: &Ty) -> Ty {
    if ty.kind() == TypeKind::Undefined {
        TypeTable::global().any()
    } else {
        ty.clone()
    }
}

fn reject(pass: &Pass<'_, '_, '_>, pc: usize, rejections: Vec<Rejection>) -> Abort {
    let kind = match rejections.as_slice() {
        [only] => only.reason.kind(),
        _ => InferErrorKind::ParamError,
    };
    pass.fail_with(pc, kind, |d| d.with_rejections(rejections))
}

/// Specialize and compile a resolved callee; its result type at this call.
fn settle(pass: &mut Pass<'_, '_, '_>, pc: usize, resolved: Resolved, args: &[Ty]) -> Result<Target, Abort> {
    let types = TypeTable::global();
    let routine = if resolved.routine.native().is_some() {
        resolved.routine.clone()
    } else {
        specialize(pass.session, &resolved, args)
    };

    compile_closure_arguments(pass, pc, &routine, &resolved)?;
    if routine.native().is_none() && !routine.is_compiled() && !pass.session.in_progress(&routine) {
        pass.session.compile(&routine)?;
    }

    let ret = if routine.is_coroutine() {
        routine.signature().ret().cloned().unwrap_or_else(|| types.process(types.any()))
    } else {
        routine
            .return_type()
            .map(|r| types.substitute(&r, &resolved.bindings))
            .filter(|r| r.kind() != TypeKind::TypeParam)
            .unwrap_or_else(|| types.any())
    };

    let params = &routine.decl().params;
    let exact_arity = !routine.decl().variadic && params.len() == args.len();
    let proven = exact_arity
        && args.iter().zip(params).all(|(arg, param)| {
            matches!(
                match_type(arg, &param.ty.strip()),
                MatchLevel::Equal | MatchLevel::Subtype
            )
        });
    let direct = proven
        && resolved.order.is_none()
        && !routine.is_coroutine()
        && !routine.flags().contains(RoutineFlags::VIRTUAL);
    Ok(Target {
        routine: Some(routine),
        ret,
        direct,
    })
}

/// Closures passed for a routine-typed parameter are compiled against the
/// return type that parameter expects.
fn compile_closure_arguments(
    pass: &mut Pass<'_, '_, '_>,
    pc: usize,
    routine: &Arc<Routine>,
    resolved: &Resolved,
) -> Step {
    let instr = pass.code[pc].instr;
    if instr.call_flags().intersects(CallFlags::CALLER_PARAMS | CallFlags::EXPAND_TUPLE) {
        return Ok(());
    }
    for i in 0..instr.call_argc() {
        let reg = instr.a + 1 + i as u16;
        let Some(Callee::Routine(closure)) = pass.callee_of(reg).cloned() else {
            continue;
        };
        if closure.is_compiled() || pass.session.in_progress(&closure) {
            continue;
        }
        let slot = match &resolved.order {
            Some(order) => order.get(i).copied().flatten(),
            None => Some(i),
        };
        let expected = slot
            .and_then(|s| routine.decl().params.get(s))
            .map(|p| p.ty.strip())
            .filter(|t| t.kind() == TypeKind::Routine)
            .and_then(|t| t.ret().cloned())
            .filter(|r| !r.is_generic());
        match expected {
            Some(ret) => pass.session.compile_expecting(&closure, ret)?,
            None => pass.session.compile(&closure)?,
        };
    }
    Ok(())
}

/// Resolve operator method `symbol` on the class of `receiver`.
///
/// `Ok(None)` when the class defines no such method; the inner error lists
/// the rejected candidates when it does but none accepts `args`.
pub(super) fn operator_call(
    pass: &mut Pass<'_, '_, '_>,
    pc: usize,
    receiver: &Ty,
    symbol: &str,
    args: &[Ty],
) -> Result<Option<Result<Ty, Vec<Rejection>>>, Abort> {
    let Some(class) = receiver.class_id().and_then(|id| pass.session.env().class(id)) else {
        return Ok(None);
    };
    let Some(set) = class.method(symbol).cloned() else {
        return Ok(None);
    };
    match resolve_overload(&set, args, true) {
        Ok(resolved) => Ok(Some(Ok(settle(pass, pc, resolved, args)?.ret))),
        Err(rejections) => Ok(Some(Err(rejections))),
    }
}

pub(super) fn infer_return(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let types = TypeTable::global();
    if pass.routine.is_coroutine() {
        return Ok(());
    }
    let value = match instr.b {
        0 => types.none(),
        1 => argument_type(&pass.ty(instr.a)),
        n => types.tuple((instr.a..instr.a + n).map(|r| argument_type(&pass.ty(r))).collect()),
    };

    let declared = pass
        .decl
        .ret
        .clone()
        .or_else(|| pass.expected_return.clone())
        .map(|t| t.strip());
    let target = match (declared, pass.ret.clone()) {
        (Some(t), _) => t,
        (None, None) => {
            let ret = value.strip();
            pass.routine.patch_return_type(&ret);
            pass.ret = Some(ret);
            return Ok(());
        }
        (None, Some(previous)) => previous,
    };
    if pass.ret.is_none() {
        pass.routine.patch_return_type(&target);
        pass.ret = Some(target.clone());
    }
    check_result(pass, pc, instr, &value, &target, pass.decl.ret.is_none())
}

pub(super) fn infer_yield(pass: &mut Pass<'_, '_, '_>, pc: usize, instr: Instruction) -> Step {
    let types = TypeTable::global();
    if !pass.routine.is_coroutine() {
        return Err(pass.fail(pc, InferErrorKind::InvalidYield));
    }
    let value = match instr.b {
        0 => types.none(),
        1 => argument_type(&pass.ty(instr.a)),
        n => types.tuple((instr.a..instr.a + n).map(|r| argument_type(&pass.ty(r))).collect()),
    };
    if let Some(yields) = pass.decl.yields.clone() {
        check_result(pass, pc, instr, &value, &yields.strip(), false)?;
    }
    pass.bind(pc, instr.c, &types.any())
}

/// A returned or yielded value must fit `target`; a single numeric value of
/// another kind is converted in place.
fn check_result(
    pass: &mut Pass<'_, '_, '_>,
    pc: usize,
    instr: Instruction,
    value: &Ty,
    target: &Ty,
    inferred: bool,
) -> Step {
    if target.is_dynamic() || value.hash() == target.hash() {
        return Ok(());
    }
    if instr.b == 1 && ((value.is_numeric() && target.is_numeric()) || !inferred) {
        let reg = pass.coerce(pc, instr.a, target)?;
        pass.instr_mut(pc).a = reg;
        return Ok(());
    }
    if match_type(value, target).is_match() {
        return Ok(());
    }
    let kind = if inferred {
        InferErrorKind::TypeNotConsistent
    } else {
        InferErrorKind::TypeNotMatching
    };
    Err(pass.fail_with(pc, kind, |d| d.mismatch(value.name(), target.name())))
}
