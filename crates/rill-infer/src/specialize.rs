//! Per-signature specialization of generic routines.
//!
//! A routine with `any` or type-variable parameters is cloned with the
//! concrete argument types of a call, inferred again under those types, and
//! cached on the generic routine keyed by the concrete parameter hashes.
//! A specialization that fails to type-check is not an error: it is cached
//! with the generic routine's code, which checks operands at run time.

use std::sync::Arc;

use rill_core::{Routine, RoutineFlags, Ty, TypeHash, TypeTable};

use crate::infer::Session;
use crate::matcher::Resolved;

/// Concrete parameter types for calling `routine` with `args`, or `None`
/// when the call would not narrow any parameter.
///
/// `args` are the call's argument types in call order; `resolved` supplies
/// type-variable bindings and the placement of named arguments.
pub fn concrete_params(routine: &Routine, resolved: &Resolved, args: &[Ty]) -> Option<Vec<Ty>> {
    let types = TypeTable::global();
    let decl = routine.decl();
    if routine.native().is_some() || decl.params.is_empty() {
        return None;
    }

    let mut by_slot: Vec<Option<Ty>> = vec![None; decl.params.len()];
    for (i, arg) in args.iter().enumerate() {
        let slot = match &resolved.order {
            Some(order) => order.get(i).copied().flatten(),
            None => (i < decl.params.len()).then_some(i),
        };
        if let Some(slot) = slot {
            by_slot[slot] = Some(arg.strip());
        }
    }

    let mut changed = false;
    let concrete: Vec<Ty> = decl
        .params
        .iter()
        .zip(by_slot)
        .map(|(param, arg)| {
            let declared = param.ty.strip();
            if !declared.is_generic() {
                return declared;
            }
            let bound = types.substitute(&declared, &resolved.bindings);
            let narrowed = if !bound.is_generic() {
                bound
            } else {
                match arg {
                    Some(arg) if !arg.is_generic() => arg,
                    _ => return declared,
                }
            };
            changed |= narrowed.hash() != declared.hash();
            narrowed
        })
        .collect();
    changed.then_some(concrete)
}

/// The routine to call for a resolved call: a cached or freshly compiled
/// specialization, or `resolved.routine` itself.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn specialize(session: &mut Session<'_>, resolved: &Resolved, args: &[Ty]) -> Arc<Routine> {
    let generic = &resolved.routine;
    let Some(params) = concrete_params(generic, resolved, args) else {
        return generic.clone();
    };
    let key: Vec<TypeHash> = params.iter().map(|t| t.hash()).collect();
    if let Some(existing) = generic.specialization(&key) {
        return existing;
    }
    let guard = (Arc::as_ptr(generic) as usize, key.clone());
    if !session.begin_specializing(guard.clone()) {
        // Specializing on itself further up the stack.
        return generic.clone();
    }

    let types = TypeTable::global();
    let mut decl = generic.decl().clone();
    if decl.register_types.len() < decl.register_count {
        decl.register_types.resize(decl.register_count, None);
    }
    for (i, (param, ty)) in decl.params.iter_mut().zip(&params).enumerate() {
        param.ty = types.rewrap(&param.ty, ty.clone());
        if let Some(slot) = decl.register_types.get_mut(i) {
            *slot = Some(ty.clone());
        }
    }
    decl.ret = decl.ret.take().and_then(|ret| {
        let ret = types.substitute(&ret, &resolved.bindings);
        (!ret.is_generic()).then_some(ret)
    });
    decl.flags |= RoutineFlags::SPECIALIZED;

    let candidate = Arc::new(Routine::new(decl, None, generic.enclosing_weak()));
    let compiled = session.silently(|s| s.compile(&candidate));
    session.end_specializing(&guard);

    match compiled {
        Ok(_) => {
            let winner = generic.insert_specialization(key, candidate);
            tracing::debug!(
                routine = %generic.name(),
                signature = %winner.signature(),
                "specialized routine"
            );
            winner
        }
        Err(err) => {
            tracing::trace!(routine = %generic.name(), error = %err, "specialization rejected");
            keep_generic_code(session, generic, key, candidate)
        }
    }
}

/// Cache a rejected specialization running the generic routine's code, so the
/// same signature is not inferred again on every call.
fn keep_generic_code(
    session: &mut Session<'_>,
    generic: &Arc<Routine>,
    key: Vec<TypeHash>,
    candidate: Arc<Routine>,
) -> Arc<Routine> {
    if session.in_progress(generic) {
        return generic.clone();
    }
    match session.compile(generic) {
        Ok(body) => {
            candidate.install_body(body);
            generic.insert_specialization(key, candidate)
        }
        Err(_) => generic.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::StaticEnv;
    use crate::matcher::resolve_routine;
    use rill_core::{OpCode, RoutineBuilder, TypeKind};

    fn twice() -> Arc<Routine> {
        let t = TypeTable::global();
        RoutineBuilder::new("twice")
            .param("x", t.any())
            .emit(OpCode::Add, 0, 0, 1)
            .emit(OpCode::Return, 1, 1, 0)
            .build()
    }

    #[test]
    fn concrete_arguments_narrow_any_parameters() {
        let t = TypeTable::global();
        let f = twice();
        let resolved = resolve_routine(&f, &[t.int()]).unwrap();
        let params = concrete_params(&f, &resolved, &[t.int()]).unwrap();
        assert_eq!(params[0].kind(), TypeKind::Int);
        let resolved = resolve_routine(&f, &[t.any()]).unwrap();
        assert!(concrete_params(&f, &resolved, &[t.any()]).is_none());
    }

    #[test]
    fn specializations_are_cached_per_signature() {
        let t = TypeTable::global();
        let env = StaticEnv::new();
        let mut session = Session::new(&env);
        let f = twice();

        let resolved = resolve_routine(&f, &[t.int()]).unwrap();
        let int_version = specialize(&mut session, &resolved, &[t.int()]);
        assert!(!Arc::ptr_eq(&int_version, &f));
        assert!(int_version.flags().contains(RoutineFlags::SPECIALIZED));
        assert_eq!(int_version.return_type().map(|r| r.kind()), Some(TypeKind::Int));
        let body = int_version.body().unwrap();
        assert_eq!(body.code[0].op(), OpCode::AddIII);

        let again = specialize(&mut session, &resolved, &[t.int()]);
        assert!(Arc::ptr_eq(&again, &int_version));

        let resolved = resolve_routine(&f, &[t.double()]).unwrap();
        let double_version = specialize(&mut session, &resolved, &[t.double()]);
        assert_eq!(double_version.body().unwrap().code[0].op(), OpCode::AddDDD);
        assert_eq!(f.specialization_count(), 2);
    }

    #[test]
    fn rejected_specialization_is_cached_with_generic_code() {
        let t = TypeTable::global();
        let first = RoutineBuilder::new("first")
            .param("x", t.any())
            .returns(t.any())
            .emit(OpCode::Data, 1, 0, 1)
            .emit(OpCode::GetItem, 0, 1, 2)
            .emit(OpCode::Return, 2, 1, 0)
            .build();
        let env = StaticEnv::new();
        let mut session = Session::new(&env);

        let args = [t.map(t.string(), t.int())];
        let resolved = resolve_routine(&first, &args).unwrap();
        let kept = specialize(&mut session, &resolved, &args);
        assert!(!Arc::ptr_eq(&kept, &first));
        assert_eq!(kept.body().unwrap().code[1].op(), OpCode::GetItem);
        assert_eq!(first.specialization_count(), 1);

        let again = specialize(&mut session, &resolved, &args);
        assert!(Arc::ptr_eq(&again, &kept));
        assert_eq!(first.specialization_count(), 1);
    }

    #[test]
    fn type_variables_follow_their_bindings() {
        let t = TypeTable::global();
        let var = t.type_param("T");
        let first = RoutineBuilder::new("first")
            .param("xs", t.list(var.clone()))
            .returns(var)
            .emit(OpCode::Data, 1, 0, 1)
            .emit(OpCode::GetItem, 0, 1, 2)
            .emit(OpCode::Return, 2, 1, 0)
            .build();
        let args = [t.list(t.string())];
        let resolved = resolve_routine(&first, &args).unwrap();
        let params = concrete_params(&first, &resolved, &args).unwrap();
        assert_eq!(params[0].name(), "list<string>");

        let env = StaticEnv::new();
        let mut session = Session::new(&env);
        let special = specialize(&mut session, &resolved, &args);
        assert_eq!(special.return_type().map(|r| r.kind()), Some(TypeKind::String));
        assert_eq!(special.body().unwrap().code[1].op(), OpCode::GetItemLSI);
    }
}
