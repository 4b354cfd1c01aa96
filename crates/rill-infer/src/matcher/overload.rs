//! Overload resolution.
//!
//! ## Algorithm
//!
//! 1. Calls without named arguments first consult the set's resolution
//!    cache, keyed by the argument signature hash and the call shape.
//! 2. Otherwise the parameter trie of the call shape is walked position by
//!    position; only branches whose parameter type accepts the argument are
//!    followed. Every candidate complete at the end of the walk, or
//!    variadic along it, is collected.
//! 3. Each collected candidate is scored in full (type variables bound
//!    consistently, defaults filled): its score is the weakest of its
//!    per-parameter match levels.
//! 4. The highest score wins; ties go to the earlier declaration.
//!
//! Named arguments bypass the trie: they are first placed by name, so every
//! candidate is scored on its own placement.
//!
//! Failure never panics or raises: each candidate is explained with the
//! first reason it rejected the call.

use std::sync::Arc;

use rill_core::{OverloadSet, RejectReason, Rejection, Routine, Ty, TypeHash, TypeKind};

use super::{Bindings, MatchLevel, match_type, match_type_with};

/// A successfully resolved call.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Position of the winner in its overload set.
    pub index: usize,
    pub routine: Arc<Routine>,
    pub level: MatchLevel,
    pub bindings: Bindings,
    /// Parameter slot of each argument, when named arguments were placed;
    /// `None` in a slot marks an extra variadic argument.
    pub order: Option<Vec<Option<usize>>>,
}

struct Score {
    level: MatchLevel,
    bindings: Bindings,
    order: Option<Vec<Option<usize>>>,
}

fn score(routine: &Routine, args: &[Ty]) -> Result<Score, RejectReason> {
    let decl = routine.decl();
    let params = &decl.params;
    let named = args.iter().any(|a| a.kind() == TypeKind::Named);

    let mut filled: Vec<Option<usize>> = vec![None; params.len()];
    let mut order: Vec<Option<usize>> = Vec::with_capacity(args.len());
    let mut extra = 0usize;
    for (i, arg) in args.iter().enumerate() {
        let slot = match (arg.kind(), arg.label()) {
            (TypeKind::Named, Some(name)) => match params.iter().position(|p| &*p.name == name) {
                Some(p) => Some(p),
                None if decl.variadic => None,
                None => return Err(RejectReason::WrongName(name.to_string())),
            },
            _ if i < params.len() => Some(i),
            _ if decl.variadic => None,
            _ => return Err(RejectReason::TooMany),
        };
        match slot {
            Some(p) if filled[p].is_some() => {
                return Err(RejectReason::WrongName(params[p].name.to_string()));
            }
            Some(p) => filled[p] = Some(i),
            None => extra += 1,
        }
        order.push(slot);
    }
    if params
        .iter()
        .zip(&filled)
        .any(|(p, f)| f.is_none() && p.default.is_none())
    {
        return Err(RejectReason::TooFew);
    }

    let mut bindings = Bindings::default();
    let mut level = MatchLevel::Equal;
    for (param, arg) in params.iter().zip(&filled) {
        let Some(arg) = arg else { continue };
        let arg_ty = args[*arg].strip();
        let l = match_type_with(&arg_ty, &param.ty, &mut bindings);
        if l == MatchLevel::NoMatch {
            return Err(RejectReason::WrongType {
                found: arg_ty.name().to_string(),
                expected: param.ty.name().to_string(),
            });
        }
        level = level.min(l);
    }
    if extra > 0 {
        level = level.min(MatchLevel::AnyWildcard);
    }
    Ok(Score {
        level,
        bindings,
        order: named.then_some(order),
    })
}

/// Candidate indices reachable in the trie for `args`.
fn trie_candidates(set: &OverloadSet, args: &[Ty], method_call: bool) -> Vec<usize> {
    let trie = set.trie(method_call);
    let mut out = Vec::new();
    let mut stack = vec![(0usize, 0usize)];
    while let Some((node, pos)) = stack.pop() {
        let n = trie.node(node);
        out.extend_from_slice(&n.variadic);
        if pos == args.len() {
            out.extend_from_slice(&n.complete);
            continue;
        }
        for (ty, child) in &n.edges {
            if match_type(&args[pos], ty).is_match() {
                stack.push((*child, pos + 1));
            }
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

/// Resolve a call against an overload set.
///
/// `method_call` selects the receiver-taking candidates; the receiver is
/// then `args[0]`.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn resolve_overload(
    set: &OverloadSet,
    args: &[Ty],
    method_call: bool,
) -> Result<Resolved, Vec<Rejection>> {
    let named = args.iter().any(|a| a.kind() == TypeKind::Named);
    let key = TypeHash::from_signature(&args.iter().map(|a| a.hash()).collect::<Vec<_>>());

    if !named {
        if let Some(index) = set.cached(method_call, key) {
            if let Some(routine) = set.routines().get(index) {
                if let Ok(s) = score(routine, args) {
                    return Ok(Resolved {
                        index,
                        routine: routine.clone(),
                        level: s.level,
                        bindings: s.bindings,
                        order: s.order,
                    });
                }
            }
        }
    }

    let candidates: Vec<usize> = if named {
        (0..set.routines().len())
            .filter(|&i| !method_call || is_method(&set.routines()[i]))
            .collect()
    } else {
        trie_candidates(set, args, method_call)
    };

    let mut best: Option<(usize, Score)> = None;
    for index in candidates {
        let Ok(s) = score(&set.routines()[index], args) else {
            continue;
        };
        if best.as_ref().is_none_or(|(_, b)| s.level > b.level) {
            best = Some((index, s));
        }
    }

    match best {
        Some((index, s)) => {
            if !named {
                set.remember(method_call, key, index);
            }
            Ok(Resolved {
                index,
                routine: set.routines()[index].clone(),
                level: s.level,
                bindings: s.bindings,
                order: s.order,
            })
        }
        None => {
            let routines: Vec<&Arc<Routine>> = set
                .routines()
                .iter()
                .filter(|r| !method_call || is_method(r))
                .collect();
            Err(explain_rejections(&routines, args))
        }
    }
}

/// Check a call against a single routine.
pub fn resolve_routine(routine: &Arc<Routine>, args: &[Ty]) -> Result<Resolved, Rejection> {
    match score(routine, args) {
        Ok(s) => Ok(Resolved {
            index: 0,
            routine: routine.clone(),
            level: s.level,
            bindings: s.bindings,
            order: s.order,
        }),
        Err(reason) => Err(rejection(routine, reason)),
    }
}

/// Why each routine rejects `args`.
pub fn explain_rejections(routines: &[&Arc<Routine>], args: &[Ty]) -> Vec<Rejection> {
    routines
        .iter()
        .filter_map(|r| score(r, args).err().map(|reason| rejection(r, reason)))
        .collect()
}

fn rejection(routine: &Routine, reason: RejectReason) -> Rejection {
    Rejection {
        signature: routine.signature_text(),
        def_line: routine.decl().def_line,
        file: routine.decl().file.clone(),
        reason,
    }
}

fn is_method(routine: &Routine) -> bool {
    routine.flags().contains(rill_core::RoutineFlags::METHOD)
}
