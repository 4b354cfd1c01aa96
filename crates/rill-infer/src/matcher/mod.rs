//! Structural type compatibility and overload resolution.
//!
//! [`match_type`] ranks how well a value of the source type fits a slot of
//! the target type. The ranking drives both static checks during inference
//! and overload selection at run time:
//!
//! | level | meaning |
//! |---|---|
//! | `Equal` | identical shapes |
//! | `Subtype` | numeric widening, subclass to base class |
//! | `AnyWildcard` | target is `any`, a type variable, or var-args |
//! | `Relaxed` | only checkable at run time: dynamic source, numeric narrowing |
//! | `NoMatch` | never compatible |
//!
//! Containers match element-wise and take the weakest component level.
//! Numeric elements are invariant: `list<int>` does not fit `list<double>`,
//! since the list object itself would have to change.

mod overload;

pub use overload::{Resolved, explain_rejections, resolve_overload, resolve_routine};

use std::sync::Arc;

use rill_core::{Heap, Ty, TypeKind, Value};
use rustc_hash::FxHashMap;

/// How well a source type fits a target type; ordered weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchLevel {
    NoMatch,
    Relaxed,
    AnyWildcard,
    Subtype,
    Equal,
}

impl MatchLevel {
    #[inline]
    pub fn is_match(self) -> bool {
        self != MatchLevel::NoMatch
    }
}

/// Type variable bindings established while matching.
pub type Bindings = FxHashMap<Arc<str>, Ty>;

/// Rank `source` against `target` without recording type variable bindings.
pub fn match_type(source: &Ty, target: &Ty) -> MatchLevel {
    let mut bindings = Bindings::default();
    match_type_with(source, target, &mut bindings)
}

/// Rank `source` against `target`, binding free type variables of `target`.
///
/// A variable already bound must be matched consistently.
pub fn match_type_with(source: &Ty, target: &Ty, bindings: &mut Bindings) -> MatchLevel {
    if source.hash() == target.hash() {
        return MatchLevel::Equal;
    }
    if target.kind().is_parameter_wrapper() || source.kind().is_parameter_wrapper() {
        return match_type_with(&source.strip(), &target.strip(), bindings);
    }

    match target.kind() {
        TypeKind::TypeParam => {
            let Some(name) = target.label() else {
                return MatchLevel::AnyWildcard;
            };
            if let Some(bound) = bindings.get(name).cloned() {
                return match_type_with(source, &bound, bindings).min(MatchLevel::AnyWildcard);
            }
            if !source.is_dynamic() {
                bindings.insert(Arc::from(name), source.clone());
            }
            return MatchLevel::AnyWildcard;
        }
        TypeKind::Any | TypeKind::Undefined | TypeKind::VarArgs => return MatchLevel::AnyWildcard,
        _ => {}
    }

    match source.kind() {
        TypeKind::Any | TypeKind::Undefined | TypeKind::TypeParam => return MatchLevel::Relaxed,
        _ => {}
    }

    match (source.kind(), target.kind()) {
        (s, t) if s.is_numeric() && t.is_numeric() => {
            if s.numeric_rank() < t.numeric_rank() {
                MatchLevel::Subtype
            } else {
                MatchLevel::Relaxed
            }
        }
        (s, TypeKind::Complex) if s.is_numeric() => MatchLevel::Subtype,
        (TypeKind::Enum, TypeKind::Int) => MatchLevel::Relaxed,
        (TypeKind::None, TypeKind::Object | TypeKind::CData | TypeKind::Routine) => {
            MatchLevel::Relaxed
        }
        (TypeKind::Object, TypeKind::Object) | (TypeKind::Exception, TypeKind::Exception) => {
            if source.derives_from(target) {
                MatchLevel::Subtype
            } else {
                MatchLevel::NoMatch
            }
        }
        (TypeKind::List, TypeKind::List)
        | (TypeKind::Array, TypeKind::Array)
        | (TypeKind::Map, TypeKind::Map)
        | (TypeKind::Process, TypeKind::Process) => {
            match_components(source.params(), target.params(), bindings)
        }
        (TypeKind::Tuple, TypeKind::Tuple) => {
            if source.params().len() != target.params().len() {
                return MatchLevel::NoMatch;
            }
            let names_agree = source.params().iter().zip(target.params()).all(|(s, t)| {
                match (s.kind(), t.kind()) {
                    (TypeKind::Named, TypeKind::Named) => s.label() == t.label(),
                    _ => true,
                }
            });
            if !names_agree {
                return MatchLevel::NoMatch;
            }
            match_components(source.params(), target.params(), bindings)
        }
        (TypeKind::Routine, TypeKind::Routine) => match_routine_types(source, target, bindings),
        _ => MatchLevel::NoMatch,
    }
}

fn match_components(source: &[Ty], target: &[Ty], bindings: &mut Bindings) -> MatchLevel {
    if source.len() != target.len() {
        return MatchLevel::NoMatch;
    }
    let mut level = MatchLevel::Equal;
    for (s, t) in source.iter().zip(target) {
        let (s, t) = (s.strip(), t.strip());
        if s.is_numeric() && t.is_numeric() && s.kind() != t.kind() {
            return MatchLevel::NoMatch;
        }
        level = level.min(match_type_with(&s, &t, bindings));
        if level == MatchLevel::NoMatch {
            break;
        }
    }
    level
}

/// Routine types: same arity, parameters contravariant, return covariant.
fn match_routine_types(source: &Ty, target: &Ty, bindings: &mut Bindings) -> MatchLevel {
    let (sp, tp) = (source.params(), target.params());
    if sp.len() != tp.len() {
        return MatchLevel::NoMatch;
    }
    let mut level = MatchLevel::Equal;
    for (s, t) in sp.iter().zip(tp) {
        level = level.min(match_type_with(&t.strip(), &s.strip(), bindings));
    }
    match (source.ret(), target.ret()) {
        (Some(sr), Some(tr)) => level.min(match_type_with(sr, tr, bindings)),
        _ => level.min(MatchLevel::Relaxed),
    }
}

/// Rank a run-time value against `target`.
pub fn match_value(heap: &Heap, value: &Value, target: &Ty) -> MatchLevel {
    match (value, target.strip().kind()) {
        (_, TypeKind::Any | TypeKind::Undefined | TypeKind::VarArgs | TypeKind::TypeParam) => {
            MatchLevel::AnyWildcard
        }
        (Value::None, TypeKind::None) => MatchLevel::Equal,
        _ => match_type(&heap.type_of(value), target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{ClassId, TypeTable};

    #[test]
    fn scalar_ranking() {
        let t = TypeTable::global();
        assert_eq!(match_type(&t.int(), &t.int()), MatchLevel::Equal);
        assert_eq!(match_type(&t.int(), &t.double()), MatchLevel::Subtype);
        assert_eq!(match_type(&t.double(), &t.int()), MatchLevel::Relaxed);
        assert_eq!(match_type(&t.string(), &t.any()), MatchLevel::AnyWildcard);
        assert_eq!(match_type(&t.any(), &t.string()), MatchLevel::Relaxed);
        assert_eq!(match_type(&t.string(), &t.int()), MatchLevel::NoMatch);
        assert!(MatchLevel::Equal > MatchLevel::Subtype);
        assert!(MatchLevel::Relaxed > MatchLevel::NoMatch);
    }

    #[test]
    fn containers_match_element_wise() {
        let t = TypeTable::global();
        let li = t.list(t.int());
        assert_eq!(match_type(&li, &t.list(t.any())), MatchLevel::AnyWildcard);
        assert_eq!(match_type(&li, &t.list(t.double())), MatchLevel::NoMatch);
        assert_eq!(match_type(&t.list(t.any()), &li), MatchLevel::Relaxed);
        let m = t.map(t.string(), t.int());
        assert_eq!(match_type(&m, &t.map(t.string(), t.int())), MatchLevel::Equal);
        assert_eq!(match_type(&m, &li), MatchLevel::NoMatch);
    }

    #[test]
    fn type_variables_bind_consistently() {
        let t = TypeTable::global();
        let var = t.type_param("T");
        let target = t.map(var.clone(), var.clone());
        let mut b = Bindings::default();
        assert_eq!(
            match_type_with(&t.map(t.int(), t.int()), &target, &mut b),
            MatchLevel::AnyWildcard
        );
        assert_eq!(b.get("T").map(|ty| ty.name().to_string()), Some("int".into()));
        let mut b = Bindings::default();
        assert_eq!(
            match_type_with(&t.map(t.int(), t.string()), &target, &mut b),
            MatchLevel::NoMatch
        );
    }

    #[test]
    fn parameter_wrappers_are_transparent() {
        let t = TypeTable::global();
        assert_eq!(match_type(&t.int(), &t.named("x", t.int())), MatchLevel::Equal);
        assert_eq!(
            match_type(&t.named("x", t.int()), &t.defaulted("x", t.double())),
            MatchLevel::Subtype
        );
    }

    #[test]
    fn subclass_fits_base() {
        let t = TypeTable::global();
        let base = t.object(ClassId(300), "Shape", None);
        let derived = t.object(ClassId(301), "Circle", Some(&base));
        assert_eq!(match_type(&derived, &base), MatchLevel::Subtype);
        assert_eq!(match_type(&base, &derived), MatchLevel::NoMatch);
    }

    #[test]
    fn values_match_by_runtime_type() {
        let t = TypeTable::global();
        let mut heap = Heap::new();
        let list = heap.new_list(t.list(t.int()), vec![Value::Int(1)]);
        assert_eq!(match_value(&heap, &list, &t.list(t.int())), MatchLevel::Equal);
        assert_eq!(match_value(&heap, &Value::Int(1), &t.string()), MatchLevel::NoMatch);
        assert_eq!(match_value(&heap, &Value::None, &t.any()), MatchLevel::AnyWildcard);
    }
}
