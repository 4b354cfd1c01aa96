//! The program registry: namespaces with global slots, named routines and
//! classes.
//!
//! A [`Program`] is assembled by a front end (or by the host directly) and
//! then shared, read-only, with every [`Vm`](crate::vm::Vm) that runs it. It
//! is also the [`InferEnv`] inference resolves globals and classes against.

use std::sync::Arc;

use rill_core::{
    ClassDef, ClassId, CompiledBody, Constant, Diagnostics, EngineProperties, EngineProperty,
    InferError, NativeFn, OverloadSet, RegistrationError, Routine, RoutineBuilder, Ty,
};
use rill_infer::{GlobalInfo, InferEnv, InferOptions, infer_routine};
use rustc_hash::FxHashMap;

use crate::error::RillError;

/// Index of the namespace every program starts with.
pub const MAIN_NAMESPACE: usize = 0;

/// A declared global variable or constant.
#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub name: Arc<str>,
    pub ty: Ty,
    /// Value the slot holds before any code runs.
    pub initial: Constant,
    pub constant: bool,
}

#[derive(Debug, Default)]
pub struct Namespace {
    pub name: Arc<str>,
    globals: Vec<GlobalDef>,
    by_name: FxHashMap<Arc<str>, usize>,
}

impl Namespace {
    fn new(name: &str) -> Self {
        Namespace {
            name: Arc::from(name),
            ..Default::default()
        }
    }

    pub fn globals(&self) -> &[GlobalDef] {
        &self.globals
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

/// Everything a script can refer to by name.
#[derive(Debug)]
pub struct Program {
    properties: EngineProperties,
    namespaces: Vec<Namespace>,
    routines: FxHashMap<Arc<str>, Arc<OverloadSet>>,
    classes: FxHashMap<ClassId, Arc<ClassDef>>,
    class_names: FxHashMap<Arc<str>, ClassId>,
}

impl Default for Program {
    fn default() -> Self {
        Program::new()
    }
}

impl Program {
    pub fn new() -> Self {
        Program {
            properties: EngineProperties::new(),
            namespaces: vec![Namespace::new("main")],
            routines: FxHashMap::default(),
            classes: FxHashMap::default(),
            class_names: FxHashMap::default(),
        }
    }

    pub fn with_properties(mut self, properties: EngineProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn set_property(&mut self, property: EngineProperty, value: usize) {
        self.properties.set(property, value);
    }

    pub fn properties(&self) -> &EngineProperties {
        &self.properties
    }

    // ========================================================================
    // Namespaces and globals
    // ========================================================================

    pub fn add_namespace(&mut self, name: &str) -> usize {
        self.namespaces.push(Namespace::new(name));
        self.namespaces.len() - 1
    }

    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    pub fn namespace(&self, index: usize) -> Option<&Namespace> {
        self.namespaces.get(index)
    }

    /// Declare a mutable global; returns its slot.
    pub fn define_global(
        &mut self,
        namespace: usize,
        name: &str,
        ty: Ty,
        initial: Constant,
    ) -> Result<usize, RegistrationError> {
        self.push_global(namespace, name, ty, initial, false)
    }

    /// Declare a global constant; its type is the type of `value`.
    pub fn define_constant(
        &mut self,
        namespace: usize,
        name: &str,
        value: Constant,
    ) -> Result<usize, RegistrationError> {
        let ty = value.type_of();
        self.push_global(namespace, name, ty, value, true)
    }

    fn push_global(
        &mut self,
        namespace: usize,
        name: &str,
        ty: Ty,
        initial: Constant,
        constant: bool,
    ) -> Result<usize, RegistrationError> {
        let ns = self
            .namespaces
            .get_mut(namespace)
            .ok_or(RegistrationError::UnknownNamespace(namespace))?;
        if ns.by_name.contains_key(name) {
            return Err(RegistrationError::DuplicateRegistration {
                name: name.to_string(),
                kind: "global",
            });
        }
        let slot = ns.globals.len();
        let name: Arc<str> = Arc::from(name);
        ns.by_name.insert(name.clone(), slot);
        ns.globals.push(GlobalDef {
            name,
            ty,
            initial,
            constant,
        });
        Ok(slot)
    }

    pub fn global_def(&self, namespace: usize, slot: usize) -> Option<&GlobalDef> {
        self.namespaces.get(namespace)?.globals.get(slot)
    }

    // ========================================================================
    // Routines
    // ========================================================================

    /// Add `routine` to the overload set of its name; returns the updated set.
    ///
    /// Sets are immutable, so code compiled against the previous set keeps
    /// resolving against it.
    pub fn add_routine(&mut self, routine: Arc<Routine>) -> Result<Arc<OverloadSet>, RegistrationError> {
        let name: Arc<str> = Arc::from(routine.name());
        let set = match self.routines.get(&name) {
            Some(existing) => {
                let text = routine.signature_text();
                if existing.routines().iter().any(|r| r.signature_text() == text) {
                    return Err(RegistrationError::DuplicateRegistration {
                        name: text,
                        kind: "routine",
                    });
                }
                Arc::new(existing.with(routine))
            }
            None => Arc::new(OverloadSet::new(name.clone(), vec![routine])),
        };
        tracing::trace!(name = %name, overloads = set.routines().len(), "registered routine");
        self.routines.insert(name, set.clone());
        Ok(set)
    }

    /// Register a host function under the signature described by `decl`.
    pub fn add_native(
        &mut self,
        decl: RoutineBuilder,
        f: NativeFn,
    ) -> Result<Arc<OverloadSet>, RegistrationError> {
        self.add_routine(decl.build_native(f))
    }

    pub fn routines(&self, name: &str) -> Option<&Arc<OverloadSet>> {
        self.routines.get(name)
    }

    // ========================================================================
    // Classes
    // ========================================================================

    pub fn add_class(&mut self, class: Arc<ClassDef>) -> Result<(), RegistrationError> {
        if self.classes.contains_key(&class.id) {
            return Err(RegistrationError::DuplicateClass(class.id.0));
        }
        if self.class_names.contains_key(&class.name) {
            return Err(RegistrationError::DuplicateRegistration {
                name: class.name.to_string(),
                kind: "class",
            });
        }
        self.class_names.insert(class.name.clone(), class.id);
        self.classes.insert(class.id, class);
        Ok(())
    }

    pub fn class(&self, id: ClassId) -> Option<&Arc<ClassDef>> {
        self.classes.get(&id)
    }

    pub fn class_named(&self, name: &str) -> Option<&Arc<ClassDef>> {
        self.class_names.get(name).and_then(|id| self.classes.get(id))
    }

    // ========================================================================
    // Compilation
    // ========================================================================

    /// Infer and specialize `routine` against this program.
    pub fn compile(&self, routine: &Arc<Routine>) -> Result<Arc<CompiledBody>, InferError> {
        infer_routine(routine, self)
    }

    /// Compile every registered script routine and class method, collecting
    /// a diagnostic per routine that fails.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn compile_all(&self) -> Result<(), RillError> {
        let mut diagnostics = Diagnostics::new();
        let mut names: Vec<&Arc<str>> = self.routines.keys().collect();
        names.sort();
        let free = names.into_iter().flat_map(|n| self.routines[n].routines().iter());

        let mut ids: Vec<&ClassId> = self.classes.keys().collect();
        ids.sort_by_key(|id| id.0);
        let methods = ids.into_iter().flat_map(|id| {
            let class = &self.classes[id];
            let mut sets: Vec<&Arc<OverloadSet>> = class.methods.values().collect();
            sets.sort_by(|a, b| a.name().cmp(b.name()));
            sets.into_iter()
                .chain(class.constructors.iter())
                .flat_map(|s| s.routines().iter())
                .collect::<Vec<_>>()
        });

        for routine in free.chain(methods) {
            if routine.native().is_some() || routine.is_compiled() {
                continue;
            }
            match self.compile(routine) {
                Ok(_) => {}
                Err(InferError::Typing(d)) => diagnostics.push(*d),
                Err(err) => return Err(err.into()),
            }
        }
        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(RillError::Compile(diagnostics))
        }
    }
}

impl InferEnv for Program {
    fn global(&self, namespace: usize, slot: usize) -> Option<GlobalInfo> {
        let def = self.global_def(namespace, slot)?;
        Some(GlobalInfo {
            ty: def.ty.clone(),
            value: def.constant.then(|| def.initial.clone()),
        })
    }

    fn class(&self, id: ClassId) -> Option<Arc<ClassDef>> {
        self.classes.get(&id).cloned()
    }

    fn options(&self) -> InferOptions {
        InferOptions::from(&self.properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{ClassBuilder, OpCode, TypeTable};

    fn add(ty: Ty) -> Arc<Routine> {
        RoutineBuilder::new("add")
            .param("a", ty.clone())
            .param("b", ty)
            .emit(OpCode::Add, 0, 1, 2)
            .emit(OpCode::Return, 2, 1, 0)
            .build()
    }

    #[test]
    fn routines_accumulate_into_overload_sets() {
        let t = TypeTable::global();
        let mut program = Program::new();
        program.add_routine(add(t.int())).unwrap();
        let set = program.add_routine(add(t.string())).unwrap();
        assert_eq!(set.routines().len(), 2);
        assert!(matches!(
            program.add_routine(add(t.int())),
            Err(RegistrationError::DuplicateRegistration { kind: "routine", .. })
        ));
        assert_eq!(program.routines("add").map(|s| s.routines().len()), Some(2));
    }

    #[test]
    fn globals_are_slotted_per_namespace() {
        let t = TypeTable::global();
        let mut program = Program::new();
        let ns = program.add_namespace("math");
        assert_eq!(program.define_global(ns, "count", t.int(), Constant::Int(0)), Ok(0));
        assert_eq!(program.define_constant(ns, "PI", Constant::Double(3.14)), Ok(1));
        assert_eq!(program.namespace(ns).and_then(|n| n.slot("PI")), Some(1));
        assert_eq!(
            program.define_global(9, "x", t.int(), Constant::Int(0)),
            Err(RegistrationError::UnknownNamespace(9))
        );

        let info = program.global(ns, 1).unwrap();
        assert_eq!(info.ty.kind(), rill_core::TypeKind::Double);
        assert!(info.value.is_some());
        assert!(program.global(ns, 0).unwrap().value.is_none());
    }

    #[test]
    fn class_ids_and_names_are_unique() {
        let mut program = Program::new();
        program.add_class(ClassBuilder::new(ClassId(1), "A", None).build()).unwrap();
        assert_eq!(
            program.add_class(ClassBuilder::new(ClassId(1), "B", None).build()),
            Err(RegistrationError::DuplicateClass(1))
        );
        assert!(program.add_class(ClassBuilder::new(ClassId(2), "A", None).build()).is_err());
        assert_eq!(program.class_named("A").map(|c| c.id), Some(ClassId(1)));
    }

    #[test]
    fn compile_all_collects_diagnostics() {
        let t = TypeTable::global();
        let mut program = Program::new();
        program.add_routine(add(t.int())).unwrap();
        program
            .add_routine(
                RoutineBuilder::new("broken")
                    .param("a", t.string())
                    .emit(OpCode::Neg, 0, 0, 1)
                    .emit(OpCode::Return, 1, 1, 0)
                    .build(),
            )
            .unwrap();
        let Err(RillError::Compile(diagnostics)) = program.compile_all() else {
            panic!("expected a compile failure");
        };
        assert_eq!(diagnostics.len(), 1);
        assert!(program.routines("add").unwrap().routines()[0].is_compiled());
    }
}
