//! Class layout service.
//!
//! Classes are deliberately thin: an ordered instance-field table (inherited
//! fields first, so a parent's slot indices stay valid in every subclass),
//! named constants, method overload sets, and an override table used for
//! virtual dispatch. Instances refer to their class by [`ClassId`], never by a
//! counted pointer.

use std::sync::Arc;

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use super::{OverloadSet, Routine};
use crate::bytecode::Constant;
use crate::types::{ClassId, Ty, TypeTable};
use crate::TypeHash;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FieldFlags: u8 {
        const PROTECTED = 1 << 0;
        const PRIVATE = 1 << 1;
        const CONST = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: Arc<str>,
    pub ty: Ty,
    pub flags: FieldFlags,
    pub default: Constant,
    /// Class that declared the field.
    pub owner: ClassId,
}

#[derive(Debug)]
pub struct ClassDef {
    pub id: ClassId,
    pub name: Arc<str>,
    /// Type of the class value itself.
    pub class_type: Ty,
    /// Type of its instances.
    pub object_type: Ty,
    pub parent: Option<Arc<ClassDef>>,
    pub fields: Vec<FieldDef>,
    pub constants: Vec<(Arc<str>, Constant)>,
    pub methods: FxHashMap<Arc<str>, Arc<OverloadSet>>,
    pub constructors: Option<Arc<OverloadSet>>,
    /// Routine identity → most derived implementation.
    pub overrides: FxHashMap<TypeHash, Arc<Routine>>,
}

impl ClassDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| &*f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| &*f.name == name)
    }

    pub fn constant(&self, name: &str) -> Option<&Constant> {
        self.constants
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, c)| c)
    }

    pub fn method(&self, name: &str) -> Option<&Arc<OverloadSet>> {
        self.methods.get(name)
    }

    /// `self` is `ancestor` or derives from it.
    pub fn is_a(&self, ancestor: ClassId) -> bool {
        if self.id == ancestor {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_a(ancestor))
    }

    /// The implementation of `routine` that instances of this class run.
    pub fn resolve_virtual(&self, routine: &Arc<Routine>) -> Arc<Routine> {
        self.overrides
            .get(&routine.identity())
            .cloned()
            .unwrap_or_else(|| routine.clone())
    }

    /// Whether code hosted in class `from` may access `field`.
    pub fn field_accessible(&self, field: &FieldDef, from: Option<ClassId>) -> bool {
        if field.flags.contains(FieldFlags::PRIVATE) {
            return from == Some(field.owner);
        }
        if field.flags.contains(FieldFlags::PROTECTED) {
            return from.is_some_and(|c| c == self.id || self.is_a(c) || c == field.owner);
        }
        true
    }
}

/// Assembles a [`ClassDef`].
pub struct ClassBuilder {
    id: ClassId,
    name: Arc<str>,
    parent: Option<Arc<ClassDef>>,
    class_type: Ty,
    object_type: Ty,
    fields: Vec<FieldDef>,
    constants: Vec<(Arc<str>, Constant)>,
    methods: Vec<Arc<Routine>>,
    constructors: Vec<Arc<Routine>>,
}

impl ClassBuilder {
    pub fn new(id: ClassId, name: &str, parent: Option<&Arc<ClassDef>>) -> Self {
        let types = TypeTable::global();
        let object_type = types.object(id, name, parent.map(|p| &p.object_type));
        ClassBuilder {
            id,
            name: Arc::from(name),
            parent: parent.cloned(),
            class_type: types.class(id, name),
            object_type,
            fields: parent.map(|p| p.fields.clone()).unwrap_or_default(),
            constants: parent.map(|p| p.constants.clone()).unwrap_or_default(),
            methods: Vec::new(),
            constructors: Vec::new(),
        }
    }

    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Instance type, for declaring method receivers.
    pub fn object_type(&self) -> Ty {
        self.object_type.clone()
    }

    pub fn field(self, name: &str, ty: Ty, default: Constant) -> Self {
        self.field_with(name, ty, default, FieldFlags::empty())
    }

    pub fn field_with(mut self, name: &str, ty: Ty, default: Constant, flags: FieldFlags) -> Self {
        self.fields.push(FieldDef {
            name: Arc::from(name),
            ty,
            flags,
            default,
            owner: self.id,
        });
        self
    }

    pub fn constant(mut self, name: &str, value: Constant) -> Self {
        self.constants.push((Arc::from(name), value));
        self
    }

    pub fn method(mut self, routine: Arc<Routine>) -> Self {
        self.methods.push(routine);
        self
    }

    pub fn constructor(mut self, routine: Arc<Routine>) -> Self {
        self.constructors.push(routine);
        self
    }

    pub fn build(self) -> Arc<ClassDef> {
        let mut overrides: FxHashMap<TypeHash, Arc<Routine>> = self
            .parent
            .as_ref()
            .map(|p| p.overrides.clone())
            .unwrap_or_default();
        for m in &self.methods {
            overrides.insert(m.identity(), m.clone());
        }

        let mut by_name: Vec<(Arc<str>, Vec<Arc<Routine>>)> = Vec::new();
        for m in &self.methods {
            let name: Arc<str> = Arc::from(m.name());
            match by_name.iter_mut().find(|(n, _)| *n == name) {
                Some((_, list)) => list.push(m.clone()),
                None => by_name.push((name, vec![m.clone()])),
            }
        }
        let mut methods: FxHashMap<Arc<str>, Arc<OverloadSet>> = FxHashMap::default();
        if let Some(parent) = &self.parent {
            for (name, set) in &parent.methods {
                if !by_name.iter().any(|(n, _)| n == name) {
                    methods.insert(name.clone(), set.clone());
                }
            }
        }
        for (name, mut own) in by_name {
            if let Some(inherited) = self.parent.as_ref().and_then(|p| p.methods.get(&name)) {
                for r in inherited.routines() {
                    if !own.iter().any(|o| o.identity() == r.identity()) {
                        own.push(r.clone());
                    }
                }
            }
            methods.insert(name.clone(), Arc::new(OverloadSet::new(name, own)));
        }

        let constructors = (!self.constructors.is_empty())
            .then(|| Arc::new(OverloadSet::new(self.name.clone(), self.constructors)));

        Arc::new(ClassDef {
            id: self.id,
            name: self.name,
            class_type: self.class_type,
            object_type: self.object_type,
            parent: self.parent,
            fields: self.fields,
            constants: self.constants,
            methods,
            constructors,
            overrides,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::{RoutineBuilder, RoutineFlags};

    fn speak(class: &ClassBuilder) -> Arc<Routine> {
        let types = TypeTable::global();
        RoutineBuilder::new("speak")
            .param("self", class.object_type())
            .host(class.id())
            .flags(RoutineFlags::VIRTUAL)
            .returns(types.string())
            .build()
    }

    #[test]
    fn inherited_fields_keep_slots() {
        let types = TypeTable::global();
        let base = ClassBuilder::new(ClassId(70), "Base", None)
            .field("a", types.int(), Constant::Int(0))
            .build();
        let derived = ClassBuilder::new(ClassId(71), "Derived", Some(&base))
            .field("b", types.string(), Constant::string(""))
            .build();
        assert_eq!(derived.field_index("a"), Some(0));
        assert_eq!(derived.field_index("b"), Some(1));
        assert!(derived.is_a(ClassId(70)));
        assert!(!base.is_a(ClassId(71)));
    }

    #[test]
    fn override_table_prefers_derived() {
        let base_b = ClassBuilder::new(ClassId(72), "Animal", None);
        let base_speak = speak(&base_b);
        let base = base_b.method(base_speak.clone()).build();
        let dog_b = ClassBuilder::new(ClassId(73), "Dog", Some(&base));
        let dog_speak = speak(&dog_b);
        let dog = dog_b.method(dog_speak.clone()).build();

        assert!(Arc::ptr_eq(&dog.resolve_virtual(&base_speak), &dog_speak));
        assert!(Arc::ptr_eq(&base.resolve_virtual(&base_speak), &base_speak));
        assert_eq!(dog.method("speak").map(|s| s.routines().len()), Some(1));
    }

    #[test]
    fn private_fields_need_owner() {
        let types = TypeTable::global();
        let class = ClassBuilder::new(ClassId(74), "Secret", None)
            .field_with("k", types.int(), Constant::Int(1), FieldFlags::PRIVATE)
            .build();
        let field = class.field("k").unwrap();
        assert!(!class.field_accessible(field, None));
        assert!(class.field_accessible(field, Some(ClassId(74))));
    }
}
