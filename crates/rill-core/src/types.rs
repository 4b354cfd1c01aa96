//! Interned structural types.
//!
//! A [`Type`] is immutable once created. Every type is built through the
//! process-wide [`TypeTable`], which keys types by their structural
//! [`TypeHash`]; building the same shape twice hands back the same `Arc`.
//! Binding a generic type's free parameters goes through
//! [`TypeTable::substitute`], which produces a *new* interned type and never
//! touches the shared original.
//!
//! Parameter and tuple-field names are part of the shape: a routine parameter
//! `x:int` is a [`TypeKind::Named`] wrapper around `int`, a defaulted one is a
//! [`TypeKind::Default`] wrapper, and a trailing `...` is [`TypeKind::VarArgs`].

use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use rustc_hash::FxHashMap;

use crate::TypeHash;

/// Identifies a class registered with a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind tag of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TypeKind {
    /// Not yet known; the placeholder of inference.
    Undefined = 0,
    Any,
    None,
    Int,
    Float,
    Double,
    Complex,
    String,
    Enum,
    List,
    Map,
    Array,
    Tuple,
    Routine,
    /// The class itself, as a value (constructor and static member access).
    Class,
    /// An instance of a class.
    Object,
    CData,
    Process,
    Exception,
    /// A free type variable `@T`.
    TypeParam,
    /// `name:T` parameter or tuple field.
    Named,
    /// `name=T` parameter with a default value.
    Default,
    /// Trailing `...` parameter.
    VarArgs,
}

impl TypeKind {
    #[inline]
    pub fn is_numeric(self) -> bool {
        matches!(self, TypeKind::Int | TypeKind::Float | TypeKind::Double)
    }

    /// Values of these kinds never live on the heap.
    #[inline]
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            TypeKind::None
                | TypeKind::Int
                | TypeKind::Float
                | TypeKind::Double
                | TypeKind::Complex
                | TypeKind::Enum
        )
    }

    /// Numeric promotion rank: int < float < double.
    #[inline]
    pub fn numeric_rank(self) -> Option<u8> {
        match self {
            TypeKind::Int => Some(0),
            TypeKind::Float => Some(1),
            TypeKind::Double => Some(2),
            _ => None,
        }
    }

    pub fn from_rank(rank: u8) -> TypeKind {
        match rank {
            0 => TypeKind::Int,
            1 => TypeKind::Float,
            _ => TypeKind::Double,
        }
    }

    #[inline]
    pub fn is_parameter_wrapper(self) -> bool {
        matches!(self, TypeKind::Named | TypeKind::Default)
    }
}

/// An immutable, interned type.
pub struct Type {
    kind: TypeKind,
    name: Arc<str>,
    label: Option<Arc<str>>,
    params: Vec<Ty>,
    ret: Option<Ty>,
    class: Option<ClassId>,
    bases: Vec<Ty>,
    symbols: Vec<(Arc<str>, i64)>,
    hash: TypeHash,
}

/// Shared handle to an interned type.
pub type Ty = Arc<Type>;

impl Type {
    #[inline]
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Rendered name, e.g. `map<string,int>`.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifying label: parameter/field name, class or enum name, type variable name.
    #[inline]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Component types: element, key/value, tuple items, routine parameters.
    #[inline]
    pub fn params(&self) -> &[Ty] {
        &self.params
    }

    /// Return type of a routine type.
    #[inline]
    pub fn ret(&self) -> Option<&Ty> {
        self.ret.as_ref()
    }

    #[inline]
    pub fn class_id(&self) -> Option<ClassId> {
        self.class
    }

    /// Ancestor types of an object or exception type, nearest first.
    #[inline]
    pub fn bases(&self) -> &[Ty] {
        &self.bases
    }

    /// Symbols of an enum type.
    #[inline]
    pub fn symbols(&self) -> &[(Arc<str>, i64)] {
        &self.symbols
    }

    #[inline]
    pub fn hash(&self) -> TypeHash {
        self.hash
    }

    #[inline]
    pub fn is_numeric(&self) -> bool {
        self.kind.is_numeric()
    }

    /// Any or not yet known: checks are deferred to run time.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, TypeKind::Any | TypeKind::Undefined)
    }

    /// The wrapped type of a `name:T` / `name=T` wrapper, or `self`.
    pub fn strip(self: &Arc<Self>) -> Ty {
        if self.kind.is_parameter_wrapper() {
            if let Some(inner) = self.params.first() {
                return inner.strip();
            }
        }
        self.clone()
    }

    /// Element type of a list or array.
    pub fn element(&self) -> Option<&Ty> {
        match self.kind {
            TypeKind::List | TypeKind::Array | TypeKind::Process => self.params.first(),
            _ => None,
        }
    }

    /// Key and value types of a map.
    pub fn key_value(&self) -> Option<(&Ty, &Ty)> {
        match (self.kind, self.params.as_slice()) {
            (TypeKind::Map, [k, v]) => Some((k, v)),
            _ => None,
        }
    }

    /// Index of a named tuple field.
    pub fn field_index(&self, field: &str) -> Option<usize> {
        if self.kind != TypeKind::Tuple {
            return None;
        }
        self.params
            .iter()
            .position(|item| item.kind == TypeKind::Named && item.label() == Some(field))
    }

    /// Whether a free variable, `any`, or an unknown type appears anywhere in the shape.
    pub fn is_generic(&self) -> bool {
        match self.kind {
            TypeKind::Any | TypeKind::Undefined | TypeKind::TypeParam => true,
            _ => {
                self.params.iter().any(|p| p.is_generic())
                    || self.ret.as_ref().is_some_and(|r| r.is_generic())
            }
        }
    }

    /// Whether the class or exception `ancestor` appears in this type's base chain.
    pub fn derives_from(&self, ancestor: &Type) -> bool {
        self.bases.iter().any(|b| b.hash == ancestor.hash)
    }

    /// Symbol name of an enum value.
    pub fn symbol_of(&self, value: i64) -> Option<&str> {
        self.symbols
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(s, _)| s.as_ref())
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Type {}

impl std::hash::Hash for Type {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({})", self.name)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ============================================================================
// Type table
// ============================================================================

static GLOBAL_TABLE: LazyLock<TypeTable> = LazyLock::new(TypeTable::new);

/// Shape-keyed interning table.
pub struct TypeTable {
    shapes: RwLock<FxHashMap<TypeHash, Ty>>,
    undefined: Ty,
    any: Ty,
    none: Ty,
    int: Ty,
    float: Ty,
    double: Ty,
    complex: Ty,
    string: Ty,
    varargs: Ty,
}

struct Shape {
    kind: TypeKind,
    label: Option<Arc<str>>,
    params: Vec<Ty>,
    ret: Option<Ty>,
    class: Option<ClassId>,
    bases: Vec<Ty>,
    symbols: Vec<(Arc<str>, i64)>,
}

impl Shape {
    fn new(kind: TypeKind) -> Self {
        Shape {
            kind,
            label: None,
            params: Vec::new(),
            ret: None,
            class: None,
            bases: Vec::new(),
            symbols: Vec::new(),
        }
    }

    fn hash(&self) -> TypeHash {
        let mut identity = String::new();
        if let Some(label) = &self.label {
            identity.push_str(label);
        }
        if let Some(class) = self.class {
            identity.push_str(&format!("#{}", class.0));
        }
        for (sym, value) in &self.symbols {
            identity.push_str(&format!(";{sym}={value}"));
        }
        let mut parts: Vec<TypeHash> = self.params.iter().map(|p| p.hash).collect();
        if let Some(ret) = &self.ret {
            parts.push(TypeHash(ret.hash.0 ^ crate::type_hash::hash_constants::ROUTINE));
        }
        TypeHash::from_shape(self.kind as u8, &identity, &parts)
    }

    fn render(&self) -> String {
        let join = |items: &[Ty]| {
            items
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(",")
        };
        let label = self.label.as_deref().unwrap_or("");
        match self.kind {
            TypeKind::Undefined => "?".to_string(),
            TypeKind::Any => "any".to_string(),
            TypeKind::None => "none".to_string(),
            TypeKind::Int => "int".to_string(),
            TypeKind::Float => "float".to_string(),
            TypeKind::Double => "double".to_string(),
            TypeKind::Complex => "complex".to_string(),
            TypeKind::String => "string".to_string(),
            TypeKind::VarArgs => "...".to_string(),
            TypeKind::Enum | TypeKind::Object | TypeKind::CData | TypeKind::Exception => {
                label.to_string()
            }
            TypeKind::Class => format!("class<{label}>"),
            TypeKind::TypeParam => format!("@{label}"),
            TypeKind::List => format!("list<{}>", join(&self.params)),
            TypeKind::Map => format!("map<{}>", join(&self.params)),
            TypeKind::Array => format!("array<{}>", join(&self.params)),
            TypeKind::Tuple => format!("tuple<{}>", join(&self.params)),
            TypeKind::Process => format!("process<{}>", join(&self.params)),
            TypeKind::Named => format!("{label}:{}", join(&self.params)),
            TypeKind::Default => format!("{label}={}", join(&self.params)),
            TypeKind::Routine => match &self.ret {
                Some(ret) => format!("routine<{}=>{}>", join(&self.params), ret.name()),
                None => format!("routine<{}>", join(&self.params)),
            },
        }
    }
}

impl TypeTable {
    fn new() -> Self {
        let shapes = RwLock::new(FxHashMap::default());
        let basic = |kind: TypeKind| {
            let shape = Shape::new(kind);
            let hash = shape.hash();
            let ty = Arc::new(Type {
                kind,
                name: shape.render().into(),
                label: None,
                params: Vec::new(),
                ret: None,
                class: None,
                bases: Vec::new(),
                symbols: Vec::new(),
                hash,
            });
            shapes
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(hash, ty.clone());
            ty
        };
        TypeTable {
            undefined: basic(TypeKind::Undefined),
            any: basic(TypeKind::Any),
            none: basic(TypeKind::None),
            int: basic(TypeKind::Int),
            float: basic(TypeKind::Float),
            double: basic(TypeKind::Double),
            complex: basic(TypeKind::Complex),
            string: basic(TypeKind::String),
            varargs: basic(TypeKind::VarArgs),
            shapes,
        }
    }

    /// The process-wide table.
    pub fn global() -> &'static TypeTable {
        &GLOBAL_TABLE
    }

    fn intern(&self, shape: Shape) -> Ty {
        let hash = shape.hash();
        if let Some(found) = self
            .shapes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&hash)
        {
            return found.clone();
        }
        let name: Arc<str> = shape.render().into();
        let mut shapes = self.shapes.write().unwrap_or_else(PoisonError::into_inner);
        shapes
            .entry(hash)
            .or_insert_with(|| {
                Arc::new(Type {
                    kind: shape.kind,
                    name,
                    label: shape.label,
                    params: shape.params,
                    ret: shape.ret,
                    class: shape.class,
                    bases: shape.bases,
                    symbols: shape.symbols,
                    hash,
                })
            })
            .clone()
    }

    /// Number of distinct shapes interned so far.
    pub fn len(&self) -> usize {
        self.shapes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, hash: TypeHash) -> Option<Ty> {
        self.shapes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&hash)
            .cloned()
    }

    pub fn undefined(&self) -> Ty {
        self.undefined.clone()
    }
    pub fn any(&self) -> Ty {
        self.any.clone()
    }
    pub fn none(&self) -> Ty {
        self.none.clone()
    }
    pub fn int(&self) -> Ty {
        self.int.clone()
    }
    pub fn float(&self) -> Ty {
        self.float.clone()
    }
    pub fn double(&self) -> Ty {
        self.double.clone()
    }
    pub fn complex(&self) -> Ty {
        self.complex.clone()
    }
    pub fn string(&self) -> Ty {
        self.string.clone()
    }
    pub fn varargs(&self) -> Ty {
        self.varargs.clone()
    }

    /// Numeric type of the given promotion rank.
    pub fn numeric(&self, kind: TypeKind) -> Ty {
        match kind {
            TypeKind::Int => self.int(),
            TypeKind::Float => self.float(),
            _ => self.double(),
        }
    }

    pub fn list(&self, elem: Ty) -> Ty {
        let mut shape = Shape::new(TypeKind::List);
        shape.params.push(elem);
        self.intern(shape)
    }

    pub fn map(&self, key: Ty, value: Ty) -> Ty {
        let mut shape = Shape::new(TypeKind::Map);
        shape.params = vec![key, value];
        self.intern(shape)
    }

    /// Numeric array; `elem` must be int, float or double.
    pub fn array(&self, elem: Ty) -> Ty {
        let mut shape = Shape::new(TypeKind::Array);
        shape.params.push(elem);
        self.intern(shape)
    }

    pub fn tuple(&self, items: Vec<Ty>) -> Ty {
        let mut shape = Shape::new(TypeKind::Tuple);
        shape.params = items;
        self.intern(shape)
    }

    pub fn routine(&self, params: Vec<Ty>, ret: Ty) -> Ty {
        let mut shape = Shape::new(TypeKind::Routine);
        shape.params = params;
        shape.ret = Some(ret);
        self.intern(shape)
    }

    pub fn process(&self, yields: Ty) -> Ty {
        let mut shape = Shape::new(TypeKind::Process);
        shape.params.push(yields);
        self.intern(shape)
    }

    pub fn named(&self, name: &str, ty: Ty) -> Ty {
        let mut shape = Shape::new(TypeKind::Named);
        shape.label = Some(name.into());
        shape.params.push(ty);
        self.intern(shape)
    }

    pub fn defaulted(&self, name: &str, ty: Ty) -> Ty {
        let mut shape = Shape::new(TypeKind::Default);
        shape.label = Some(name.into());
        shape.params.push(ty);
        self.intern(shape)
    }

    pub fn type_param(&self, name: &str) -> Ty {
        let mut shape = Shape::new(TypeKind::TypeParam);
        shape.label = Some(name.into());
        self.intern(shape)
    }

    pub fn class(&self, id: ClassId, name: &str) -> Ty {
        let mut shape = Shape::new(TypeKind::Class);
        shape.label = Some(name.into());
        shape.class = Some(id);
        self.intern(shape)
    }

    /// Instance type of class `id`; `parent` is the parent's instance type.
    pub fn object(&self, id: ClassId, name: &str, parent: Option<&Ty>) -> Ty {
        let mut shape = Shape::new(TypeKind::Object);
        shape.label = Some(name.into());
        shape.class = Some(id);
        shape.bases = ancestry(parent);
        self.intern(shape)
    }

    pub fn exception(&self, name: &str, parent: Option<&Ty>) -> Ty {
        let mut shape = Shape::new(TypeKind::Exception);
        shape.label = Some(name.into());
        shape.bases = ancestry(parent);
        self.intern(shape)
    }

    pub fn enumeration(&self, name: &str, symbols: &[(&str, i64)]) -> Ty {
        let mut shape = Shape::new(TypeKind::Enum);
        shape.label = Some(name.into());
        shape.symbols = symbols.iter().map(|(s, v)| (Arc::from(*s), *v)).collect();
        self.intern(shape)
    }

    pub fn cdata(&self, name: &str) -> Ty {
        let mut shape = Shape::new(TypeKind::CData);
        shape.label = Some(name.into());
        self.intern(shape)
    }

    /// Replace bound type variables throughout `ty`.
    ///
    /// Unbound variables are left in place. The result is interned; `ty`
    /// itself is never modified.
    pub fn substitute(&self, ty: &Ty, bindings: &FxHashMap<Arc<str>, Ty>) -> Ty {
        if bindings.is_empty() || !ty.is_generic() {
            return ty.clone();
        }
        match ty.kind {
            TypeKind::TypeParam => ty
                .label
                .as_ref()
                .and_then(|l| bindings.get(l))
                .cloned()
                .unwrap_or_else(|| ty.clone()),
            TypeKind::Any | TypeKind::Undefined => ty.clone(),
            _ => {
                let mut shape = Shape::new(ty.kind);
                shape.label = ty.label.clone();
                shape.class = ty.class;
                shape.bases = ty.bases.clone();
                shape.symbols = ty.symbols.clone();
                shape.params = ty
                    .params
                    .iter()
                    .map(|p| self.substitute(p, bindings))
                    .collect();
                shape.ret = ty.ret.as_ref().map(|r| self.substitute(r, bindings));
                self.intern(shape)
            }
        }
    }

    /// The narrowest type every item fits: the shared shape, the highest
    /// numeric rank, or `any`.
    pub fn common(&self, items: &[Ty]) -> Ty {
        let Some(first) = items.first() else {
            return self.any();
        };
        let first = first.strip();
        if items.iter().all(|t| t.strip().hash == first.hash) && !first.is_dynamic() {
            return first;
        }
        if items.iter().all(|t| t.is_numeric()) {
            let rank = items
                .iter()
                .filter_map(|t| t.kind.numeric_rank())
                .max()
                .unwrap_or(0);
            return self.numeric(TypeKind::from_rank(rank));
        }
        self.any()
    }

    /// Replace the inner type of a parameter wrapper, keeping its name and kind.
    pub fn rewrap(&self, wrapper: &Ty, inner: Ty) -> Ty {
        match (wrapper.kind, wrapper.label()) {
            (TypeKind::Named, Some(name)) => self.named(name, inner),
            (TypeKind::Default, Some(name)) => self.defaulted(name, inner),
            _ => inner,
        }
    }
}

fn ancestry(parent: Option<&Ty>) -> Vec<Ty> {
    match parent {
        Some(p) => {
            let mut bases = vec![p.clone()];
            bases.extend(p.bases.iter().cloned());
            bases
        }
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_shape_interns_once() {
        let types = TypeTable::global();
        let a = types.list(types.int());
        let b = types.list(types.int());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "list<int>");
    }

    #[test]
    fn names_render_structurally() {
        let types = TypeTable::global();
        let m = types.map(types.string(), types.int());
        assert_eq!(m.name(), "map<string,int>");
        let r = types.routine(
            vec![
                types.named("x", types.int()),
                types.defaulted("y", types.float()),
            ],
            types.int(),
        );
        assert_eq!(r.name(), "routine<x:int,y=float=>int>");
        let t = types.tuple(vec![types.named("a", types.int()), types.string()]);
        assert_eq!(t.name(), "tuple<a:int,string>");
        assert_eq!(t.field_index("a"), Some(0));
    }

    #[test]
    fn substitute_builds_new_type() {
        let types = TypeTable::global();
        let t = types.type_param("T");
        let generic = types.list(t.clone());
        let mut bindings = FxHashMap::default();
        bindings.insert(Arc::<str>::from("T"), types.double());
        let bound = types.substitute(&generic, &bindings);
        assert_eq!(bound.name(), "list<double>");
        assert_eq!(generic.name(), "list<@T>");
        assert!(generic.is_generic());
        assert!(!bound.is_generic());
    }

    #[test]
    fn object_ancestry() {
        let types = TypeTable::global();
        let base = types.object(ClassId(900), "Base", None);
        let derived = types.object(ClassId(901), "Derived", Some(&base));
        assert!(derived.derives_from(&base));
        assert!(!base.derives_from(&derived));
    }

    #[test]
    fn strip_unwraps_parameters() {
        let types = TypeTable::global();
        let p = types.named("x", types.defaulted("x", types.int()));
        assert_eq!(p.strip().kind(), TypeKind::Int);
    }

    #[test]
    fn common_type_of_items() {
        let types = TypeTable::global();
        assert_eq!(types.common(&[types.int(), types.int()]).name(), "int");
        assert_eq!(types.common(&[types.int(), types.double()]).name(), "double");
        assert_eq!(types.common(&[types.int(), types.string()]).name(), "any");
        assert_eq!(types.common(&[]).name(), "any");
    }
}
