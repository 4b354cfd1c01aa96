//! Runtime values.
//!
//! [`Value`] is a closed tagged variant. Scalars and strings are stored
//! inline; containers, instances, closures, exceptions and host data live in
//! the [`Heap`](crate::Heap) and are referenced through generational
//! [`Handle`]s whose strong counts the heap tracks.

use std::fmt;
use std::sync::Arc;

use ordered_float::OrderedFloat;

use crate::heap::Handle;
use crate::routine::{ClassDef, OverloadSet, Routine};
use crate::types::{Ty, TypeKind};

/// Identifies a process (coroutine) owned by an execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub fn new(re: f64, im: f64) -> Self {
        Complex { re, im }
    }

    pub fn add(self, o: Complex) -> Complex {
        Complex::new(self.re + o.re, self.im + o.im)
    }

    pub fn sub(self, o: Complex) -> Complex {
        Complex::new(self.re - o.re, self.im - o.im)
    }

    pub fn mul(self, o: Complex) -> Complex {
        Complex::new(
            self.re * o.re - self.im * o.im,
            self.re * o.im + self.im * o.re,
        )
    }

    pub fn div(self, o: Complex) -> Complex {
        let d = o.re * o.re + o.im * o.im;
        Complex::new(
            (self.re * o.re + self.im * o.im) / d,
            (self.im * o.re - self.re * o.im) / d,
        )
    }

    pub fn neg(self) -> Complex {
        Complex::new(-self.re, -self.im)
    }
}

impl fmt::Display for Complex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.im < 0.0 {
            write!(f, "{}{}$", self.re, self.im)
        } else {
            write!(f, "{}+{}$", self.re, self.im)
        }
    }
}

/// A runtime value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    None,
    Int(i64),
    Float(f32),
    Double(f64),
    Complex(Complex),
    Enum(Ty, i64),
    String(Arc<str>),
    List(Handle),
    Map(Handle),
    Array(Handle),
    Tuple(Handle),
    Object(Handle),
    Closure(Handle),
    Exception(Handle),
    CData(Handle),
    Routine(Arc<Routine>),
    Overloads(Arc<OverloadSet>),
    Class(Arc<ClassDef>),
    Process(ProcessId),
}

impl Value {
    pub fn string(s: &str) -> Value {
        Value::String(Arc::from(s))
    }

    /// The heap handle of a heap-resident value.
    #[inline]
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Value::List(h)
            | Value::Map(h)
            | Value::Array(h)
            | Value::Tuple(h)
            | Value::Object(h)
            | Value::Closure(h)
            | Value::Exception(h)
            | Value::CData(h) => Some(*h),
            _ => None,
        }
    }

    /// Kind of the value's run-time tag.
    pub fn kind(&self) -> TypeKind {
        match self {
            Value::None => TypeKind::None,
            Value::Int(_) => TypeKind::Int,
            Value::Float(_) => TypeKind::Float,
            Value::Double(_) => TypeKind::Double,
            Value::Complex(_) => TypeKind::Complex,
            Value::Enum(..) => TypeKind::Enum,
            Value::String(_) => TypeKind::String,
            Value::List(_) => TypeKind::List,
            Value::Map(_) => TypeKind::Map,
            Value::Array(_) => TypeKind::Array,
            Value::Tuple(_) => TypeKind::Tuple,
            Value::Object(_) => TypeKind::Object,
            Value::Closure(_) | Value::Routine(_) | Value::Overloads(_) => TypeKind::Routine,
            Value::Exception(_) => TypeKind::Exception,
            Value::CData(_) => TypeKind::CData,
            Value::Class(_) => TypeKind::Class,
            Value::Process(_) => TypeKind::Process,
        }
    }

    #[inline]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Double(_))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Double(d) => Some(*d as i64),
            Value::Enum(_, v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Truth value used by conditional jumps.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Double(d) => *d != 0.0,
            Value::Complex(c) => c.re != 0.0 || c.im != 0.0,
            Value::Enum(_, v) => *v != 0,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Convert a numeric value to the numeric kind `kind`.
    pub fn convert_numeric(&self, kind: TypeKind) -> Option<Value> {
        match kind {
            TypeKind::Int => self.as_int().map(Value::Int),
            TypeKind::Float => self.as_f64().map(|v| Value::Float(v as f32)),
            TypeKind::Double => self.as_f64().map(Value::Double),
            _ => None,
        }
    }

    /// Identity comparison: equal scalars, or the same heap object.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Routine(a), Value::Routine(b)) => Arc::ptr_eq(a, b),
            (Value::Overloads(a), Value::Overloads(b)) => Arc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => a.id == b.id,
            (Value::Process(a), Value::Process(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Enum(_, a), Value::Enum(_, b)) => a == b,
            (Value::None, Value::None) => true,
            (Value::Complex(a), Value::Complex(b)) => a == b,
            _ => match (self.handle(), other.handle()) {
                (Some(a), Some(b)) => a == b,
                _ => match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) if self.is_numeric() && other.is_numeric() => a == b,
                    _ => false,
                },
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "none"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}f"),
            Value::Double(x) => write!(f, "{x}d"),
            Value::Complex(c) => write!(f, "{c}"),
            Value::Enum(ty, v) => match ty.symbol_of(*v) {
                Some(sym) => write!(f, "${sym}"),
                None => write!(f, "{}({v})", ty.name()),
            },
            Value::String(s) => write!(f, "{s:?}"),
            Value::List(h) => write!(f, "list@{h:?}"),
            Value::Map(h) => write!(f, "map@{h:?}"),
            Value::Array(h) => write!(f, "array@{h:?}"),
            Value::Tuple(h) => write!(f, "tuple@{h:?}"),
            Value::Object(h) => write!(f, "object@{h:?}"),
            Value::Closure(h) => write!(f, "closure@{h:?}"),
            Value::Exception(h) => write!(f, "exception@{h:?}"),
            Value::CData(h) => write!(f, "cdata@{h:?}"),
            Value::Routine(r) => write!(f, "routine {}", r.name()),
            Value::Overloads(o) => write!(f, "overloads {}", o.name()),
            Value::Class(c) => write!(f, "class {}", c.name),
            Value::Process(p) => write!(f, "process#{}", p.0),
        }
    }
}

/// Ordered map key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapKey {
    None,
    Int(i64),
    Float(OrderedFloat<f32>),
    Double(OrderedFloat<f64>),
    Enum(i64),
    String(Arc<str>),
}

impl MapKey {
    /// Key form of a value; containers and routines cannot be keys.
    pub fn from_value(value: &Value) -> Option<MapKey> {
        Some(match value {
            Value::None => MapKey::None,
            Value::Int(i) => MapKey::Int(*i),
            Value::Float(f) => MapKey::Float(OrderedFloat(*f)),
            Value::Double(d) => MapKey::Double(OrderedFloat(*d)),
            Value::Enum(_, v) => MapKey::Enum(*v),
            Value::String(s) => MapKey::String(s.clone()),
            _ => return None,
        })
    }

    /// Value form of the key; enum keys need their type back from the map type.
    pub fn to_value(&self, key_type: Option<&Ty>) -> Value {
        match self {
            MapKey::None => Value::None,
            MapKey::Int(i) => Value::Int(*i),
            MapKey::Float(f) => Value::Float(f.0),
            MapKey::Double(d) => Value::Double(d.0),
            MapKey::Enum(v) => match key_type {
                Some(ty) if ty.kind() == TypeKind::Enum => Value::Enum(ty.clone(), *v),
                _ => Value::Int(*v),
            },
            MapKey::String(s) => Value::String(s.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Double(0.5).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(Value::string("x").is_truthy());
    }

    #[test]
    fn numeric_conversion() {
        let v = Value::Double(2.75);
        assert!(matches!(v.convert_numeric(TypeKind::Int), Some(Value::Int(2))));
        assert!(matches!(
            Value::Int(3).convert_numeric(TypeKind::Float),
            Some(Value::Float(f)) if f == 3.0
        ));
    }

    #[test]
    fn complex_arithmetic() {
        let a = Complex::new(1.0, 2.0);
        let b = Complex::new(3.0, -1.0);
        assert_eq!(a.mul(b), Complex::new(5.0, 5.0));
        assert_eq!(a.add(b).sub(b), a);
        let q = a.mul(b).div(b);
        assert!((q.re - 1.0).abs() < 1e-12 && (q.im - 2.0).abs() < 1e-12);
    }

    #[test]
    fn map_keys_order() {
        let mut keys = [
            MapKey::from_value(&Value::Int(3)),
            MapKey::from_value(&Value::Int(-1)),
            MapKey::from_value(&Value::string("a")),
        ];
        keys.sort();
        assert_eq!(keys[0], Some(MapKey::Int(-1)));
        assert!(MapKey::from_value(&Value::Process(ProcessId(0))).is_none());
    }

    #[test]
    fn sameness_across_numeric_tags() {
        assert!(Value::Int(2).same(&Value::Double(2.0)));
        assert!(!Value::Int(2).same(&Value::string("2")));
    }
}
