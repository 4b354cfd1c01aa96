//! Routine constant pools.

use std::sync::Arc;

use crate::routine::{ClassDef, OverloadSet, Routine};
use crate::types::{Ty, TypeTable};
use crate::value::{Complex, Value};

/// A compile-time constant.
#[derive(Debug, Clone)]
pub enum Constant {
    None,
    Int(i64),
    Float(f32),
    Double(f64),
    Complex(Complex),
    String(Arc<str>),
    Enum(Ty, i64),
    /// A type operand, used by `Check` and `Rescue`.
    Type(Ty),
    Routine(Arc<Routine>),
    Overloads(Arc<OverloadSet>),
    Class(Arc<ClassDef>),
    List(Ty, Vec<Constant>),
    Map(Ty, Vec<(Constant, Constant)>),
    Tuple(Ty, Vec<Constant>),
}

impl Constant {
    pub fn string(s: &str) -> Constant {
        Constant::String(Arc::from(s))
    }

    /// Static type of the constant.
    pub fn type_of(&self) -> Ty {
        let types = TypeTable::global();
        match self {
            Constant::None => types.none(),
            Constant::Int(_) => types.int(),
            Constant::Float(_) => types.float(),
            Constant::Double(_) => types.double(),
            Constant::Complex(_) => types.complex(),
            Constant::String(_) => types.string(),
            Constant::Enum(ty, _) => ty.clone(),
            Constant::Type(_) => types.any(),
            Constant::Routine(r) => r.signature(),
            Constant::Overloads(o) => o
                .routines()
                .first()
                .map(|r| r.signature())
                .unwrap_or_else(|| types.any()),
            Constant::Class(c) => c.class_type.clone(),
            Constant::List(ty, _) | Constant::Map(ty, _) | Constant::Tuple(ty, _) => ty.clone(),
        }
    }

    /// The value of a constant that needs no heap allocation.
    pub fn scalar_value(&self) -> Option<Value> {
        Some(match self {
            Constant::None | Constant::Type(_) => Value::None,
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::Double(d) => Value::Double(*d),
            Constant::Complex(c) => Value::Complex(*c),
            Constant::String(s) => Value::String(s.clone()),
            Constant::Enum(ty, v) => Value::Enum(ty.clone(), *v),
            Constant::Routine(r) => Value::Routine(r.clone()),
            Constant::Overloads(o) => Value::Overloads(o.clone()),
            Constant::Class(c) => Value::Class(c.clone()),
            Constant::List(..) | Constant::Map(..) | Constant::Tuple(..) => return None,
        })
    }

    /// Constant form of a scalar value.
    pub fn from_scalar(value: &Value) -> Option<Constant> {
        Some(match value {
            Value::None => Constant::None,
            Value::Int(i) => Constant::Int(*i),
            Value::Float(f) => Constant::Float(*f),
            Value::Double(d) => Constant::Double(*d),
            Value::Complex(c) => Constant::Complex(*c),
            Value::String(s) => Constant::String(s.clone()),
            Value::Enum(ty, v) => Constant::Enum(ty.clone(), *v),
            _ => return None,
        })
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Constant::Int(i) => Some(*i),
            Constant::Enum(_, v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::String(s) => Some(s),
            _ => None,
        }
    }

    /// Equality of scalar constants, as used to match switch cases.
    pub fn same(&self, other: &Constant) -> bool {
        match (self.scalar_value(), other.scalar_value()) {
            (Some(a), Some(b)) => a.same(&b),
            _ => false,
        }
    }
}

/// A routine's constant pool.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    constants: Vec<Constant>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a constant, reusing an existing equal scalar entry.
    pub fn add(&mut self, constant: Constant) -> u16 {
        if let Some(pos) = self.constants.iter().position(|c| {
            c.scalar_value().is_some() && constant.scalar_value().is_some() && same_tag(c, &constant)
        }) {
            return pos as u16;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u16
    }

    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn as_slice(&self) -> &[Constant] {
        &self.constants
    }
}

impl From<Vec<Constant>> for ConstantPool {
    fn from(constants: Vec<Constant>) -> Self {
        ConstantPool { constants }
    }
}

fn same_tag(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Int(x), Constant::Int(y)) => x == y,
        (Constant::Float(x), Constant::Float(y)) => x.to_bits() == y.to_bits(),
        (Constant::Double(x), Constant::Double(y)) => x.to_bits() == y.to_bits(),
        (Constant::String(x), Constant::String(y)) => x == y,
        (Constant::None, Constant::None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeKind;

    #[test]
    fn pool_deduplicates_scalars() {
        let mut pool = ConstantPool::new();
        let a = pool.add(Constant::Int(5));
        let b = pool.add(Constant::Double(5.0));
        let c = pool.add(Constant::Int(5));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn constant_types() {
        assert_eq!(Constant::Int(1).type_of().kind(), TypeKind::Int);
        assert_eq!(Constant::string("s").type_of().kind(), TypeKind::String);
    }

    #[test]
    fn case_equality() {
        assert!(Constant::Int(3).same(&Constant::Int(3)));
        assert!(!Constant::string("a").same(&Constant::string("b")));
    }
}
