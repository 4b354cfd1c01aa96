//! Scalar operator semantics.
//!
//! One implementation of every arithmetic, comparison and bitwise operator on
//! scalar values. The interpreter's specialized handlers, its generic
//! fallback, and the inference engine's constant folder all go through these
//! functions, so a specialized opcode can never disagree with the generic one.
//!
//! ## Promotion
//!
//! Mixed numeric operands promote to the higher rank (int < float < double).
//! Comparisons always produce an `int` 0/1. `and`/`or` return one of their
//! operands, promoted like any other arithmetic result.

use std::sync::Arc;

use bitflags::bitflags;

use crate::types::TypeKind;
use crate::value::{Complex, Value};

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    And,
    Or,
    Lt,
    Le,
    Eq,
    Ne,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    /// Operator text, which is also the name of the overloading method.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        }
    }

    /// Name of the compound-assignment overload (`+=`), if the operator has one.
    pub fn compound_symbol(self) -> Option<&'static str> {
        Some(match self {
            BinaryOp::Add => "+=",
            BinaryOp::Sub => "-=",
            BinaryOp::Mul => "*=",
            BinaryOp::Div => "/=",
            BinaryOp::Mod => "%=",
            BinaryOp::BitAnd => "&=",
            BinaryOp::BitOr => "|=",
            BinaryOp::BitXor => "^=",
            BinaryOp::Shl => "<<=",
            BinaryOp::Shr => ">>=",
            _ => return None,
        })
    }

    /// `a < b` is `b > a`: the operator tried with swapped operands.
    pub fn swapped_symbol(self) -> Option<&'static str> {
        match self {
            BinaryOp::Lt => Some(">"),
            BinaryOp::Le => Some(">="),
            _ => None,
        }
    }

    #[inline]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    #[inline]
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr
        )
    }

    #[inline]
    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
    BitNot,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::Neg => "-",
            UnaryOp::BitNot => "~",
        }
    }
}

bitflags! {
    /// Exceptional floating-point conditions raised by an arithmetic group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FloatFlags: u8 {
        const DIV_BY_ZERO = 1 << 0;
        const OVERFLOW = 1 << 1;
        const INVALID = 1 << 2;
    }
}

impl FloatFlags {
    /// Conditions produced by computing `result` from finite, non-NaN `a`, `b`.
    pub fn observe(op: BinaryOp, a: f64, b: f64, result: f64) -> FloatFlags {
        if a.is_nan() || b.is_nan() || a.is_infinite() || b.is_infinite() {
            return FloatFlags::empty();
        }
        if result.is_nan() {
            FloatFlags::INVALID
        } else if result.is_infinite() {
            if matches!(op, BinaryOp::Div | BinaryOp::Mod) && b == 0.0 {
                FloatFlags::DIV_BY_ZERO
            } else {
                FloatFlags::OVERFLOW
            }
        } else {
            FloatFlags::empty()
        }
    }

    pub fn describe(self) -> &'static str {
        if self.contains(FloatFlags::DIV_BY_ZERO) {
            "floating point division by zero"
        } else if self.contains(FloatFlags::OVERFLOW) {
            "floating point overflow"
        } else {
            "invalid floating point operation"
        }
    }
}

/// Why a scalar operation could not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarError {
    /// Integer division or modulo by zero.
    DivisionByZero,
    /// The operator does not apply to these operand tags.
    Unsupported,
}

#[inline]
fn flag(b: bool) -> i64 {
    b as i64
}

/// Integer operator.
pub fn int_binary(op: BinaryOp, a: i64, b: i64) -> Result<i64, ScalarError> {
    Ok(match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => {
            if b == 0 {
                return Err(ScalarError::DivisionByZero);
            }
            a.wrapping_div(b)
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(ScalarError::DivisionByZero);
            }
            a.wrapping_rem(b)
        }
        BinaryOp::Pow => {
            if b < 0 {
                (a as f64).powf(b as f64) as i64
            } else {
                a.wrapping_pow(b.min(u32::MAX as i64) as u32)
            }
        }
        BinaryOp::And => {
            if a != 0 {
                b
            } else {
                a
            }
        }
        BinaryOp::Or => {
            if a != 0 {
                a
            } else {
                b
            }
        }
        BinaryOp::Lt => flag(a < b),
        BinaryOp::Le => flag(a <= b),
        BinaryOp::Eq => flag(a == b),
        BinaryOp::Ne => flag(a != b),
        BinaryOp::BitAnd => a & b,
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
        BinaryOp::Shl => a.wrapping_shl(b as u32),
        BinaryOp::Shr => a.wrapping_shr(b as u32),
    })
}

/// Operator on doubles. Comparisons return 0.0/1.0; bitwise operators are unsupported.
pub fn double_binary(op: BinaryOp, a: f64, b: f64) -> Result<f64, ScalarError> {
    let fl = |c: bool| if c { 1.0 } else { 0.0 };
    Ok(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Mod => a % b,
        BinaryOp::Pow => a.powf(b),
        BinaryOp::And => {
            if a != 0.0 {
                b
            } else {
                a
            }
        }
        BinaryOp::Or => {
            if a != 0.0 {
                a
            } else {
                b
            }
        }
        BinaryOp::Lt => fl(a < b),
        BinaryOp::Le => fl(a <= b),
        BinaryOp::Eq => fl(a == b),
        BinaryOp::Ne => fl(a != b),
        _ => return Err(ScalarError::Unsupported),
    })
}

/// Operator on floats, evaluated in single precision.
pub fn float_binary(op: BinaryOp, a: f32, b: f32) -> Result<f32, ScalarError> {
    let fl = |c: bool| if c { 1.0 } else { 0.0 };
    Ok(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Mod => a % b,
        BinaryOp::Pow => a.powf(b),
        BinaryOp::And => {
            if a != 0.0 {
                b
            } else {
                a
            }
        }
        BinaryOp::Or => {
            if a != 0.0 {
                a
            } else {
                b
            }
        }
        BinaryOp::Lt => fl(a < b),
        BinaryOp::Le => fl(a <= b),
        BinaryOp::Eq => fl(a == b),
        BinaryOp::Ne => fl(a != b),
        _ => return Err(ScalarError::Unsupported),
    })
}

/// Result kind of `a op b` for numeric operand kinds.
pub fn numeric_result_kind(op: BinaryOp, a: TypeKind, b: TypeKind) -> Option<TypeKind> {
    let rank = a.numeric_rank()?.max(b.numeric_rank()?);
    if op.is_comparison() {
        return Some(TypeKind::Int);
    }
    if op.is_bitwise() {
        return (rank == 0).then_some(TypeKind::Int);
    }
    Some(TypeKind::from_rank(rank))
}

/// `a op b` on numeric values with promotion, reporting float conditions into `flags`.
pub fn numeric_binary(
    op: BinaryOp,
    a: &Value,
    b: &Value,
    flags: &mut FloatFlags,
) -> Result<Value, ScalarError> {
    let kind = numeric_result_kind(op, a.kind(), b.kind()).ok_or(ScalarError::Unsupported)?;
    let rank = a
        .kind()
        .numeric_rank()
        .max(b.kind().numeric_rank())
        .unwrap_or(0);
    match TypeKind::from_rank(rank) {
        TypeKind::Int => {
            let (x, y) = (a.as_int().unwrap_or(0), b.as_int().unwrap_or(0));
            int_binary(op, x, y).map(Value::Int)
        }
        TypeKind::Float => {
            let x = a.as_f64().unwrap_or(0.0) as f32;
            let y = b.as_f64().unwrap_or(0.0) as f32;
            let r = float_binary(op, x, y)?;
            *flags |= FloatFlags::observe(op, x as f64, y as f64, r as f64);
            Ok(match kind {
                TypeKind::Int => Value::Int(r as i64),
                _ => Value::Float(r),
            })
        }
        _ => {
            let x = a.as_f64().unwrap_or(0.0);
            let y = b.as_f64().unwrap_or(0.0);
            let r = double_binary(op, x, y)?;
            *flags |= FloatFlags::observe(op, x, y, r);
            Ok(match kind {
                TypeKind::Int => Value::Int(r as i64),
                _ => Value::Double(r),
            })
        }
    }
}

/// `a op b` for complex operands (either side may be numeric).
pub fn complex_binary(op: BinaryOp, a: Complex, b: Complex) -> Result<Value, ScalarError> {
    Ok(match op {
        BinaryOp::Add => Value::Complex(a.add(b)),
        BinaryOp::Sub => Value::Complex(a.sub(b)),
        BinaryOp::Mul => Value::Complex(a.mul(b)),
        BinaryOp::Div => Value::Complex(a.div(b)),
        BinaryOp::Eq => Value::Int(flag(a == b)),
        BinaryOp::Ne => Value::Int(flag(a != b)),
        _ => return Err(ScalarError::Unsupported),
    })
}

/// String concatenation and lexicographic comparison.
pub fn string_binary(op: BinaryOp, a: &str, b: &str) -> Result<Value, ScalarError> {
    Ok(match op {
        BinaryOp::Add => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Value::String(Arc::from(s))
        }
        BinaryOp::Lt => Value::Int(flag(a < b)),
        BinaryOp::Le => Value::Int(flag(a <= b)),
        BinaryOp::Eq => Value::Int(flag(a == b)),
        BinaryOp::Ne => Value::Int(flag(a != b)),
        _ => return Err(ScalarError::Unsupported),
    })
}

fn as_complex(v: &Value) -> Option<Complex> {
    match v {
        Value::Complex(c) => Some(*c),
        _ => v.as_f64().map(|re| Complex::new(re, 0.0)),
    }
}

/// `a op b` over any pair of scalar tags; `Unsupported` for everything else.
pub fn scalar_binary(
    op: BinaryOp,
    a: &Value,
    b: &Value,
    flags: &mut FloatFlags,
) -> Result<Value, ScalarError> {
    match (a, b) {
        _ if a.is_numeric() && b.is_numeric() => numeric_binary(op, a, b, flags),
        (Value::Complex(_), _) | (_, Value::Complex(_)) => {
            let (x, y) = (
                as_complex(a).ok_or(ScalarError::Unsupported)?,
                as_complex(b).ok_or(ScalarError::Unsupported)?,
            );
            complex_binary(op, x, y)
        }
        (Value::String(x), Value::String(y)) => string_binary(op, x, y),
        (Value::Enum(ta, x), Value::Enum(tb, y)) if ta.hash() == tb.hash() => match op {
            BinaryOp::BitOr => Ok(Value::Enum(ta.clone(), x | y)),
            BinaryOp::BitAnd => Ok(Value::Enum(ta.clone(), x & y)),
            _ if op.is_comparison() => int_binary(op, *x, *y).map(Value::Int),
            _ => Err(ScalarError::Unsupported),
        },
        (Value::None, Value::None) => match op {
            BinaryOp::Eq => Ok(Value::Int(1)),
            BinaryOp::Ne => Ok(Value::Int(0)),
            _ => Err(ScalarError::Unsupported),
        },
        _ => Err(ScalarError::Unsupported),
    }
}

/// Unary operator on a scalar.
pub fn scalar_unary(op: UnaryOp, a: &Value) -> Result<Value, ScalarError> {
    Ok(match (op, a) {
        (UnaryOp::Not, v) if v.is_numeric() || matches!(v, Value::None) => {
            Value::Int(flag(!v.is_truthy()))
        }
        (UnaryOp::Neg, Value::Int(i)) => Value::Int(i.wrapping_neg()),
        (UnaryOp::Neg, Value::Float(f)) => Value::Float(-f),
        (UnaryOp::Neg, Value::Double(d)) => Value::Double(-d),
        (UnaryOp::Neg, Value::Complex(c)) => Value::Complex(c.neg()),
        (UnaryOp::BitNot, Value::Int(i)) => Value::Int(!i),
        _ => return Err(ScalarError::Unsupported),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(op: BinaryOp, a: Value, b: Value) -> Result<Value, ScalarError> {
        let mut flags = FloatFlags::empty();
        scalar_binary(op, &a, &b, &mut flags)
    }

    #[test]
    fn int_arithmetic() {
        assert!(matches!(eval(BinaryOp::Add, Value::Int(2), Value::Int(3)), Ok(Value::Int(5))));
        assert!(matches!(eval(BinaryOp::Mod, Value::Int(7), Value::Int(3)), Ok(Value::Int(1))));
        assert!(matches!(eval(BinaryOp::Pow, Value::Int(2), Value::Int(10)), Ok(Value::Int(1024))));
        assert_eq!(
            eval(BinaryOp::Div, Value::Int(1), Value::Int(0)).err(),
            Some(ScalarError::DivisionByZero)
        );
    }

    #[test]
    fn promotion_to_highest_rank() {
        assert!(matches!(
            eval(BinaryOp::Mul, Value::Int(2), Value::Float(1.5)),
            Ok(Value::Float(f)) if f == 3.0
        ));
        assert!(matches!(
            eval(BinaryOp::Sub, Value::Float(1.0), Value::Double(0.25)),
            Ok(Value::Double(d)) if d == 0.75
        ));
    }

    #[test]
    fn comparisons_yield_int() {
        assert!(matches!(eval(BinaryOp::Lt, Value::Double(1.0), Value::Int(2)), Ok(Value::Int(1))));
        assert!(matches!(eval(BinaryOp::Eq, Value::string("a"), Value::string("b")), Ok(Value::Int(0))));
    }

    #[test]
    fn logical_ops_return_operands() {
        assert!(matches!(eval(BinaryOp::And, Value::Int(3), Value::Int(4)), Ok(Value::Int(4))));
        assert!(matches!(eval(BinaryOp::Or, Value::Int(0), Value::Int(4)), Ok(Value::Int(4))));
    }

    #[test]
    fn bitwise_rejects_floats() {
        assert_eq!(
            eval(BinaryOp::BitAnd, Value::Float(1.0), Value::Int(1)).err(),
            Some(ScalarError::Unsupported)
        );
    }

    #[test]
    fn float_division_by_zero_sets_flag() {
        let mut flags = FloatFlags::empty();
        let r = scalar_binary(BinaryOp::Div, &Value::Double(1.0), &Value::Double(0.0), &mut flags);
        assert!(matches!(r, Ok(Value::Double(d)) if d.is_infinite()));
        assert_eq!(flags, FloatFlags::DIV_BY_ZERO);
    }

    #[test]
    fn string_concat() {
        assert!(matches!(
            eval(BinaryOp::Add, Value::string("ab"), Value::string("c")),
            Ok(Value::String(s)) if &*s == "abc"
        ));
    }

    #[test]
    fn unary() {
        assert!(matches!(scalar_unary(UnaryOp::Neg, &Value::Int(4)), Ok(Value::Int(-4))));
        assert!(matches!(scalar_unary(UnaryOp::Not, &Value::Int(0)), Ok(Value::Int(1))));
        assert!(scalar_unary(UnaryOp::BitNot, &Value::Double(1.0)).is_err());
    }
}
