//! Rill Core
//!
//! Data model shared by the inference engine and the execution engine.
//!
//! ## Modules
//!
//! - [`span`]: source positions attached to instructions
//! - [`type_hash`]: structural type identity
//! - [`types`]: interned immutable types and the global type table
//! - [`value`]: tagged runtime values
//! - [`heap`]: generational handle heap with strong counts and cycle collection
//! - [`ops`]: scalar operator semantics shared by constant folding and dispatch
//! - [`bytecode`]: opcodes, instructions, constant pools, operand classification
//! - [`routine`]: routines, overload sets, classes
//! - [`error`]: error types for every phase
//! - [`diagnostics`]: typing diagnostics and their text rendering
//! - [`properties`]: tunable engine properties

pub mod bytecode;
pub mod diagnostics;
pub mod error;
pub mod heap;
pub mod ops;
pub mod properties;
pub mod regset;
pub mod routine;
pub mod span;
pub mod type_hash;
pub mod types;
pub mod value;

pub use bytecode::{
    AnnotatedInstr, CallFlags, CaseMode, Constant, ConstantPool, Instruction, OpCode, Operands,
    ReadSet, classify,
};
pub use diagnostics::{Diagnostic, Diagnostics, RejectReason, Rejection};
pub use error::{InferError, InferErrorKind, RegistrationError, RuntimeError, exception_type};
pub use heap::{Handle, Heap, HeapObject};
pub use properties::{EngineProperties, EngineProperty};
pub use regset::RegSet;
pub use routine::{
    ClassBuilder, ClassDef, CompiledBody, FieldDef, FieldFlags, NativeFn, OverloadSet, Param,
    Routine, RoutineBuilder, RoutineDecl, RoutineFlags,
};
pub use span::Span;
pub use type_hash::TypeHash;
pub use types::{ClassId, Ty, Type, TypeKind, TypeTable};
pub use value::{Complex, MapKey, ProcessId, Value};
