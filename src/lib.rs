//! Rill
//!
//! A register-based bytecode virtual machine with static type inference and
//! per-signature specialization.
//!
//! ## Crates
//!
//! - [`rill_core`]: types, values, the heap, bytecode, routines and classes
//! - [`rill_infer`]: flow analysis, inference and specialization
//! - this crate: the [`Program`] registry and the [`Vm`] execution engine
//!
//! ## Example
//!
//! ```ignore
//! use rill::prelude::*;
//!
//! let t = TypeTable::global();
//! let add = RoutineBuilder::new("add")
//!     .param("x", t.int())
//!     .param("y", t.int())
//!     .emit(OpCode::Add, 0, 1, 2)
//!     .emit(OpCode::Return, 2, 1, 0)
//!     .build();
//!
//! let mut program = Program::new();
//! program.add_routine(add)?;
//! let mut vm = Vm::new(Arc::new(program));
//! assert!(matches!(vm.call("add", vec![Value::Int(2), Value::Int(3)])?, Value::Int(5)));
//! ```

pub mod error;
pub mod program;
pub mod vm;

pub use error::{ExceptionReport, RillError, RillResult};
pub use program::{GlobalDef, MAIN_NAMESPACE, Namespace, Program};
pub use vm::{GcStatistics, ProcessState, Resumed, Vm, VmConfig};

pub use rill_core;
pub use rill_infer;

// Re-export main types
pub mod prelude {
    pub use crate::error::{ExceptionReport, RillError, RillResult};
    pub use crate::program::{MAIN_NAMESPACE, Program};
    pub use crate::vm::{ProcessState, Resumed, Vm, VmConfig};
    pub use rill_core::{
        ClassBuilder, ClassId, Constant, EngineProperties, EngineProperty, Heap, HeapObject, OpCode,
        OverloadSet, ProcessId, Routine, RoutineBuilder, RuntimeError, Ty, TypeKind, TypeTable, Value,
    };
    pub use std::sync::Arc;
}
