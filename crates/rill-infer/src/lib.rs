//! Rill Infer
//!
//! Static analysis and specialization of routine bytecode.
//!
//! ## Modules
//!
//! - [`flow`]: flow graphs, the data-flow solver, liveness and definite assignment
//! - [`matcher`]: type matching and overload resolution
//! - [`infer`]: type inference and opcode specialization of one routine
//! - [`specialize`]: per-signature clones of generic routines
//!
//! ## Example
//!
//! ```ignore
//! let types = TypeTable::global();
//! let add = RoutineBuilder::new("add")
//!     .param("x", types.int())
//!     .param("y", types.int())
//!     .emit(OpCode::Add, 0, 1, 2)
//!     .emit(OpCode::Return, 2, 1, 0)
//!     .build();
//! let body = infer_routine(&add, &StaticEnv::new())?;
//! assert_eq!(body.code[0].op(), OpCode::AddIII);
//! ```

pub mod flow;
pub mod infer;
pub mod matcher;
pub mod specialize;

pub use flow::{FlowGraph, build_flow_graph};
pub use infer::{GlobalInfo, InferEnv, InferOptions, Session, StaticEnv, infer_routine};
pub use matcher::{MatchLevel, Resolved, match_type, match_value, resolve_overload, resolve_routine};
pub use specialize::specialize;
