//! Instruction set, constant pools, and operand shapes.

mod constant;
mod instruction;
mod opcode;
mod operands;

pub use constant::{Constant, ConstantPool};
pub use instruction::{AnnotatedInstr, CallFlags, CaseMode, Instruction, RESCUE_ANY, data_kind};
pub use opcode::OpCode;
pub use operands::{Operands, ReadSet, classify, classify_raw};
