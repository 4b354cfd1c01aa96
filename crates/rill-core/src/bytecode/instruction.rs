//! Instruction encoding.

use std::fmt;

use bitflags::bitflags;

use super::OpCode;
use crate::Span;

/// One register-machine instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub op: OpCode,
    pub a: u16,
    pub b: u16,
    pub c: u16,
}

impl Instruction {
    #[inline]
    pub const fn new(op: OpCode, a: u16, b: u16, c: u16) -> Self {
        Instruction { op, a, b, c }
    }

    /// Argument count of a call instruction.
    #[inline]
    pub fn call_argc(&self) -> usize {
        (self.b & 0xff) as usize
    }

    /// Flags of a call instruction.
    #[inline]
    pub fn call_flags(&self) -> CallFlags {
        CallFlags::from_bits_truncate((self.b >> 8) as u8)
    }

    pub fn set_call_flags(&mut self, flags: CallFlags) {
        self.b = (self.b & 0xff) | ((flags.bits() as u16) << 8);
    }

    /// Branch target, for instructions that have one.
    pub fn target(&self) -> Option<usize> {
        match self.op {
            OpCode::Rescue => Some(self.c as usize),
            op if op.is_branch() => Some(self.b as usize),
            _ => None,
        }
    }

    /// Rewrite the branch target in place.
    pub fn set_target(&mut self, target: usize) {
        match self.op {
            OpCode::Rescue => self.c = target as u16,
            op if op.is_branch() => self.b = target as u16,
            _ => {}
        }
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{},{},{}", self.op.name(), self.a, self.b, self.c)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An instruction together with the source span it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnotatedInstr {
    pub instr: Instruction,
    pub span: Span,
}

impl AnnotatedInstr {
    pub fn new(instr: Instruction, span: Span) -> Self {
        AnnotatedInstr { instr, span }
    }

    #[inline]
    pub fn op(&self) -> OpCode {
        self.instr.op
    }

    #[inline]
    pub fn line(&self) -> u32 {
        self.span.line
    }
}

bitflags! {
    /// Call conventions packed in the high byte of a call's `B` operand.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CallFlags: u8 {
        /// First argument is the receiver.
        const METHOD = 1 << 0;
        /// Pass the calling routine's own parameters instead of registers.
        const CALLER_PARAMS = 1 << 1;
        /// The last argument is a tuple spread into trailing parameters.
        const EXPAND_TUPLE = 1 << 2;
        /// The result is returned directly by the next instruction.
        const TAIL = 1 << 3;
    }
}

/// Lookup strategy of a switch's case block, stored in each case's `C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CaseMode {
    /// Linear scan comparing values for equality.
    Unordered = 0,
    /// Cases sorted by value; binary search.
    Ordered = 1,
    /// Dense jump table indexed by `value - first`.
    Table = 2,
}

impl CaseMode {
    pub fn from_operand(c: u16) -> CaseMode {
        match c {
            1 => CaseMode::Ordered,
            2 => CaseMode::Table,
            _ => CaseMode::Unordered,
        }
    }
}

/// Literal kinds of the `Data` instruction.
pub mod data_kind {
    pub const NONE: u16 = 0;
    pub const INT: u16 = 1;
    pub const FLOAT: u16 = 2;
    pub const DOUBLE: u16 = 3;
}

/// Category operand of `Rescue` that matches every exception.
pub const RESCUE_ANY: u16 = 0xffff;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_operand_packing() {
        let mut call = Instruction::new(OpCode::Call, 4, 2, 7);
        call.set_call_flags(CallFlags::TAIL | CallFlags::METHOD);
        assert_eq!(call.call_argc(), 2);
        assert_eq!(call.call_flags(), CallFlags::TAIL | CallFlags::METHOD);
    }

    #[test]
    fn branch_targets() {
        let mut rescue = Instruction::new(OpCode::Rescue, 1, RESCUE_ANY, 9);
        assert_eq!(rescue.target(), Some(9));
        rescue.set_target(12);
        assert_eq!(rescue.c, 12);
        assert_eq!(Instruction::new(OpCode::Add, 0, 1, 2).target(), None);
        assert_eq!(Instruction::new(OpCode::TestI, 0, 5, 0).target(), Some(5));
    }

    #[test]
    fn dump_format() {
        let i = Instruction::new(OpCode::Add, 0, 1, 2);
        assert_eq!(i.to_string(), "ADD:0,1,2");
    }
}
