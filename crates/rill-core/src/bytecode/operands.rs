//! Operand classification.
//!
//! Maps an instruction to the registers it reads and the register it writes.
//! Liveness and definite assignment are built entirely on this table, and the
//! match below is exhaustive over [`OpCode`]: adding an opcode without
//! classifying it does not compile. Raw bytes that do not decode to an opcode
//! are classified by [`classify_raw`] as having no operands.

use super::{Instruction, OpCode};

/// Registers read by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSet {
    None,
    Single(u16),
    Pair(u16, u16),
    Triple(u16, u16, u16),
    /// `start .. start+len`.
    Range { start: u16, len: u16 },
}

impl ReadSet {
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let (fixed, range): ([Option<u16>; 3], std::ops::Range<usize>) = match self {
            ReadSet::None => ([None; 3], 0..0),
            ReadSet::Single(a) => ([Some(a), None, None], 0..0),
            ReadSet::Pair(a, b) => ([Some(a), Some(b), None], 0..0),
            ReadSet::Triple(a, b, c) => ([Some(a), Some(b), Some(c)], 0..0),
            ReadSet::Range { start, len } => {
                ([None; 3], start as usize..start as usize + len as usize)
            }
        };
        fixed.into_iter().flatten().map(usize::from).chain(range)
    }

    pub fn contains(self, reg: usize) -> bool {
        self.iter().any(|r| r == reg)
    }
}

/// Read and write shape of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operands {
    pub reads: ReadSet,
    pub write: Option<u16>,
}

impl Operands {
    const NONE: Operands = Operands {
        reads: ReadSet::None,
        write: None,
    };

    fn reads(reads: ReadSet) -> Operands {
        Operands { reads, write: None }
    }

    fn rw(reads: ReadSet, write: u16) -> Operands {
        Operands {
            reads,
            write: Some(write),
        }
    }
}

/// Operand shape of a decoded instruction.
pub fn classify(i: &Instruction) -> Operands {
    use OpCode::*;
    let (a, b, c) = (i.a, i.b, i.c);
    match i.op {
        Nop | Goto | Case | Try | EndTry => Operands::NONE,

        Data | DataI | DataF | DataD | GetConst | GetConstI | GetConstF | GetConstD
        | GetGlobal | GetGlobalI | GetGlobalF | GetGlobalD | GetCapture => {
            Operands::rw(ReadSet::None, c)
        }

        GetItem | GetItemLI | GetItemLII | GetItemLFI | GetItemLDI | GetItemLSI | GetItemSI
        | GetItemAII | GetItemAFI | GetItemADI | GetItemM | GetItemTI => {
            Operands::rw(ReadSet::Pair(a, b), c)
        }

        GetField | GetFieldT | GetFieldTI | GetFieldTF | GetFieldTD | GetFieldTS
        | GetFieldOV => Operands::rw(ReadSet::Single(a), c),

        SetGlobal | SetGlobalI | SetGlobalF | SetGlobalD | SetCapture => {
            Operands::reads(ReadSet::Single(a))
        }

        SetItem | SetItemLI | SetItemLIII | SetItemLFIF | SetItemLDID | SetItemLSIS
        | SetItemSII | SetItemAIII | SetItemAFIF | SetItemADID | SetItemM => {
            Operands::reads(ReadSet::Triple(a, b, c))
        }

        SetField | SetFieldT | SetFieldTII | SetFieldTFF | SetFieldTDD | SetFieldTSS
        | SetFieldOV => Operands::reads(ReadSet::Pair(a, c)),

        Move | MoveII | MoveIF | MoveID | MoveFI | MoveFF | MoveFD | MoveDI | MoveDF | MoveDD
        | MoveSS | MovePP | Cast | Check => Operands::rw(ReadSet::Single(a), c),

        Not | Neg | BitNot | NotI | NotF | NotD | NegI | NegF | NegD | NegC | BitNotI => {
            Operands::rw(ReadSet::Single(a), c)
        }

        Add | Sub | Mul | Div | Mod | Pow | And | Or | Lt | Le | Eq | Ne | BitAnd | BitOr
        | BitXor | Shl | Shr | AddIII | SubIII | MulIII | DivIII | ModIII | PowIII | AndIII
        | OrIII | LtIII | LeIII | EqIII | NeIII | BitAndIII | BitOrIII | BitXorIII | ShlIII
        | ShrIII | AddFFF | SubFFF | MulFFF | DivFFF | ModFFF | PowFFF | AndFFF | OrFFF
        | AddDDD | SubDDD | MulDDD | DivDDD | ModDDD | PowDDD | AndDDD | OrDDD | AddFNN
        | SubFNN | MulFNN | DivFNN | ModFNN | PowFNN | AddDNN | SubDNN | MulDNN | DivDNN
        | ModDNN | PowDNN | LtIFF | LeIFF | EqIFF | NeIFF | LtIDD | LeIDD | EqIDD | NeIDD
        | LtINN | LeINN | EqINN | NeINN | AddSS | LtSS | LeSS | EqSS | NeSS | AddCC | SubCC
        | MulCC | DivCC => Operands::rw(ReadSet::Pair(a, b), c),

        NamedArg => Operands::rw(ReadSet::Single(b), c),

        Tuple | List | Map | Array => Operands::rw(ReadSet::Range { start: a, len: b }, c),

        Closure => Operands::rw(
            ReadSet::Range {
                start: a,
                len: b + 1,
            },
            c,
        ),

        Switch | Test | TestI | TestF | TestD => Operands::reads(ReadSet::Single(a)),

        Call | MCall | CallTyped | MCallTyped => Operands::rw(
            ReadSet::Range {
                start: a,
                len: i.call_argc() as u16 + 1,
            },
            c,
        ),

        Raise | Return => Operands::reads(ReadSet::Range { start: a, len: b }),

        Rescue => Operands::rw(ReadSet::None, a),

        Yield => Operands::rw(ReadSet::Range { start: a, len: b }, c),
    }
}

/// Operand shape of an undecoded instruction word.
pub fn classify_raw(op: u8, a: u16, b: u16, c: u16) -> Operands {
    match OpCode::try_from(op) {
        Ok(op) => classify(&Instruction::new(op, a, b, c)),
        Err(_) => Operands::NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs(op: OpCode, a: u16, b: u16, c: u16) -> (Vec<usize>, Option<u16>) {
        let ops = classify(&Instruction::new(op, a, b, c));
        (ops.reads.iter().collect(), ops.write)
    }

    #[test]
    fn binary_reads_pair_writes_c() {
        assert_eq!(regs(OpCode::Add, 0, 1, 2), (vec![0, 1], Some(2)));
        assert_eq!(regs(OpCode::AddDNN, 3, 4, 5), (vec![3, 4], Some(5)));
    }

    #[test]
    fn set_item_reads_container() {
        assert_eq!(regs(OpCode::SetItemLIII, 0, 1, 2), (vec![0, 1, 2], None));
        assert_eq!(regs(OpCode::SetField, 0, 7, 2), (vec![0, 2], None));
    }

    #[test]
    fn ranges() {
        assert_eq!(regs(OpCode::List, 2, 3, 9), (vec![2, 3, 4], Some(9)));
        assert_eq!(regs(OpCode::Return, 1, 0, 0), (vec![], None));
        assert_eq!(regs(OpCode::Call, 4, 2, 1), (vec![4, 5, 6], Some(1)));
        assert_eq!(regs(OpCode::Closure, 0, 1, 5), (vec![0, 1], Some(5)));
    }

    #[test]
    fn rescue_writes_a() {
        assert_eq!(regs(OpCode::Rescue, 3, 0xffff, 10), (vec![], Some(3)));
    }

    #[test]
    fn unknown_raw_opcode_has_no_operands() {
        let ops = classify_raw(251, 1, 2, 3);
        assert_eq!(ops.reads, ReadSet::None);
        assert_eq!(ops.write, None);
    }
}
