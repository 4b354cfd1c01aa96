//! Operation codes.
//!
//! The instruction set has two layers. *Generic* opcodes are what a front end
//! emits: each one inspects its operands' run-time tags. *Specialized*
//! opcodes are only ever produced by type inference, which proves the
//! operand types statically; their handlers skip the tag dispatch.
//!
//! Letter suffixes name operand types in `C`, `A`, `B` order for arithmetic
//! (`AddFFF`), destination-then-source for moves (`MoveFI` = float from int),
//! and container-then-element for item access (`GetItemLFI` = list, float
//! element, int index). `N` means "any numeric". Every instruction is
//! `(op, a, b, c)`; see [`Instruction`](super::Instruction).

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ops::{BinaryOp, UnaryOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    // =========================================================================
    // Generic: loads and stores
    // =========================================================================
    /// No operation.
    Nop = 0,
    /// `C = literal`; A = kind (0 none, 1 int, 2 float, 3 double), B = value as i16.
    Data,
    /// `C = constants[B]`.
    GetConst,
    /// `C = globals[A][B]`.
    GetGlobal,
    /// `C = captured[B]`.
    GetCapture,
    /// `C = A[B]`.
    GetItem,
    /// `C = A.<constants[B]>`.
    GetField,
    /// `globals[C][B] = A`.
    SetGlobal,
    /// `captured[B] = A`.
    SetCapture,
    /// `C[B] = A`.
    SetItem,
    /// `C.<constants[B]> = A`.
    SetField,
    /// `C = A`.
    Move,
    /// `C = A` converted to the declared type of `C`.
    Cast,

    // =========================================================================
    // Generic: operators
    // =========================================================================
    /// `C = !A`.
    Not,
    /// `C = -A`.
    Neg,
    /// `C = ~A`.
    BitNot,
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
    /// `C = A matches type constants[B]`.
    Check,

    // =========================================================================
    // Generic: construction
    // =========================================================================
    /// `C = name(constants[A]) => B`, a named call argument.
    NamedArg,
    /// `C = (A, ..., A+B-1)`.
    Tuple,
    /// `C = {A, ..., A+B-1}`.
    List,
    /// `C = {A => A+1, ...}` over `B` registers.
    Map,
    /// `C = [A, ..., A+B-1]`, numeric array.
    Array,
    /// `C = closure(A, captures A+1 .. A+B)`.
    Closure,

    // =========================================================================
    // Control flow
    // =========================================================================
    /// Jump to `B`.
    Goto,
    /// Switch on `A`, default `B`, `C` case instructions follow.
    Switch,
    /// Case value `constants[A]`, target `B`, lookup mode `C`.
    Case,
    /// If `A` is false jump to `B`.
    Test,
    /// `C = A(A+1, ...)`; low byte of B = argument count, high byte = call flags.
    Call,
    /// Method call; `A+1` is the receiver.
    MCall,
    /// Enter a protected region whose handler starts at `B`.
    Try,
    /// Leave the innermost protected region.
    EndTry,
    /// Raise `A .. A+B-1`; `B = 0` re-raises the pending exception.
    Raise,
    /// Take the pending exception into `A` when it matches `constants[B]` (0xFFFF: any), else jump to `C`.
    Rescue,
    /// Return `A .. A+B-1`.
    Return,
    /// Yield `A .. A+B-1`; resumption arguments land in `C`.
    Yield,

    // =========================================================================
    // Specialized: scalar loads and stores
    // =========================================================================
    DataI,
    DataF,
    DataD,
    GetConstI,
    GetConstF,
    GetConstD,
    GetGlobalI,
    GetGlobalF,
    GetGlobalD,
    SetGlobalI,
    SetGlobalF,
    SetGlobalD,

    // =========================================================================
    // Specialized: moves and numeric coercions (destination first)
    // =========================================================================
    MoveII,
    MoveIF,
    MoveID,
    MoveFI,
    MoveFF,
    MoveFD,
    MoveDI,
    MoveDF,
    MoveDD,
    /// String to string.
    MoveSS,
    /// Reference to reference of a proven type.
    MovePP,

    // =========================================================================
    // Specialized: unary
    // =========================================================================
    NotI,
    NotF,
    NotD,
    NegI,
    NegF,
    NegD,
    NegC,
    BitNotI,

    // =========================================================================
    // Specialized: integer arithmetic
    // =========================================================================
    AddIII,
    SubIII,
    MulIII,
    DivIII,
    ModIII,
    PowIII,
    AndIII,
    OrIII,
    LtIII,
    LeIII,
    EqIII,
    NeIII,
    BitAndIII,
    BitOrIII,
    BitXorIII,
    ShlIII,
    ShrIII,

    // =========================================================================
    // Specialized: float arithmetic
    // =========================================================================
    AddFFF,
    SubFFF,
    MulFFF,
    DivFFF,
    ModFFF,
    PowFFF,
    AndFFF,
    OrFFF,

    // =========================================================================
    // Specialized: double arithmetic
    // =========================================================================
    AddDDD,
    SubDDD,
    MulDDD,
    DivDDD,
    ModDDD,
    PowDDD,
    AndDDD,
    OrDDD,

    // =========================================================================
    // Specialized: mixed numeric operands, float or double result
    // =========================================================================
    AddFNN,
    SubFNN,
    MulFNN,
    DivFNN,
    ModFNN,
    PowFNN,
    AddDNN,
    SubDNN,
    MulDNN,
    DivDNN,
    ModDNN,
    PowDNN,

    // =========================================================================
    // Specialized: comparisons (int result)
    // =========================================================================
    LtIFF,
    LeIFF,
    EqIFF,
    NeIFF,
    LtIDD,
    LeIDD,
    EqIDD,
    NeIDD,
    LtINN,
    LeINN,
    EqINN,
    NeINN,

    // =========================================================================
    // Specialized: strings and complex numbers
    // =========================================================================
    AddSS,
    LtSS,
    LeSS,
    EqSS,
    NeSS,
    AddCC,
    SubCC,
    MulCC,
    DivCC,

    // =========================================================================
    // Specialized: container access
    // =========================================================================
    /// List item, element type not scalar.
    GetItemLI,
    GetItemLII,
    GetItemLFI,
    GetItemLDI,
    GetItemLSI,
    SetItemLI,
    SetItemLIII,
    SetItemLFIF,
    SetItemLDID,
    SetItemLSIS,
    /// String character code.
    GetItemSI,
    SetItemSII,
    GetItemAII,
    GetItemAFI,
    GetItemADI,
    SetItemAIII,
    SetItemAFIF,
    SetItemADID,
    /// Map item with a key of the map's key type.
    GetItemM,
    SetItemM,
    /// Tuple item by dynamic int index.
    GetItemTI,
    /// Tuple field by static index `B`.
    GetFieldT,
    GetFieldTI,
    GetFieldTF,
    GetFieldTD,
    GetFieldTS,
    /// `C.field[B] = A`, static tuple field index.
    SetFieldT,
    SetFieldTII,
    SetFieldTFF,
    SetFieldTDD,
    SetFieldTSS,
    /// Instance field by static slot `B`.
    GetFieldOV,
    SetFieldOV,

    // =========================================================================
    // Specialized: control
    // =========================================================================
    TestI,
    TestF,
    TestD,
    /// Call whose callee was resolved during inference.
    CallTyped,
    MCallTyped,
}

impl OpCode {
    /// Instructions that transfer control to operand `B` (or `C` for `Rescue`).
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            OpCode::Goto
                | OpCode::Test
                | OpCode::TestI
                | OpCode::TestF
                | OpCode::TestD
                | OpCode::Switch
                | OpCode::Case
                | OpCode::Try
                | OpCode::Rescue
        )
    }

    /// Instructions after which control never falls through.
    pub fn is_terminator(self) -> bool {
        matches!(self, OpCode::Goto | OpCode::Return | OpCode::Raise | OpCode::Switch)
    }

    pub fn is_call(self) -> bool {
        matches!(
            self,
            OpCode::Call | OpCode::MCall | OpCode::CallTyped | OpCode::MCallTyped
        )
    }

    /// Arithmetic instructions; the float condition flags are polled after a run of these.
    pub fn is_arithmetic(self) -> bool {
        let code = u8::from(self);
        (u8::from(OpCode::Not)..=u8::from(OpCode::Shr)).contains(&code)
            || (u8::from(OpCode::NotI)..=u8::from(OpCode::DivCC)).contains(&code)
    }

    /// Whether inference produced this opcode.
    pub fn is_specialized(self) -> bool {
        u8::from(self) >= u8::from(OpCode::DataI)
    }

    /// Operator computed by a generic or specialized binary instruction.
    pub fn binary_op(self) -> Option<BinaryOp> {
        use OpCode::*;
        Some(match self {
            Add | AddIII | AddFFF | AddDDD | AddFNN | AddDNN | AddSS | AddCC => BinaryOp::Add,
            Sub | SubIII | SubFFF | SubDDD | SubFNN | SubDNN | SubCC => BinaryOp::Sub,
            Mul | MulIII | MulFFF | MulDDD | MulFNN | MulDNN | MulCC => BinaryOp::Mul,
            Div | DivIII | DivFFF | DivDDD | DivFNN | DivDNN | DivCC => BinaryOp::Div,
            Mod | ModIII | ModFFF | ModDDD | ModFNN | ModDNN => BinaryOp::Mod,
            Pow | PowIII | PowFFF | PowDDD | PowFNN | PowDNN => BinaryOp::Pow,
            And | AndIII | AndFFF | AndDDD => BinaryOp::And,
            Or | OrIII | OrFFF | OrDDD => BinaryOp::Or,
            Lt | LtIII | LtIFF | LtIDD | LtINN | LtSS => BinaryOp::Lt,
            Le | LeIII | LeIFF | LeIDD | LeINN | LeSS => BinaryOp::Le,
            Eq | EqIII | EqIFF | EqIDD | EqINN | EqSS => BinaryOp::Eq,
            Ne | NeIII | NeIFF | NeIDD | NeINN | NeSS => BinaryOp::Ne,
            BitAnd | BitAndIII => BinaryOp::BitAnd,
            BitOr | BitOrIII => BinaryOp::BitOr,
            BitXor | BitXorIII => BinaryOp::BitXor,
            Shl | ShlIII => BinaryOp::Shl,
            Shr | ShrIII => BinaryOp::Shr,
            _ => return None,
        })
    }

    pub fn unary_op(self) -> Option<UnaryOp> {
        use OpCode::*;
        Some(match self {
            Not | NotI | NotF | NotD => UnaryOp::Not,
            Neg | NegI | NegF | NegD | NegC => UnaryOp::Neg,
            BitNot | BitNotI => UnaryOp::BitNot,
            _ => return None,
        })
    }

    /// Generic binary opcode of an operator.
    pub fn from_binary(op: BinaryOp) -> OpCode {
        match op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::Div => OpCode::Div,
            BinaryOp::Mod => OpCode::Mod,
            BinaryOp::Pow => OpCode::Pow,
            BinaryOp::And => OpCode::And,
            BinaryOp::Or => OpCode::Or,
            BinaryOp::Lt => OpCode::Lt,
            BinaryOp::Le => OpCode::Le,
            BinaryOp::Eq => OpCode::Eq,
            BinaryOp::Ne => OpCode::Ne,
            BinaryOp::BitAnd => OpCode::BitAnd,
            BinaryOp::BitOr => OpCode::BitOr,
            BinaryOp::BitXor => OpCode::BitXor,
            BinaryOp::Shl => OpCode::Shl,
            BinaryOp::Shr => OpCode::Shr,
        }
    }

    /// Printable name used in instruction dumps.
    pub fn name(self) -> String {
        format!("{self:?}").to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_raw_bytes() {
        let raw: u8 = OpCode::Add.into();
        assert_eq!(OpCode::try_from(raw).ok(), Some(OpCode::Add));
        assert!(OpCode::try_from(250u8).is_err());
    }

    #[test]
    fn classification() {
        assert!(OpCode::AddIII.is_arithmetic());
        assert!(OpCode::Lt.is_arithmetic());
        assert!(!OpCode::GetItemLI.is_arithmetic());
        assert!(OpCode::GetItemLI.is_specialized());
        assert!(!OpCode::Yield.is_specialized());
        assert!(OpCode::Goto.is_terminator());
        assert!(OpCode::Rescue.is_branch());
    }

    #[test]
    fn operator_families() {
        assert_eq!(OpCode::AddDNN.binary_op(), Some(BinaryOp::Add));
        assert_eq!(OpCode::LtSS.binary_op(), Some(BinaryOp::Lt));
        assert_eq!(OpCode::NegC.unary_op(), Some(UnaryOp::Neg));
        assert_eq!(OpCode::Move.binary_op(), None);
        assert_eq!(OpCode::from_binary(BinaryOp::Shr), OpCode::Shr);
    }

    #[test]
    fn dump_name() {
        assert_eq!(OpCode::AddIII.name(), "ADDIII");
    }
}
