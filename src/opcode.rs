//! The instruction set descriptor.
//!
//! Every instruction is a single opcode byte followed by its operands, and the encoded length of an instruction
//! is determined solely by its opcode. Shrinkable instructions come in pairs where the narrow (1-byte operand)
//! form is numbered exactly one below the wide (4-byte operand) form.

#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// The kind and width of a single instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// Signed 1-byte integer.
    Int1,
    /// Signed 4-byte integer.
    Int4,
    /// Unsigned 1-byte integer.
    UInt1,
    /// Unsigned 4-byte integer.
    UInt4,
    /// 1-byte literal table index.
    Lit1,
    /// 4-byte literal table index.
    Lit4,
    /// 1-byte local variable table index.
    Lvt1,
    /// 4-byte local variable table index.
    Lvt4,
    /// 4-byte auxiliary data table index.
    Aux4,
    /// Signed 1-byte displacement relative to the instruction's own address.
    Offset1,
    /// Signed 4-byte displacement relative to the instruction's own address.
    Offset4,
}
impl OperandType {
    /// Number of bytes the operand occupies in the code buffer.
    pub const fn size(self) -> usize {
        match self {
            OperandType::Int1 | OperandType::UInt1 | OperandType::Lit1 | OperandType::Lvt1 | OperandType::Offset1 => 1,
            OperandType::Int4 | OperandType::UInt4 | OperandType::Lit4 | OperandType::Lvt4 | OperandType::Aux4 | OperandType::Offset4 => 4,
        }
    }
}

/// Static description of an instruction.
#[derive(Debug)]
pub struct InstructionDesc {
    /// Mnemonic used in disassembly.
    pub name: &'static str,
    /// Total encoded length, opcode byte included.
    pub num_bytes: usize,
    /// Net change in operand stack depth, or [`None`] if it depends on an operand.
    pub stack_effect: Option<i32>,
    pub operands: &'static [OperandType],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Opcode {
    Done = 0,
    Push1,
    Push4,
    Pop,
    Dup,
    StrConcat1,
    InvokeStk1,
    InvokeStk4,
    EvalStk,
    ExprStk,

    LoadScalar1,
    LoadScalar4,
    LoadScalarStk,
    LoadArray1,
    LoadArray4,
    LoadArrayStk,
    StoreScalar1,
    StoreScalar4,
    StoreScalarStk,
    StoreArray1,
    StoreArray4,
    StoreArrayStk,
    IncrScalar1,
    IncrScalarStk,

    Jump1,
    Jump4,
    JumpTrue1,
    JumpTrue4,
    JumpFalse1,
    JumpFalse4,

    Lor,
    Land,
    Bitor,
    Bitxor,
    Bitand,
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
    Lshift,
    Rshift,
    Add,
    Sub,
    Mult,
    Div,
    Mod,
    Uplus,
    Uminus,
    Bitnot,
    Lnot,

    Break,
    Continue,
    ForeachStart,
    ForeachStep,
    BeginCatch,
    EndCatch,
    PushResult,
    PushReturnCode,
    StartCmd,
    JumpTable,
    Nop,
    ReturnStk,
}

macro_rules! desc {
    ($name:literal, $effect:expr, [$($operand:ident),*]) => {{
        const DESC: InstructionDesc = InstructionDesc {
            name: $name,
            num_bytes: 1 $(+ OperandType::$operand.size())*,
            stack_effect: $effect,
            operands: &[$(OperandType::$operand),*],
        };
        &DESC
    }};
}

impl Opcode {
    /// Decodes an opcode byte, returning [`None`] for unassigned byte values.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_u8(byte)
    }
    /// Gets the static descriptor for this opcode.
    pub fn desc(self) -> &'static InstructionDesc {
        match self {
            Opcode::Done => desc!("done", Some(-1), []),
            Opcode::Push1 => desc!("push1", Some(1), [Lit1]),
            Opcode::Push4 => desc!("push4", Some(1), [Lit4]),
            Opcode::Pop => desc!("pop", Some(-1), []),
            Opcode::Dup => desc!("dup", Some(1), []),
            Opcode::StrConcat1 => desc!("strcat", None, [UInt1]),
            Opcode::InvokeStk1 => desc!("invokeStk1", None, [UInt1]),
            Opcode::InvokeStk4 => desc!("invokeStk4", None, [UInt4]),
            Opcode::EvalStk => desc!("evalStk", Some(0), []),
            Opcode::ExprStk => desc!("exprStk", Some(0), []),

            Opcode::LoadScalar1 => desc!("loadScalar1", Some(1), [Lvt1]),
            Opcode::LoadScalar4 => desc!("loadScalar4", Some(1), [Lvt4]),
            Opcode::LoadScalarStk => desc!("loadScalarStk", Some(0), []),
            Opcode::LoadArray1 => desc!("loadArray1", Some(0), [Lvt1]),
            Opcode::LoadArray4 => desc!("loadArray4", Some(0), [Lvt4]),
            Opcode::LoadArrayStk => desc!("loadArrayStk", Some(-1), []),
            Opcode::StoreScalar1 => desc!("storeScalar1", Some(0), [Lvt1]),
            Opcode::StoreScalar4 => desc!("storeScalar4", Some(0), [Lvt4]),
            Opcode::StoreScalarStk => desc!("storeScalarStk", Some(-1), []),
            Opcode::StoreArray1 => desc!("storeArray1", Some(-1), [Lvt1]),
            Opcode::StoreArray4 => desc!("storeArray4", Some(-1), [Lvt4]),
            Opcode::StoreArrayStk => desc!("storeArrayStk", Some(-2), []),
            Opcode::IncrScalar1 => desc!("incrScalar1", Some(0), [Lvt1]),
            Opcode::IncrScalarStk => desc!("incrScalarStk", Some(-1), []),

            Opcode::Jump1 => desc!("jump1", Some(0), [Offset1]),
            Opcode::Jump4 => desc!("jump4", Some(0), [Offset4]),
            Opcode::JumpTrue1 => desc!("jumpTrue1", Some(-1), [Offset1]),
            Opcode::JumpTrue4 => desc!("jumpTrue4", Some(-1), [Offset4]),
            Opcode::JumpFalse1 => desc!("jumpFalse1", Some(-1), [Offset1]),
            Opcode::JumpFalse4 => desc!("jumpFalse4", Some(-1), [Offset4]),

            Opcode::Lor => desc!("lor", Some(-1), []),
            Opcode::Land => desc!("land", Some(-1), []),
            Opcode::Bitor => desc!("bitor", Some(-1), []),
            Opcode::Bitxor => desc!("bitxor", Some(-1), []),
            Opcode::Bitand => desc!("bitand", Some(-1), []),
            Opcode::Eq => desc!("eq", Some(-1), []),
            Opcode::Neq => desc!("neq", Some(-1), []),
            Opcode::Lt => desc!("lt", Some(-1), []),
            Opcode::Gt => desc!("gt", Some(-1), []),
            Opcode::Le => desc!("le", Some(-1), []),
            Opcode::Ge => desc!("ge", Some(-1), []),
            Opcode::Lshift => desc!("lshift", Some(-1), []),
            Opcode::Rshift => desc!("rshift", Some(-1), []),
            Opcode::Add => desc!("add", Some(-1), []),
            Opcode::Sub => desc!("sub", Some(-1), []),
            Opcode::Mult => desc!("mult", Some(-1), []),
            Opcode::Div => desc!("div", Some(-1), []),
            Opcode::Mod => desc!("mod", Some(-1), []),
            Opcode::Uplus => desc!("uplus", Some(0), []),
            Opcode::Uminus => desc!("uminus", Some(0), []),
            Opcode::Bitnot => desc!("bitnot", Some(0), []),
            Opcode::Lnot => desc!("not", Some(0), []),

            Opcode::Break => desc!("break", Some(0), []),
            Opcode::Continue => desc!("continue", Some(0), []),
            Opcode::ForeachStart => desc!("foreach_start", Some(0), [Aux4]),
            Opcode::ForeachStep => desc!("foreach_step", Some(1), [Aux4]),
            Opcode::BeginCatch => desc!("beginCatch", Some(0), [UInt4]),
            Opcode::EndCatch => desc!("endCatch", Some(0), []),
            Opcode::PushResult => desc!("pushResult", Some(1), []),
            Opcode::PushReturnCode => desc!("pushReturnCode", Some(1), []),
            Opcode::StartCmd => desc!("startCommand", Some(0), [Offset4, UInt4]),
            Opcode::JumpTable => desc!("jumpTable", Some(-1), [Aux4]),
            Opcode::Nop => desc!("nop", Some(0), []),
            Opcode::ReturnStk => desc!("returnStk", Some(-1), []),
        }
    }
    /// Total encoded length of the instruction, opcode byte included.
    pub fn num_bytes(self) -> usize {
        self.desc().num_bytes
    }
    /// Gets the 1-byte-operand form of a shrinkable 4-byte-operand instruction.
    ///
    /// Only the instructions the compactor is allowed to narrow have a narrow form here,
    /// even if the instruction set has other 1/4 pairs (e.g., [`Opcode::InvokeStk4`]).
    pub fn narrow(self) -> Option<Self> {
        Some(match self {
            Opcode::Push4 => Opcode::Push1,
            Opcode::LoadScalar4 => Opcode::LoadScalar1,
            Opcode::LoadArray4 => Opcode::LoadArray1,
            Opcode::StoreScalar4 => Opcode::StoreScalar1,
            Opcode::StoreArray4 => Opcode::StoreArray1,
            Opcode::Jump4 => Opcode::Jump1,
            Opcode::JumpTrue4 => Opcode::JumpTrue1,
            Opcode::JumpFalse4 => Opcode::JumpFalse1,
            _ => return None,
        })
    }
    /// Checks if this is a (possibly conditional) jump of either width.
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jump1 | Opcode::Jump4 | Opcode::JumpTrue1 | Opcode::JumpTrue4 | Opcode::JumpFalse1 | Opcode::JumpFalse4)
    }
    /// Checks if this is an unconditional jump of either width.
    pub fn is_unconditional_jump(self) -> bool {
        matches!(self, Opcode::Jump1 | Opcode::Jump4)
    }
}

/// Looks up the encoded length of the instruction starting with the given byte.
/// Returns [`None`] if the byte is not an assigned opcode.
pub fn instruction_len(byte: u8) -> Option<usize> {
    Opcode::from_byte(byte).map(Opcode::num_bytes)
}

#[test]
fn test_narrow_is_one_below_wide() {
    for byte in 0..=u8::MAX {
        let Some(op) = Opcode::from_byte(byte) else { continue };
        if let Some(narrow) = op.narrow() {
            assert_eq!(narrow as u8 + 1, op as u8, "{op:?}");
            assert_eq!(op.num_bytes(), 5);
            assert_eq!(narrow.num_bytes(), 2);
        }
    }
}

#[test]
fn test_instruction_table() {
    let mut assigned = 0;
    for byte in 0..=u8::MAX {
        match Opcode::from_byte(byte) {
            Some(op) => {
                assigned += 1;
                assert_eq!(op as u8, byte);
                let desc = op.desc();
                assert_eq!(desc.num_bytes, 1 + desc.operands.iter().map(|x| x.size()).sum::<usize>());
                assert_eq!(instruction_len(byte), Some(desc.num_bytes));
            }
            None => assert_eq!(instruction_len(byte), None),
        }
    }
    assert_eq!(assigned, Opcode::ReturnStk as usize + 1);

    assert_eq!(Opcode::Nop.num_bytes(), 1);
    assert_eq!(Opcode::StartCmd.num_bytes(), 9);
    assert_eq!(Opcode::JumpTable.num_bytes(), 5);
    assert_eq!(Opcode::ForeachStart.num_bytes(), 5);
}
