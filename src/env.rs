//! The compilation unit handed to the optimizer: code buffer plus every table that points into it.

use std::prelude::v1::*;
use core::panic;

#[cfg(feature = "std")]
use std::io::{self, Write};

#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

use compact_str::CompactString;
use superslice::Ext;

use crate::codec::*;
use crate::opcode::*;
use crate::vecmap::VecMap;

/// Number of bytes to display on each line of a hex dump
#[cfg(feature = "std")]
const BYTES_PER_LINE: usize = 5;

/// What an [`ExceptionRange`] hands control to.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExceptionRangeKind {
    /// A loop body. `break` exits to `break_offset`; `continue` resumes at `continue_offset` if the loop has one.
    Loop { break_offset: CodeOffset, continue_offset: Option<CodeOffset> },
    /// A `catch` body. Errors raised inside resume at `catch_offset`.
    Catch { catch_offset: CodeOffset },
}

/// A contiguous code region `[code_offset, code_offset + num_code_bytes)` with its handler targets.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExceptionRange {
    pub nesting_level: u32,
    pub code_offset: CodeOffset,
    pub num_code_bytes: usize,
    pub kind: ExceptionRangeKind,
}
impl ExceptionRange {
    /// First offset after the range.
    pub fn end(&self) -> CodeOffset {
        self.code_offset.saturating_add(self.num_code_bytes)
    }
}

/// Auxiliary data for a [`Opcode::ForeachStart`] / [`Opcode::ForeachStep`] pair.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ForeachInfo {
    pub num_lists: u32,
    pub first_value_temp: u32,
    /// Distance from the end of the [`Opcode::ForeachStart`] instruction back to the loop test.
    pub continuation_offset: i32,
    pub var_lists: Vec<Vec<u32>>,
}
impl ForeachInfo {
    /// Resolves the loop test address for the [`Opcode::ForeachStart`] instruction at `pc`.
    pub fn loop_target(&self, pc: CodeOffset) -> Option<CodeOffset> {
        jump_target(pc + Opcode::ForeachStart.num_bytes(), self.continuation_offset.checked_neg()?)
    }
}

/// Auxiliary data for a [`Opcode::JumpTable`] instruction.
/// Each arm maps a discriminant to a displacement relative to the jump table instruction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct JumptableInfo {
    pub targets: VecMap<CompactString, i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AuxData {
    Foreach(ForeachInfo),
    JumpTable(JumptableInfo),
}
impl AuxData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            AuxData::Foreach(_) => "foreach",
            AuxData::JumpTable(_) => "jump table",
        }
    }
}

/// The code span and source span of a single source-level command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CmdLocation {
    pub code_offset: CodeOffset,
    pub num_code_bytes: usize,
    pub src_offset: usize,
    pub num_src_bytes: usize,
}
impl CmdLocation {
    /// First offset after the command's code span, clamped to `code_size`.
    pub fn end_within(&self, code_size: usize) -> CodeOffset {
        self.code_offset.saturating_add(self.num_code_bytes).min(code_size)
    }
}

/// A compiled unit: the bytecode buffer and every structure that refers to offsets within it.
///
/// The logical length of the code is `code.len()`.
/// Aux data is referenced from instructions by index and is never added or removed by the optimizer.
/// The command map is ordered by `code_offset`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CompileEnv {
    pub code: Vec<u8>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub except_ranges: Vec<ExceptionRange>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub aux_data: Vec<AuxData>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub cmd_map: Vec<CmdLocation>,
}

/// Iterator over the `(pc, opcode)` pairs of a code buffer. See [`CompileEnv::instructions`].
pub struct Instructions<'a> {
    code: &'a [u8],
    pc: CodeOffset,
}
impl Iterator for Instructions<'_> {
    type Item = (CodeOffset, Opcode);
    fn next(&mut self) -> Option<Self::Item> {
        if self.pc >= self.code.len() { return None }
        let pc = self.pc;
        let op = opcode_at(self.code, pc);
        self.pc += op.num_bytes();
        assert!(self.pc <= self.code.len(), "instruction {op:?} at {pc} runs past the end of the code");
        Some((pc, op))
    }
}

impl CompileEnv {
    pub fn new(code: Vec<u8>) -> Self {
        Self { code, ..Default::default() }
    }
    /// Decodes the code buffer instruction by instruction.
    /// Panics if the buffer does not decode cleanly.
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions { code: &self.code, pc: 0 }
    }
    /// Fetches the foreach descriptor at `index`.
    /// Panics if the index is out of bounds or refers to other aux data.
    pub fn foreach_info(&self, index: u32) -> &ForeachInfo {
        match self.aux_data.get(index as usize) {
            Some(AuxData::Foreach(x)) => x,
            Some(x) => panic!("aux data {index} is a {}, expected foreach", x.kind_name()),
            None => panic!("aux data index {index} is out of bounds"),
        }
    }
    /// Mutable version of [`CompileEnv::foreach_info`].
    pub fn foreach_info_mut(&mut self, index: u32) -> &mut ForeachInfo {
        match self.aux_data.get_mut(index as usize) {
            Some(AuxData::Foreach(x)) => x,
            Some(x) => panic!("aux data {index} is a {}, expected foreach", x.kind_name()),
            None => panic!("aux data index {index} is out of bounds"),
        }
    }
    /// Fetches the jump table descriptor at `index`.
    /// Panics if the index is out of bounds or refers to other aux data.
    pub fn jumptable_info_mut(&mut self, index: u32) -> &mut JumptableInfo {
        match self.aux_data.get_mut(index as usize) {
            Some(AuxData::JumpTable(x)) => x,
            Some(x) => panic!("aux data {index} is a {}, expected jump table", x.kind_name()),
            None => panic!("aux data index {index} is out of bounds"),
        }
    }
    /// Looks up the innermost command whose code span contains `pc`.
    /// Returns the command's index in the command map along with its location.
    pub fn command_at(&self, pc: CodeOffset) -> Option<(usize, &CmdLocation)> {
        let candidates = self.cmd_map.upper_bound_by_key(&pc, |x| x.code_offset);
        let mut best: Option<(usize, &CmdLocation)> = None;
        for (i, cmd) in self.cmd_map[..candidates].iter().enumerate() {
            if pc >= cmd.code_offset.saturating_add(cmd.num_code_bytes) { continue }
            if best.map(|(_, b)| cmd.num_code_bytes <= b.num_code_bytes).unwrap_or(true) {
                best = Some((i, cmd));
            }
        }
        best
    }
    /// Generates a disassembly of the code, including addresses, raw bytes, decoded operands, and resolved jump targets.
    #[cfg(feature = "std")]
    pub fn dump_code(&self, f: &mut dyn Write) -> io::Result<()> {
        for (pc, op) in self.instructions() {
            let desc = op.desc();
            let bytes = &self.code[pc..pc + desc.num_bytes];
            for (i, chunk) in bytes.chunks(BYTES_PER_LINE).enumerate() {
                if i == 0 {
                    write!(f, "{pc:08}   ")?;
                } else {
                    write!(f, "           ")?;
                }

                for &b in chunk {
                    write!(f, " {b:02x}")?;
                }
                for _ in chunk.len()..BYTES_PER_LINE {
                    write!(f, "   ")?;
                }

                if i == 0 {
                    write!(f, "    {}", desc.name)?;
                    let mut operand_pc = pc + 1;
                    for operand in desc.operands {
                        match operand {
                            OperandType::Int1 => write!(f, " {}", get_int1_at(&self.code, operand_pc))?,
                            OperandType::Int4 => write!(f, " {}", get_int4_at(&self.code, operand_pc))?,
                            OperandType::UInt1 => write!(f, " {}", get_uint1_at(&self.code, operand_pc))?,
                            OperandType::UInt4 => write!(f, " {}", get_uint4_at(&self.code, operand_pc))?,
                            OperandType::Lit1 => write!(f, " lit#{}", get_uint1_at(&self.code, operand_pc))?,
                            OperandType::Lit4 => write!(f, " lit#{}", get_uint4_at(&self.code, operand_pc))?,
                            OperandType::Lvt1 => write!(f, " %v{}", get_uint1_at(&self.code, operand_pc))?,
                            OperandType::Lvt4 => write!(f, " %v{}", get_uint4_at(&self.code, operand_pc))?,
                            OperandType::Aux4 => write!(f, " aux#{}", get_uint4_at(&self.code, operand_pc))?,
                            OperandType::Offset1 | OperandType::Offset4 => {
                                let disp = match operand {
                                    OperandType::Offset1 => get_int1_at(&self.code, operand_pc) as i32,
                                    _ => get_int4_at(&self.code, operand_pc),
                                };
                                match jump_target(pc, disp) {
                                    Some(target) => write!(f, " {disp:+} (pc {target})")?,
                                    None => write!(f, " {disp:+} (pc ?)")?,
                                }
                            }
                        }
                        operand_pc += operand.size();
                    }
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
    /// Generates a listing of the exception ranges, aux data, and command map.
    #[cfg(feature = "std")]
    pub fn dump_metadata(&self, f: &mut dyn Write) -> io::Result<()> {
        for (i, range) in self.except_ranges.iter().enumerate() {
            write!(f, "range {i} level {} [{}, {})", range.nesting_level, range.code_offset, range.code_offset.saturating_add(range.num_code_bytes))?;
            match &range.kind {
                ExceptionRangeKind::Catch { catch_offset } => writeln!(f, " catch -> {catch_offset}")?,
                ExceptionRangeKind::Loop { break_offset, continue_offset: Some(continue_offset) } => writeln!(f, " loop break -> {break_offset} continue -> {continue_offset}")?,
                ExceptionRangeKind::Loop { break_offset, continue_offset: None } => writeln!(f, " loop break -> {break_offset}")?,
            }
        }
        for (i, aux) in self.aux_data.iter().enumerate() {
            match aux {
                AuxData::Foreach(info) => writeln!(f, "aux {i} foreach lists {} continuation -{}", info.num_lists, info.continuation_offset)?,
                AuxData::JumpTable(info) => {
                    write!(f, "aux {i} jump table")?;
                    for (key, disp) in info.targets.iter() {
                        write!(f, " {key:?}:{disp:+}")?;
                    }
                    writeln!(f)?;
                }
            }
        }
        for (i, cmd) in self.cmd_map.iter().enumerate() {
            writeln!(f, "command {i} code [{}, {}) source [{}, {})", cmd.code_offset, cmd.end_within(self.code.len()), cmd.src_offset, cmd.src_offset.saturating_add(cmd.num_src_bytes))?;
        }
        Ok(())
    }
}

#[test]
fn test_command_at_innermost() {
    let mut env = CompileEnv::new(vec![Opcode::Nop as u8; 20]);
    env.cmd_map = vec![
        CmdLocation { code_offset: 0, num_code_bytes: 20, src_offset: 0, num_src_bytes: 30 },
        CmdLocation { code_offset: 4, num_code_bytes: 6, src_offset: 5, num_src_bytes: 10 },
        CmdLocation { code_offset: 12, num_code_bytes: 3, src_offset: 18, num_src_bytes: 4 },
    ];
    assert_eq!(env.command_at(0).map(|x| x.0), Some(0));
    assert_eq!(env.command_at(3).map(|x| x.0), Some(0));
    assert_eq!(env.command_at(4).map(|x| x.0), Some(1));
    assert_eq!(env.command_at(9).map(|x| x.0), Some(1));
    assert_eq!(env.command_at(10).map(|x| x.0), Some(0));
    assert_eq!(env.command_at(14).map(|x| x.0), Some(2));
    assert_eq!(env.command_at(19).map(|x| x.0), Some(0));
    assert_eq!(env.command_at(20).map(|x| x.0), None);
}

#[test]
fn test_instructions_decode() {
    let env = CompileEnv::new(vec![Opcode::Push1 as u8, 3, Opcode::Nop as u8, Opcode::Jump4 as u8, 0xff, 0xff, 0xff, 0xfd, Opcode::Done as u8]);
    assert_eq!(env.instructions().collect::<Vec<_>>(), [(0, Opcode::Push1), (2, Opcode::Nop), (3, Opcode::Jump4), (8, Opcode::Done)]);
}

#[test]
#[should_panic(expected = "runs past the end")]
fn test_instructions_truncated() {
    let env = CompileEnv::new(vec![Opcode::Push4 as u8, 0, 0]);
    env.instructions().for_each(drop);
}

#[cfg(feature = "std")]
#[test]
fn test_dump_code() {
    let env = CompileEnv::new(vec![Opcode::Push1 as u8, 3, Opcode::Jump1 as u8, (-2i8) as u8, Opcode::Done as u8]);
    let mut out = Vec::new();
    env.dump_code(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("00000000    01 03 ") && lines[0].ends_with("push1 lit#3"), "{out}");
    assert!(lines[1].starts_with("00000002    18 fe ") && lines[1].ends_with("jump1 -2 (pc 0)"), "{out}");
    assert!(lines[2].starts_with("00000004    00 ") && lines[2].ends_with("done"), "{out}");
}

#[cfg(feature = "std")]
#[test]
fn test_dump_metadata() {
    let mut env = CompileEnv::new(vec![Opcode::Nop as u8; 10]);
    env.except_ranges = vec![
        ExceptionRange { nesting_level: 1, code_offset: 0, num_code_bytes: 5, kind: ExceptionRangeKind::Catch { catch_offset: 5 } },
        ExceptionRange { nesting_level: 0, code_offset: 0, num_code_bytes: 6, kind: ExceptionRangeKind::Loop { break_offset: 6, continue_offset: None } },
        ExceptionRange { nesting_level: 2, code_offset: 1, num_code_bytes: 3, kind: ExceptionRangeKind::Loop { break_offset: 4, continue_offset: Some(1) } },
    ];
    env.aux_data = vec![
        AuxData::Foreach(ForeachInfo { num_lists: 2, first_value_temp: 0, continuation_offset: 3, var_lists: vec![vec![0], vec![1]] }),
        AuxData::JumpTable(JumptableInfo { targets: [(CompactString::from("b"), -2), (CompactString::from("a"), 5)].into_iter().collect() }),
    ];
    env.cmd_map = vec![CmdLocation { code_offset: 0, num_code_bytes: usize::MAX, src_offset: 2, num_src_bytes: 7 }];

    let mut out = Vec::new();
    env.dump_metadata(&mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "\
range 0 level 1 [0, 5) catch -> 5
range 1 level 0 [0, 6) loop break -> 6
range 2 level 2 [1, 4) loop break -> 4 continue -> 1
aux 0 foreach lists 2 continuation -3
aux 1 jump table \"a\":+5 \"b\":-2
command 0 code [0, 10) source [2, 9)
");
}
