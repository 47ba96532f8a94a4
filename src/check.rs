//! Well-formedness checks for a [`CompileEnv`].
//!
//! The optimizer assumes every offset it relocates lands on an instruction boundary.
//! [`CompileEnv::check`] verifies that assumption up front so a broken unit is rejected
//! before any byte is moved, rather than being silently corrupted.

use std::prelude::v1::*;

use crate::codec::*;
use crate::env::*;
use crate::opcode::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedCode {
    #[error("byte {byte:#04x} at {pc} is not an opcode")]
    UnknownOpcode { pc: CodeOffset, byte: u8 },
    #[error("{op:?} at {pc} needs {len} bytes but the code ends at {code_size}")]
    TruncatedInstruction { pc: CodeOffset, op: Opcode, len: usize, code_size: usize },
    #[error("{op:?} at {pc} targets {target}, which is not an instruction boundary")]
    BadJumpTarget { pc: CodeOffset, op: Opcode, target: isize },
    #[error("{op:?} at {pc} refers to aux data {index}, which does not exist")]
    BadAuxIndex { pc: CodeOffset, op: Opcode, index: u32 },
    #[error("{op:?} at {pc} refers to aux data {index}, which is a {found}")]
    AuxKindMismatch { pc: CodeOffset, op: Opcode, index: u32, found: &'static str },
    #[error("exception range {range} refers to {offset}, which is not an instruction boundary")]
    BadRangeOffset { range: usize, offset: CodeOffset },
    #[error("exception range {range} extends past the end of the address space")]
    RangeOverflow { range: usize },
    #[error("command {command} refers to {offset}, which is not an instruction boundary")]
    BadCommandOffset { command: usize, offset: CodeOffset },
}

/// Records which offsets begin an instruction. The end of the code counts as a boundary.
struct Boundaries(Vec<bool>);
impl Boundaries {
    fn contains(&self, offset: CodeOffset) -> bool {
        self.0.get(offset).copied().unwrap_or(false)
    }
    fn contains_signed(&self, offset: isize) -> bool {
        usize::try_from(offset).map(|x| self.contains(x)).unwrap_or(false)
    }
}

impl CompileEnv {
    /// Checks that the code decodes cleanly and that every offset held by the code or its metadata
    /// refers to an instruction boundary (or the end of the code).
    pub fn check(&self) -> Result<(), MalformedCode> {
        let code = self.code.as_slice();
        let code_size = code.len();

        let mut boundaries = Boundaries(vec![false; code_size + 1]);
        boundaries.0[code_size] = true;
        let mut pc = 0;
        while pc < code_size {
            let byte = code[pc];
            let op = Opcode::from_byte(byte).ok_or(MalformedCode::UnknownOpcode { pc, byte })?;
            let len = op.num_bytes();
            if pc + len > code_size {
                return Err(MalformedCode::TruncatedInstruction { pc, op, len, code_size });
            }
            boundaries.0[pc] = true;
            pc += len;
        }

        for (pc, op) in self.instructions() {
            let check_target = |disp: i32| {
                let target = pc as isize + disp as isize;
                match boundaries.contains_signed(target) {
                    true => Ok(()),
                    false => Err(MalformedCode::BadJumpTarget { pc, op, target }),
                }
            };
            match op {
                Opcode::Jump1 | Opcode::JumpTrue1 | Opcode::JumpFalse1 => check_target(get_int1_at(code, pc + 1) as i32)?,
                Opcode::Jump4 | Opcode::JumpTrue4 | Opcode::JumpFalse4 | Opcode::StartCmd => check_target(get_int4_at(code, pc + 1))?,
                Opcode::ForeachStart | Opcode::ForeachStep | Opcode::JumpTable => {
                    let index = get_uint4_at(code, pc + 1);
                    let aux = self.aux_data.get(index as usize).ok_or(MalformedCode::BadAuxIndex { pc, op, index })?;
                    match (op, aux) {
                        (Opcode::ForeachStart, AuxData::Foreach(info)) => {
                            let target = info.loop_target(pc).map(|x| x as isize).unwrap_or(-1);
                            if !boundaries.contains_signed(target) {
                                return Err(MalformedCode::BadJumpTarget { pc, op, target });
                            }
                        }
                        (Opcode::ForeachStep, AuxData::Foreach(_)) => (),
                        (Opcode::JumpTable, AuxData::JumpTable(info)) => {
                            for (_, disp) in info.targets.iter() {
                                check_target(*disp)?;
                            }
                        }
                        (_, aux) => return Err(MalformedCode::AuxKindMismatch { pc, op, index, found: aux.kind_name() }),
                    }
                }
                _ => (),
            }
        }

        for (i, range) in self.except_ranges.iter().enumerate() {
            let end = range.code_offset.checked_add(range.num_code_bytes).ok_or(MalformedCode::RangeOverflow { range: i })?;
            let mut offsets = vec![range.code_offset, end];
            match &range.kind {
                ExceptionRangeKind::Catch { catch_offset } => offsets.push(*catch_offset),
                ExceptionRangeKind::Loop { break_offset, continue_offset } => {
                    offsets.push(*break_offset);
                    offsets.extend(continue_offset);
                }
            }
            if let Some(&offset) = offsets.iter().find(|&&x| !boundaries.contains(x)) {
                return Err(MalformedCode::BadRangeOffset { range: i, offset });
            }
        }

        for (i, cmd) in self.cmd_map.iter().enumerate() {
            for offset in [cmd.code_offset, cmd.end_within(code_size)] {
                if !boundaries.contains(offset) {
                    return Err(MalformedCode::BadCommandOffset { command: i, offset });
                }
            }
        }

        Ok(())
    }
}

#[test]
fn test_check_ok() {
    let mut env = CompileEnv::new(vec![Opcode::Push1 as u8, 0, Opcode::JumpFalse1 as u8, 3, Opcode::Pop as u8, Opcode::Done as u8]);
    env.except_ranges.push(ExceptionRange { nesting_level: 0, code_offset: 2, num_code_bytes: 3, kind: ExceptionRangeKind::Catch { catch_offset: 5 } });
    env.cmd_map.push(CmdLocation { code_offset: 0, num_code_bytes: 100, src_offset: 0, num_src_bytes: 10 });
    env.cmd_map.push(CmdLocation { code_offset: 2, num_code_bytes: usize::MAX, src_offset: 4, num_src_bytes: 3 });
    assert_eq!(env.check(), Ok(()));
}

#[test]
fn test_check_errors() {
    let env = CompileEnv::new(vec![Opcode::Push1 as u8, 0, 0xff]);
    assert_eq!(env.check(), Err(MalformedCode::UnknownOpcode { pc: 2, byte: 0xff }));

    let env = CompileEnv::new(vec![Opcode::Push1 as u8, 0, Opcode::Jump4 as u8, 0]);
    assert_eq!(env.check(), Err(MalformedCode::TruncatedInstruction { pc: 2, op: Opcode::Jump4, len: 5, code_size: 4 }));

    let env = CompileEnv::new(vec![Opcode::Push1 as u8, 0, Opcode::Jump1 as u8, (-1i8) as u8]);
    assert_eq!(env.check(), Err(MalformedCode::BadJumpTarget { pc: 2, op: Opcode::Jump1, target: 1 }));

    let env = CompileEnv::new(vec![Opcode::Jump1 as u8, (-3i8) as u8]);
    assert_eq!(env.check(), Err(MalformedCode::BadJumpTarget { pc: 0, op: Opcode::Jump1, target: -3 }));

    let env = CompileEnv::new(vec![Opcode::JumpTable as u8, 0, 0, 0, 0, Opcode::Done as u8]);
    assert_eq!(env.check(), Err(MalformedCode::BadAuxIndex { pc: 0, op: Opcode::JumpTable, index: 0 }));

    let mut env = CompileEnv::new(vec![Opcode::JumpTable as u8, 0, 0, 0, 0, Opcode::Done as u8]);
    env.aux_data.push(AuxData::Foreach(ForeachInfo { num_lists: 1, first_value_temp: 0, continuation_offset: 5, var_lists: vec![vec![0]] }));
    assert_eq!(env.check(), Err(MalformedCode::AuxKindMismatch { pc: 0, op: Opcode::JumpTable, index: 0, found: "foreach" }));

    let mut env = CompileEnv::new(vec![Opcode::Push4 as u8, 0, 0, 0, 1, Opcode::Done as u8]);
    env.except_ranges.push(ExceptionRange { nesting_level: 0, code_offset: 0, num_code_bytes: 3, kind: ExceptionRangeKind::Loop { break_offset: 5, continue_offset: None } });
    assert_eq!(env.check(), Err(MalformedCode::BadRangeOffset { range: 0, offset: 3 }));

    let mut env = CompileEnv::new(vec![Opcode::Push4 as u8, 0, 0, 0, 1, Opcode::Done as u8]);
    env.except_ranges.push(ExceptionRange { nesting_level: 0, code_offset: 5, num_code_bytes: usize::MAX, kind: ExceptionRangeKind::Catch { catch_offset: 0 } });
    assert_eq!(env.check(), Err(MalformedCode::RangeOverflow { range: 0 }));

    let mut env = CompileEnv::new(vec![Opcode::Push4 as u8, 0, 0, 0, 1, Opcode::ForeachStart as u8, 0, 0, 0, 0, Opcode::Done as u8]);
    env.aux_data.push(AuxData::Foreach(ForeachInfo { num_lists: 1, first_value_temp: 0, continuation_offset: 8, var_lists: vec![vec![0]] }));
    assert_eq!(env.check(), Err(MalformedCode::BadJumpTarget { pc: 5, op: Opcode::ForeachStart, target: 2 }));
    env.aux_data[0] = AuxData::Foreach(ForeachInfo { num_lists: 1, first_value_temp: 0, continuation_offset: 11, var_lists: vec![vec![0]] });
    assert_eq!(env.check(), Err(MalformedCode::BadJumpTarget { pc: 5, op: Opcode::ForeachStart, target: -1 }));

    let mut env = CompileEnv::new(vec![Opcode::Push4 as u8, 0, 0, 0, 1, Opcode::JumpTable as u8, 0, 0, 0, 0, Opcode::Done as u8]);
    env.aux_data.push(AuxData::JumpTable(JumptableInfo { targets: [(compact_str::CompactString::from("a"), 5), (compact_str::CompactString::from("b"), -3)].into_iter().collect() }));
    assert_eq!(env.check(), Err(MalformedCode::BadJumpTarget { pc: 5, op: Opcode::JumpTable, target: 2 }));

    let mut env = CompileEnv::new(vec![Opcode::Push4 as u8, 0, 0, 0, 1, Opcode::Done as u8]);
    env.cmd_map.push(CmdLocation { code_offset: 2, num_code_bytes: 3, src_offset: 0, num_src_bytes: 1 });
    assert_eq!(env.check(), Err(MalformedCode::BadCommandOffset { command: 0, offset: 2 }));
}
