//! Post-codegen compaction of a [`CompileEnv`].
//!
//! Compaction removes [`Opcode::Nop`] padding, shrinks 4-byte-operand instructions to their 1-byte forms
//! where the operand allows it, elides jumps to the next instruction, and relocates every offset that points
//! into the code (jump displacements, exception ranges, foreach continuations, jump tables, and the command map).
//!
//! Each compaction pass works in two walks over the buffer:
//! 1. [`build_position_map`] narrows what it can in place and computes where every instruction will end up.
//! 2. [`relocate_code`] fixes up displacements against that map and moves instructions down,
//!    after which [`relocate_metadata`] rewrites the tables that live outside the buffer.
//!
//! Relocation can itself create new no-ops (a jump that now lands on the next instruction, or one that now fits
//! in a single byte), so [`optimize_bytecode`] repeats passes until one produces no no-ops at all.

use std::prelude::v1::*;
use core::panic;

use tracing::{debug, trace};

use crate::codec::*;
use crate::env::*;
use crate::opcode::*;

/// Marks position map entries that do not begin an instruction.
const UNMAPPED: CodeOffset = CodeOffset::MAX;

/// Old-offset to new-offset table produced by one compaction pass.
///
/// There is one entry per old byte offset plus a sentinel for the end of the code.
/// Only instruction boundaries are mapped; looking up any other offset is an invariant violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionMap {
    new_pos: Vec<CodeOffset>,
}
impl PositionMap {
    fn new(code_size: usize) -> Self {
        Self { new_pos: vec![UNMAPPED; code_size + 1] }
    }
    /// Gets the new offset of the instruction that started at `old`.
    /// Panics if `old` was not an instruction boundary.
    pub fn get(&self, old: CodeOffset) -> CodeOffset {
        match self.new_pos.get(old) {
            Some(&new) if new != UNMAPPED => new,
            _ => panic!("offset {old} is not an instruction boundary"),
        }
    }
    /// Length of the code once this pass has been applied.
    pub fn new_code_size(&self) -> usize {
        self.get(self.new_pos.len() - 1)
    }
    /// Computes the relocated displacement from the instruction at `pc` to the one at `target` (both old offsets).
    fn displacement(&self, pc: CodeOffset, target: CodeOffset) -> i32 {
        let (from, to) = (self.get(pc) as i64, self.get(target) as i64);
        match i32::try_from(to - from) {
            Ok(x) => x,
            Err(_) => panic!("displacement from {pc} to {target} does not fit in 4 bytes"),
        }
    }
}

fn target_of(pc: CodeOffset, displacement: i32) -> CodeOffset {
    match jump_target(pc, displacement) {
        Some(x) => x,
        None => panic!("instruction at {pc} has out of range displacement {displacement}"),
    }
}

/// Rewrites the 4-byte-operand instruction at `pc` into its 1-byte form and pads the freed bytes with no-ops.
fn narrow_in_place(code: &mut [u8], pc: CodeOffset, op: Opcode, operand: u8) {
    let narrow = match op.narrow() {
        Some(x) => x,
        None => unreachable!("{op:?} has no narrow form"),
    };
    set_opcode_at(code, pc, narrow);
    set_uint1_at(code, pc + 1, operand);
    code[pc + 2..pc + op.num_bytes()].fill(Opcode::Nop as u8);
}

/// Replaces the jump at `pc` (whose target is the next instruction) with no-ops.
/// A conditional jump still has to discard the tested value, so its opcode becomes [`Opcode::Pop`].
/// Returns the number of no-ops introduced.
fn elide_jump(code: &mut [u8], pc: CodeOffset, op: Opcode) -> usize {
    let len = op.num_bytes();
    code[pc + 1..pc + len].fill(Opcode::Nop as u8);
    if op.is_unconditional_jump() {
        set_opcode_at(code, pc, Opcode::Nop);
        len
    } else {
        set_opcode_at(code, pc, Opcode::Pop);
        len - 1
    }
}

/// First walk of a compaction pass.
///
/// Narrows every wide push/load/store whose unsigned operand fits in a byte and every wide jump whose displacement fits
/// in a signed byte, replacing the freed bytes with no-ops. The freed bytes are then visited as no-ops by this same walk,
/// so they are counted here as well. Returns the position map (sentinel included) and the number of no-ops seen.
pub fn build_position_map(code: &mut [u8]) -> (PositionMap, usize) {
    let code_size = code.len();
    let mut map = PositionMap::new(code_size);
    let mut nops = 0;

    let mut pc = 0;
    while pc < code_size {
        let op = opcode_at(code, pc);
        let mut next_pc = pc + op.num_bytes();
        assert!(next_pc <= code_size, "instruction {op:?} at {pc} runs past the end of the code");
        map.new_pos[pc] = pc - nops;

        let narrow_operand = match op {
            Opcode::Nop => {
                nops += 1;
                None
            }
            Opcode::Push4 | Opcode::LoadScalar4 | Opcode::LoadArray4 | Opcode::StoreScalar4 | Opcode::StoreArray4 => {
                u8::try_from(get_uint4_at(code, pc + 1)).ok()
            }
            Opcode::Jump4 | Opcode::JumpTrue4 | Opcode::JumpFalse4 => {
                i8::try_from(get_int4_at(code, pc + 1)).ok().map(|x| x as u8)
            }
            _ => None,
        };

        if let Some(operand) = narrow_operand {
            narrow_in_place(code, pc, op, operand);
            next_pc = pc + 2;
        }
        pc = next_pc;
    }
    map.new_pos[code_size] = code_size - nops;

    (map, nops)
}

/// Second walk of a compaction pass.
///
/// Rewrites every displacement held by an instruction (or by the aux data it references) against `map`,
/// then moves the instruction down to its new position. Jumps that now target the next instruction are elided,
/// and wide jumps whose relocated displacement fits in a signed byte are narrowed; both leave no-ops behind for the next pass.
/// The code is truncated to the new length. Returns the number of no-ops introduced.
pub fn relocate_code(env: &mut CompileEnv, map: &PositionMap) -> usize {
    let code_size = env.code.len();
    let mut nops = 0;

    let mut pc = 0;
    while pc < code_size {
        let op = opcode_at(&env.code, pc);
        let next_pc = pc + op.num_bytes();
        if op == Opcode::Nop {
            pc = next_pc;
            continue;
        }

        match op {
            Opcode::Jump1 | Opcode::JumpTrue1 | Opcode::JumpFalse1 => {
                let target = target_of(pc, get_int1_at(&env.code, pc + 1) as i32);
                let offset = map.displacement(pc, target);
                if offset == op.num_bytes() as i32 {
                    trace!(pc, ?op, "eliding jump to next instruction");
                    nops += elide_jump(&mut env.code, pc, op);
                } else {
                    match i8::try_from(offset) {
                        Ok(x) => set_int1_at(&mut env.code, pc + 1, x),
                        Err(_) => panic!("relocated displacement {offset} of {op:?} at {pc} grew past 1 byte"),
                    }
                }
            }
            Opcode::Jump4 | Opcode::JumpTrue4 | Opcode::JumpFalse4 | Opcode::StartCmd => {
                let target = target_of(pc, get_int4_at(&env.code, pc + 1));
                let offset = map.displacement(pc, target);
                set_int4_at(&mut env.code, pc + 1, offset);
                if op != Opcode::StartCmd {
                    if offset == op.num_bytes() as i32 {
                        trace!(pc, ?op, "eliding jump to next instruction");
                        nops += elide_jump(&mut env.code, pc, op);
                    } else if let Ok(x) = i8::try_from(offset) {
                        trace!(pc, ?op, offset, "narrowing relocated jump");
                        narrow_in_place(&mut env.code, pc, op, x as u8);
                        nops += op.num_bytes() - 2;
                    }
                }
            }
            Opcode::ForeachStart => {
                let index = get_uint4_at(&env.code, pc + 1);
                let info = env.foreach_info_mut(index);
                let target = match info.loop_target(pc) {
                    Some(x) => x,
                    None => panic!("foreach at {pc} has out of range continuation offset {}", info.continuation_offset),
                };
                let (from, to) = ((map.get(pc) + op.num_bytes()) as i64, map.get(target) as i64);
                info.continuation_offset = match i32::try_from(from - to) {
                    Ok(x) => x,
                    Err(_) => panic!("relocated continuation offset of foreach at {pc} does not fit in 4 bytes"),
                };
            }
            Opcode::JumpTable => {
                let index = get_uint4_at(&env.code, pc + 1);
                let info = env.jumptable_info_mut(index);
                for disp in info.targets.values_mut() {
                    *disp = map.displacement(pc, target_of(pc, *disp));
                }
            }
            _ => (),
        }

        env.code.copy_within(pc..next_pc, map.get(pc));
        pc = next_pc;
    }
    env.code.truncate(map.new_code_size());

    nops
}

/// Rewrites the exception ranges and the command map against `map`.
///
/// `old_code_size` is the length of the code before this pass; command spans that overrun it are clamped to it before mapping.
pub fn relocate_metadata(env: &mut CompileEnv, map: &PositionMap, old_code_size: usize) {
    for range in env.except_ranges.iter_mut() {
        let (start, end) = (map.get(range.code_offset), map.get(range.end()));
        range.code_offset = start;
        range.num_code_bytes = end - start;

        match &mut range.kind {
            ExceptionRangeKind::Catch { catch_offset } => *catch_offset = map.get(*catch_offset),
            ExceptionRangeKind::Loop { break_offset, continue_offset } => {
                *break_offset = map.get(*break_offset);
                if let Some(continue_offset) = continue_offset {
                    *continue_offset = map.get(*continue_offset);
                }
            }
        }
    }

    for cmd in env.cmd_map.iter_mut() {
        let (start, end) = (map.get(cmd.code_offset), map.get(cmd.end_within(old_code_size)));
        cmd.code_offset = start;
        cmd.num_code_bytes = end - start;
    }
}

/// Result of [`optimize_bytecode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeSummary {
    /// Number of compaction passes started, including the final one that found nothing to do.
    pub passes: usize,
    pub old_size: usize,
    pub new_size: usize,
}

enum Phase {
    Compacting,
    Done,
}

/// Compacts the code of `env` and relocates all of its metadata, repeating until a fixed point is reached.
///
/// The unit must be well-formed (see [`CompileEnv::check`]); a malformed unit is a compiler bug and causes a panic.
pub fn optimize_bytecode(env: &mut CompileEnv) -> OptimizeSummary {
    if let Err(e) = env.check() {
        panic!("refusing to optimize malformed bytecode: {e}");
    }

    let old_size = env.code.len();
    // every pass that does not finish removes at least one byte
    let max_passes = old_size + 1;

    let mut passes = 0;
    let mut phase = Phase::Compacting;
    while let Phase::Compacting = phase {
        passes += 1;
        assert!(passes <= max_passes, "compaction did not converge after {max_passes} passes");

        let code_size = env.code.len();
        let (map, nops) = build_position_map(&mut env.code);
        debug!(pass = passes, code_size, nops, "computed position map");
        if nops == 0 {
            phase = Phase::Done;
            continue;
        }

        let new_nops = relocate_code(env, &map);
        relocate_metadata(env, &map, code_size);
        debug!(pass = passes, new_code_size = env.code.len(), new_nops, "relocated code");
        debug_assert_eq!(env.check(), Ok(()));
    }

    let summary = OptimizeSummary { passes, old_size, new_size: env.code.len() };
    debug!(?summary, "bytecode optimized");
    summary
}
