use std::prelude::v1::*;

use crate::*;
use crate::codec::*;

mod optimize;
mod randomized;

const NOP: u8 = Opcode::Nop as u8;
const DONE: u8 = Opcode::Done as u8;
const DUP: u8 = Opcode::Dup as u8;
const POP: u8 = Opcode::Pop as u8;

/// Call at the start of a test to see the optimizer's log output (filtered by `RUST_LOG`).
fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// Emits a marker instruction: a wide scalar load whose operand identifies the position.
/// Markers survive compaction (possibly narrowed), so they can be used to check where offsets land.
fn marker(asm: &mut Assembler, id: u32) -> &mut Assembler {
    asm.op4(Opcode::LoadScalar4, id)
}

/// Reads the marker id at `pc`, if there is a marker instruction there.
fn marker_at(env: &CompileEnv, pc: CodeOffset) -> Option<u32> {
    if pc >= env.code.len() { return None }
    match opcode_at(&env.code, pc) {
        Opcode::LoadScalar1 => Some(get_uint1_at(&env.code, pc + 1) as u32),
        Opcode::LoadScalar4 => Some(get_uint4_at(&env.code, pc + 1)),
        _ => None,
    }
}

/// Lists every jump instruction along with its resolved target.
fn jumps(env: &CompileEnv) -> Vec<(CodeOffset, Opcode, CodeOffset)> {
    env.instructions().filter_map(|(pc, op)| {
        let disp = match op {
            Opcode::Jump1 | Opcode::JumpTrue1 | Opcode::JumpFalse1 => get_int1_at(&env.code, pc + 1) as i32,
            Opcode::Jump4 | Opcode::JumpTrue4 | Opcode::JumpFalse4 => get_int4_at(&env.code, pc + 1),
            _ => return None,
        };
        Some((pc, op, jump_target(pc, disp).unwrap()))
    }).collect()
}

/// Optimizes a copy of `env`, checking the invariants every optimized unit must satisfy.
fn optimized(env: &CompileEnv) -> (CompileEnv, OptimizeSummary) {
    let mut res = env.clone();
    let summary = optimize_bytecode(&mut res);
    assert_eq!(res.check(), Ok(()));
    assert!(summary.new_size <= summary.old_size);
    assert_eq!(summary.old_size, env.code.len());
    assert_eq!(summary.new_size, res.code.len());
    assert_eq!(res.aux_data.len(), env.aux_data.len());
    assert_eq!(res.except_ranges.len(), env.except_ranges.len());
    assert_eq!(res.cmd_map.len(), env.cmd_map.len());
    (res, summary)
}
