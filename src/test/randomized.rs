use std::prelude::v1::*;
use core::panic;

use rand::prelude::*;
use rand::rngs::StdRng;

use pretty_assertions::assert_eq;

use super::*;

const ARM_KEYS: [&str; 3] = ["x", "y", "z"];

/// Generates a random well-formed unit made of marked blocks.
///
/// Every block starts with a unique marker and every label is bound at one, so each offset in the unit
/// can be identified by the marker it lands on. Each jump is followed by a [`Opcode::Dup`] so no jump
/// ever targets the instruction right after it, which keeps every jump alive through compaction.
fn random_unit(rng: &mut StdRng) -> CompileEnv {
    let mut asm = Assembler::new();
    let blocks = rng.gen_range(1..40usize);
    let labels: Vec<Label> = (0..=blocks).map(|_| asm.new_label()).collect();
    let random_label = |rng: &mut StdRng| labels[rng.gen_range(0..=blocks)];

    for (block, &label) in labels.iter().enumerate() {
        asm.bind(label);
        marker(&mut asm, block as u32 * 13);
        if block == blocks { break }

        for _ in 0..rng.gen_range(0..6) {
            match rng.gen_range(0..6) {
                0 => for _ in 0..rng.gen_range(1..150) {
                    asm.op(Opcode::Nop);
                }
                1 => { asm.push(rng.gen_range(0..600)); }
                2 => { asm.op(Opcode::Dup); }
                3 => {
                    let op = *[Opcode::Jump4, Opcode::JumpTrue4, Opcode::JumpFalse4].choose(rng).unwrap();
                    asm.jump(op, random_label(rng)).op(Opcode::Dup);
                }
                4 => {
                    let arms: Vec<(&str, Label)> = (0..rng.gen_range(1..=ARM_KEYS.len())).map(|i| (ARM_KEYS[i], random_label(rng))).collect();
                    asm.jump_table(arms);
                    asm.op(Opcode::Dup);
                }
                _ => {
                    asm.foreach_start(1, 0, vec![vec![0]], random_label(rng));
                }
            }
        }
    }
    asm.op(Opcode::Done);

    for level in 0..rng.gen_range(0..4) {
        let (mut start, mut end) = (rng.gen_range(0..=blocks), rng.gen_range(0..=blocks));
        if start > end { core::mem::swap(&mut start, &mut end) }
        if rng.gen() {
            asm.catch_range(level, labels[start], labels[end], random_label(rng));
        } else {
            let continue_label = rng.gen::<bool>().then(|| random_label(rng));
            asm.loop_range(level, labels[start], labels[end], random_label(rng), continue_label);
        }
    }

    asm.command(labels[0], labels[blocks], 0, blocks * 10);
    for block in 0..blocks {
        asm.command(labels[block], labels[block + 1], block * 10, 10);
    }

    let mut env = asm.finish();
    if let Some(last) = env.cmd_map.last_mut() {
        last.num_code_bytes += 50;
    }
    env
}

/// Resolves every offset held by the unit to the marker it lands on (`None` for the end of the code).
fn landmarks(env: &CompileEnv) -> Vec<(&'static str, Option<u32>)> {
    let mut res = vec![];
    for (_, _, target) in jumps(env) {
        res.push(("jump", marker_at(env, target)));
    }
    for (pc, op) in env.instructions() {
        match op {
            Opcode::ForeachStart => {
                let info = env.foreach_info(get_uint4_at(&env.code, pc + 1));
                res.push(("foreach", marker_at(env, info.loop_target(pc).unwrap())));
            }
            Opcode::JumpTable => match &env.aux_data[get_uint4_at(&env.code, pc + 1) as usize] {
                AuxData::JumpTable(info) => for (_, &disp) in info.targets.iter() {
                    res.push(("arm", marker_at(env, jump_target(pc, disp).unwrap())));
                }
                x => panic!("{x:?}"),
            }
            _ => (),
        }
    }
    for range in env.except_ranges.iter() {
        res.push(("range start", marker_at(env, range.code_offset)));
        res.push(("range end", marker_at(env, range.end())));
        match range.kind {
            ExceptionRangeKind::Catch { catch_offset } => res.push(("catch", marker_at(env, catch_offset))),
            ExceptionRangeKind::Loop { break_offset, continue_offset } => {
                res.push(("break", marker_at(env, break_offset)));
                res.push(("continue", continue_offset.and_then(|x| marker_at(env, x))));
            }
        }
    }
    for cmd in env.cmd_map.iter() {
        res.push(("command start", marker_at(env, cmd.code_offset)));
        res.push(("command end", marker_at(env, cmd.end_within(env.code.len()))));
    }
    res
}

/// Checks that another pass could not shrink anything.
fn assert_fully_compacted(env: &CompileEnv) {
    for (pc, op) in env.instructions() {
        match op {
            Opcode::Nop => panic!("no-op left at {pc}"),
            Opcode::Push4 | Opcode::LoadScalar4 | Opcode::LoadArray4 | Opcode::StoreScalar4 | Opcode::StoreArray4 => {
                assert!(get_uint4_at(&env.code, pc + 1) > u8::MAX as u32, "{op:?} at {pc} could be narrowed");
            }
            Opcode::Jump4 | Opcode::JumpTrue4 | Opcode::JumpFalse4 => {
                assert!(i8::try_from(get_int4_at(&env.code, pc + 1)).is_err(), "{op:?} at {pc} could be narrowed");
            }
            _ => (),
        }
    }
}

#[test]
fn test_random_units() {
    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let env = random_unit(&mut rng);
        assert_eq!(env.check(), Ok(()));

        let (once, summary) = optimized(&env);
        assert_eq!(landmarks(&once), landmarks(&env), "seed {seed}");
        assert_eq!(jumps(&once).len(), jumps(&env).len());
        assert_eq!(once.instructions().filter(|x| x.1 != Opcode::Nop).count(), env.instructions().filter(|x| x.1 != Opcode::Nop).count());
        assert!(summary.passes <= summary.old_size + 1);
        assert_fully_compacted(&once);

        let (twice, summary) = optimized(&once);
        assert_eq!(twice, once, "seed {seed}");
        assert_eq!(summary.passes, 1);
    }
}
