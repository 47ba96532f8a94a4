use std::prelude::v1::*;

use pretty_assertions::assert_eq;

use super::*;
use crate::optimize::*;

fn wide(op: Opcode, operand: u32) -> Vec<u8> {
    [vec![op as u8], operand.to_be_bytes().to_vec()].concat()
}
fn wide_jump(op: Opcode, disp: i32) -> Vec<u8> {
    [vec![op as u8], disp.to_be_bytes().to_vec()].concat()
}

#[test]
fn test_build_position_map() {
    let mut code = [vec![NOP], wide(Opcode::Push4, 7), vec![DONE]].concat();
    let (map, nops) = build_position_map(&mut code);
    assert_eq!(nops, 4);
    assert_eq!(code, [NOP, Opcode::Push1 as u8, 7, NOP, NOP, NOP, DONE]);
    assert_eq!(map.get(0), 0);
    assert_eq!(map.get(1), 0);
    assert_eq!(map.get(3), 2);
    assert_eq!(map.get(5), 2);
    assert_eq!(map.get(6), 2);
    assert_eq!(map.get(7), 3);
    assert_eq!(map.new_code_size(), 3);

    let mut env = CompileEnv::new(code);
    assert_eq!(relocate_code(&mut env, &map), 0);
    assert_eq!(env.code, [Opcode::Push1 as u8, 7, DONE]);
}

#[test]
#[should_panic(expected = "not an instruction boundary")]
fn test_position_map_operand_lookup() {
    let mut code = [wide(Opcode::Push4, 7), vec![DONE]].concat();
    let (map, _) = build_position_map(&mut code);
    assert_eq!(code, [Opcode::Push1 as u8, 7, NOP, NOP, NOP, DONE]);
    map.get(1);
}

#[test]
fn test_push_narrowing() {
    init_test_logging();
    let env = CompileEnv::new([wide(Opcode::Push4, 255), wide(Opcode::Push4, 256), wide(Opcode::Push4, 0), wide(Opcode::Push4, u32::MAX), vec![DONE]].concat());
    let (env, summary) = optimized(&env);
    assert_eq!(env.code, [vec![Opcode::Push1 as u8, 255], wide(Opcode::Push4, 256), vec![Opcode::Push1 as u8, 0], wide(Opcode::Push4, u32::MAX), vec![DONE]].concat());
    assert_eq!(summary, OptimizeSummary { passes: 2, old_size: 21, new_size: 15 });
}

#[test]
fn test_load_store_narrowing() {
    let env = CompileEnv::new([
        wide(Opcode::LoadScalar4, 3),
        wide(Opcode::LoadArray4, 4),
        wide(Opcode::StoreScalar4, 5),
        wide(Opcode::StoreArray4, 6),
        wide(Opcode::InvokeStk4, 2),
        wide(Opcode::StoreScalar4, 256),
        vec![DONE],
    ].concat());
    let (env, _) = optimized(&env);
    assert_eq!(env.code, [
        vec![Opcode::LoadScalar1 as u8, 3, Opcode::LoadArray1 as u8, 4, Opcode::StoreScalar1 as u8, 5, Opcode::StoreArray1 as u8, 6],
        wide(Opcode::InvokeStk4, 2),
        wide(Opcode::StoreScalar4, 256),
        vec![DONE],
    ].concat());
}

#[test]
fn test_jump_narrowing_thresholds() {
    for op in [Opcode::Jump4, Opcode::JumpTrue4, Opcode::JumpFalse4] {
        let narrow = op.narrow().unwrap() as u8;

        let env = CompileEnv::new([wide_jump(op, 127), vec![DUP; 122], vec![DONE]].concat());
        let (env, _) = optimized(&env);
        assert_eq!(env.code, [vec![narrow, 124], vec![DUP; 122], vec![DONE]].concat());

        let env = CompileEnv::new([wide_jump(op, 128), vec![DUP; 123], vec![DONE]].concat());
        let (res, summary) = optimized(&env);
        assert_eq!(res, env);
        assert_eq!(summary.passes, 1);

        let env = CompileEnv::new([vec![DUP; 128], wide_jump(op, -128), vec![DONE]].concat());
        let (env, _) = optimized(&env);
        assert_eq!(env.code, [vec![DUP; 128], vec![narrow, (-128i8) as u8], vec![DONE]].concat());

        let env = CompileEnv::new([vec![DUP; 129], wide_jump(op, -129), vec![DONE]].concat());
        let (res, summary) = optimized(&env);
        assert_eq!(res, env);
        assert_eq!(summary.passes, 1);
    }
}

#[test]
fn test_narrow_jump_to_next_elided() {
    init_test_logging();
    let env = CompileEnv::new(vec![Opcode::Jump1 as u8, 2, Opcode::Push1 as u8, 7, NOP, DONE]);
    let (env, summary) = optimized(&env);
    assert_eq!(env.code, [Opcode::Push1 as u8, 7, DONE]);
    assert_eq!(summary, OptimizeSummary { passes: 3, old_size: 6, new_size: 3 });
}

#[test]
fn test_conditional_jump_to_next_pops() {
    for op in [Opcode::JumpTrue1, Opcode::JumpFalse1] {
        let env = CompileEnv::new(vec![Opcode::Push1 as u8, 1, op as u8, 2, NOP, DONE]);
        let (env, _) = optimized(&env);
        assert_eq!(env.code, [Opcode::Push1 as u8, 1, POP, DONE]);
    }
}

#[test]
fn test_narrow_jump_to_next_alone_is_kept() {
    // nothing shrinks, so no pass ever relocates the jump
    let env = CompileEnv::new(vec![Opcode::Jump1 as u8, 2, Opcode::Push1 as u8, 7, DONE]);
    let (res, summary) = optimized(&env);
    assert_eq!(res, env);
    assert_eq!(summary.passes, 1);
}

#[test]
fn test_wide_jump_to_next_elided() {
    let env = CompileEnv::new([wide_jump(Opcode::Jump4, 5), vec![Opcode::Push1 as u8, 9, DONE]].concat());
    let (env, summary) = optimized(&env);
    assert_eq!(env.code, [Opcode::Push1 as u8, 9, DONE]);
    assert_eq!(summary, OptimizeSummary { passes: 3, old_size: 8, new_size: 3 });

    let env = CompileEnv::new([wide_jump(Opcode::JumpFalse4, 5), vec![Opcode::Push1 as u8, 9, DONE]].concat());
    let (env, _) = optimized(&env);
    assert_eq!(env.code, [POP, Opcode::Push1 as u8, 9, DONE]);
}

#[test]
fn test_wide_jump_over_padding_elided() {
    let env = CompileEnv::new([wide_jump(Opcode::Jump4, 135), vec![NOP; 130], vec![Opcode::Push1 as u8, 9, DONE]].concat());
    let (env, summary) = optimized(&env);
    assert_eq!(env.code, [Opcode::Push1 as u8, 9, DONE]);
    assert_eq!(summary, OptimizeSummary { passes: 3, old_size: 138, new_size: 3 });

    let env = CompileEnv::new([wide_jump(Opcode::JumpTrue4, 135), vec![NOP; 130], vec![Opcode::Push1 as u8, 9, DONE]].concat());
    let (env, _) = optimized(&env);
    assert_eq!(env.code, [POP, Opcode::Push1 as u8, 9, DONE]);
}

#[test]
fn test_jump_narrowed_after_relocation() {
    let env = CompileEnv::new([wide_jump(Opcode::Jump4, 200), vec![NOP; 100], vec![DUP; 95], vec![DONE]].concat());
    let (env, summary) = optimized(&env);
    assert_eq!(env.code, [vec![Opcode::Jump1 as u8, 97], vec![DUP; 95], vec![DONE]].concat());
    assert_eq!(summary, OptimizeSummary { passes: 3, old_size: 201, new_size: 98 });
    assert_eq!(jumps(&env), [(0, Opcode::Jump1, 97)]);
}

#[test]
fn test_backward_jump_relocated() {
    let env = CompileEnv::new([vec![DUP], vec![NOP; 10], vec![DUP], wide_jump(Opcode::JumpTrue4, -11), vec![DONE]].concat());
    let (env, _) = optimized(&env);
    assert_eq!(env.code, [DUP, DUP, Opcode::JumpTrue1 as u8, (-1i8) as u8, DONE]);
}

#[test]
fn test_start_cmd_never_narrowed() {
    let start_cmd = |disp: i32| [wide_jump(Opcode::StartCmd, disp), 1u32.to_be_bytes().to_vec()].concat();

    let env = CompileEnv::new([start_cmd(14), wide(Opcode::Push4, 3), vec![DONE]].concat());
    let (env, _) = optimized(&env);
    assert_eq!(env.code, [start_cmd(11), vec![Opcode::Push1 as u8, 3, DONE]].concat());

    let env = CompileEnv::new([start_cmd(15), wide(Opcode::Push4, 3), vec![DONE]].concat());
    let (env, _) = optimized(&env);
    assert_eq!(env.code, [start_cmd(12), vec![Opcode::Push1 as u8, 3, DONE]].concat());
}

#[test]
fn test_already_compact() {
    let env = CompileEnv::new(vec![Opcode::Push1 as u8, 3, Opcode::JumpTrue1 as u8, (-2i8) as u8, DONE]);
    let (res, summary) = optimized(&env);
    assert_eq!(res, env);
    assert_eq!(summary, OptimizeSummary { passes: 1, old_size: 5, new_size: 5 });

    let (res, summary) = optimized(&CompileEnv::default());
    assert_eq!(res, CompileEnv::default());
    assert_eq!(summary, OptimizeSummary { passes: 1, old_size: 0, new_size: 0 });
}

#[test]
fn test_idempotent() {
    let mut asm = Assembler::new();
    let (top, body, brk, cont) = (asm.new_label(), asm.new_label(), asm.new_label(), asm.new_label());
    asm.bind(top);
    marker(&mut asm, 1).push(1000).jump(Opcode::JumpFalse4, brk);
    asm.bind(body).start_cmd(cont, 1).op(Opcode::Nop).push(12).op(Opcode::Pop);
    asm.bind(cont).jump(Opcode::Jump4, top);
    asm.bind(brk);
    marker(&mut asm, 300).op(Opcode::Done);
    asm.loop_range(0, body, brk, brk, Some(cont));
    asm.command(top, brk, 0, 30).command(body, cont, 10, 8);
    let env = asm.finish();

    let (once, first) = optimized(&env);
    assert!(first.passes > 1);
    assert!(first.new_size < first.old_size);

    let (twice, second) = optimized(&once);
    assert_eq!(twice, once);
    assert_eq!(second, OptimizeSummary { passes: 1, old_size: first.new_size, new_size: first.new_size });
}

#[test]
#[should_panic(expected = "refusing to optimize malformed bytecode")]
fn test_malformed_input() {
    let mut env = CompileEnv::new([wide_jump(Opcode::Jump4, 3), vec![DONE]].concat());
    optimize_bytecode(&mut env);
}
