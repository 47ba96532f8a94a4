//! A label-based emitter for building well-formed [`CompileEnv`] values by hand.
//!
//! Like a code generator, the assembler emits wide jumps and records every offset that refers to a label as a hole.
//! All holes are patched by [`Assembler::finish`] once every label has been bound.

use std::prelude::v1::*;
use core::panic;

use compact_str::CompactString;

use crate::codec::*;
use crate::env::*;
use crate::opcode::*;

/// A code position that may be referenced before it is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

enum Hole {
    Offset1 { pc: CodeOffset, label: Label },
    Offset4 { pc: CodeOffset, label: Label },
    JumpTableArm { pc: CodeOffset, aux: usize, key: CompactString, label: Label },
    Foreach { pc: CodeOffset, aux: usize, label: Label },
}

enum RangeTargets {
    Loop { break_label: Label, continue_label: Option<Label> },
    Catch { catch_label: Label },
}

struct PendingRange {
    nesting_level: u32,
    start: Label,
    end: Label,
    targets: RangeTargets,
}

struct PendingCommand {
    start: Label,
    end: Label,
    src_offset: usize,
    num_src_bytes: usize,
}

#[derive(Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<CodeOffset>>,
    holes: Vec<Hole>,
    aux_data: Vec<AuxData>,
    ranges: Vec<PendingRange>,
    commands: Vec<PendingCommand>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }
    /// Current end of the code.
    pub fn here(&self) -> CodeOffset {
        self.code.len()
    }
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }
    /// Binds `label` to the current end of the code.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        let here = self.here();
        let slot = &mut self.labels[label.0];
        assert!(slot.is_none(), "label {} bound twice", label.0);
        *slot = Some(here);
        self
    }
    /// Emits an instruction with no operands.
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        assert!(op.desc().operands.is_empty(), "{op:?} takes operands");
        self.code.push(op as u8);
        self
    }
    /// Emits an instruction with a single 1-byte operand.
    pub fn op1(&mut self, op: Opcode, operand: u8) -> &mut Self {
        assert!(matches!(op.desc().operands, [x] if x.size() == 1), "{op:?} does not take a single 1-byte operand");
        self.code.extend_from_slice(&[op as u8, operand]);
        self
    }
    /// Emits an instruction with a single 4-byte operand.
    pub fn op4(&mut self, op: Opcode, operand: u32) -> &mut Self {
        assert!(matches!(op.desc().operands, [x] if x.size() == 4), "{op:?} does not take a single 4-byte operand");
        self.code.push(op as u8);
        self.code.extend_from_slice(&operand.to_be_bytes());
        self
    }
    /// Emits a wide literal push, as a code generator would before compaction.
    pub fn push(&mut self, literal: u32) -> &mut Self {
        self.op4(Opcode::Push4, literal)
    }
    /// Emits a jump of either width to `label`.
    pub fn jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        assert!(op.is_jump(), "{op:?} is not a jump");
        let pc = self.here();
        match op.num_bytes() {
            2 => {
                self.op1(op, 0);
                self.holes.push(Hole::Offset1 { pc, label });
            }
            _ => {
                self.op4(op, 0);
                self.holes.push(Hole::Offset4 { pc, label });
            }
        }
        self
    }
    /// Emits a command start marker whose span ends at `end`.
    pub fn start_cmd(&mut self, end: Label, num_cmds: u32) -> &mut Self {
        let pc = self.here();
        self.code.push(Opcode::StartCmd as u8);
        self.code.extend_from_slice(&0u32.to_be_bytes());
        self.code.extend_from_slice(&num_cmds.to_be_bytes());
        self.holes.push(Hole::Offset4 { pc, label: end });
        self
    }
    /// Emits a [`Opcode::ForeachStart`] with a new foreach descriptor whose continuation points to `loop_test`.
    /// Returns the aux data index of the descriptor.
    pub fn foreach_start(&mut self, num_lists: u32, first_value_temp: u32, var_lists: Vec<Vec<u32>>, loop_test: Label) -> u32 {
        let aux = self.aux_data.len();
        self.aux_data.push(AuxData::Foreach(ForeachInfo { num_lists, first_value_temp, continuation_offset: 0, var_lists }));
        let pc = self.here();
        self.op4(Opcode::ForeachStart, aux as u32);
        self.holes.push(Hole::Foreach { pc, aux, label: loop_test });
        aux as u32
    }
    /// Emits a [`Opcode::JumpTable`] with a new jump table descriptor mapping each discriminant to a label.
    /// Returns the aux data index of the descriptor.
    pub fn jump_table<K: Into<CompactString>>(&mut self, arms: impl IntoIterator<Item = (K, Label)>) -> u32 {
        let aux = self.aux_data.len();
        self.aux_data.push(AuxData::JumpTable(JumptableInfo::default()));
        let pc = self.here();
        self.op4(Opcode::JumpTable, aux as u32);
        for (key, label) in arms {
            self.holes.push(Hole::JumpTableArm { pc, aux, key: key.into(), label });
        }
        aux as u32
    }
    /// Records a catch range covering `[start, end)` whose handler is at `catch_label`.
    pub fn catch_range(&mut self, nesting_level: u32, start: Label, end: Label, catch_label: Label) -> &mut Self {
        self.ranges.push(PendingRange { nesting_level, start, end, targets: RangeTargets::Catch { catch_label } });
        self
    }
    /// Records a loop range covering `[start, end)` with its break and (optional) continue targets.
    pub fn loop_range(&mut self, nesting_level: u32, start: Label, end: Label, break_label: Label, continue_label: Option<Label>) -> &mut Self {
        self.ranges.push(PendingRange { nesting_level, start, end, targets: RangeTargets::Loop { break_label, continue_label } });
        self
    }
    /// Records a command map entry for the code between `start` and `end`.
    /// Commands should be recorded in order of their starting offset.
    pub fn command(&mut self, start: Label, end: Label, src_offset: usize, num_src_bytes: usize) -> &mut Self {
        self.commands.push(PendingCommand { start, end, src_offset, num_src_bytes });
        self
    }
    /// Patches every hole and produces the finished unit.
    /// Panics if any referenced label was never bound.
    pub fn finish(self) -> CompileEnv {
        let Assembler { mut code, labels, holes, mut aux_data, ranges, commands } = self;
        let resolve = |label: Label| match labels[label.0] {
            Some(x) => x,
            None => panic!("label {} was never bound", label.0),
        };
        let displacement = |pc: CodeOffset, label: Label| {
            let disp = resolve(label) as i64 - pc as i64;
            match i32::try_from(disp) {
                Ok(x) => x,
                Err(_) => panic!("displacement {disp} from {pc} does not fit in 4 bytes"),
            }
        };

        for hole in holes {
            match hole {
                Hole::Offset1 { pc, label } => match i8::try_from(displacement(pc, label)) {
                    Ok(x) => set_int1_at(&mut code, pc + 1, x),
                    Err(_) => panic!("narrow jump at {pc} cannot reach label {}", label.0),
                }
                Hole::Offset4 { pc, label } => set_int4_at(&mut code, pc + 1, displacement(pc, label)),
                Hole::JumpTableArm { pc, aux, key, label } => match &mut aux_data[aux] {
                    AuxData::JumpTable(info) => { info.targets.insert(key, displacement(pc, label)); }
                    AuxData::Foreach(_) => unreachable!(),
                }
                Hole::Foreach { pc, aux, label } => match &mut aux_data[aux] {
                    AuxData::Foreach(info) => info.continuation_offset = -displacement(pc + Opcode::ForeachStart.num_bytes(), label),
                    AuxData::JumpTable(_) => unreachable!(),
                }
            }
        }

        let except_ranges = ranges.into_iter().map(|range| {
            let (start, end) = (resolve(range.start), resolve(range.end));
            assert!(start <= end, "exception range ends before it starts");
            let kind = match range.targets {
                RangeTargets::Catch { catch_label } => ExceptionRangeKind::Catch { catch_offset: resolve(catch_label) },
                RangeTargets::Loop { break_label, continue_label } => ExceptionRangeKind::Loop {
                    break_offset: resolve(break_label),
                    continue_offset: continue_label.map(resolve),
                },
            };
            ExceptionRange { nesting_level: range.nesting_level, code_offset: start, num_code_bytes: end - start, kind }
        }).collect();

        let cmd_map = commands.into_iter().map(|cmd| {
            let (start, end) = (resolve(cmd.start), resolve(cmd.end));
            assert!(start <= end, "command ends before it starts");
            CmdLocation { code_offset: start, num_code_bytes: end - start, src_offset: cmd.src_offset, num_src_bytes: cmd.num_src_bytes }
        }).collect();

        CompileEnv { code, except_ranges, aux_data, cmd_map }
    }
}

#[test]
fn test_assemble_jumps_and_tables() {
    let mut asm = Assembler::new();
    let (top, mid, end) = (asm.new_label(), asm.new_label(), asm.new_label());
    asm.bind(top).push(300);
    asm.jump(Opcode::JumpFalse4, end);
    let aux = asm.jump_table([("a", mid), ("b", top)]);
    asm.bind(mid).jump(Opcode::Jump1, top);
    asm.bind(end).op(Opcode::Done);
    let env = asm.finish();

    assert_eq!(aux, 0);
    assert_eq!(env.instructions().collect::<Vec<_>>(), [(0, Opcode::Push4), (5, Opcode::JumpFalse4), (10, Opcode::JumpTable), (15, Opcode::Jump1), (17, Opcode::Done)]);
    assert_eq!(get_uint4_at(&env.code, 1), 300);
    assert_eq!(get_int4_at(&env.code, 6), 12);
    assert_eq!(get_int1_at(&env.code, 16), -15);
    match &env.aux_data[0] {
        AuxData::JumpTable(info) => assert_eq!(info.targets.iter().map(|(k, v)| (k.as_str(), *v)).collect::<Vec<_>>(), [("a", 5), ("b", -10)]),
        x => panic!("{x:?}"),
    }
    assert_eq!(env.check(), Ok(()));
}

#[test]
fn test_assemble_foreach_and_ranges() {
    let mut asm = Assembler::new();
    let (start, test, body_end, done) = (asm.new_label(), asm.new_label(), asm.new_label(), asm.new_label());
    asm.bind(start);
    asm.bind(test).op(Opcode::Nop);
    let aux = asm.foreach_start(1, 0, vec![vec![3]], test);
    asm.op4(Opcode::ForeachStep, aux).bind(body_end).op(Opcode::Done).bind(done);
    asm.loop_range(1, start, body_end, done, Some(test));
    asm.command(start, done, 0, 12);
    let env = asm.finish();

    match &env.aux_data[0] {
        AuxData::Foreach(info) => {
            assert_eq!(info.continuation_offset, 6);
            assert_eq!(info.loop_target(1), Some(0));
        }
        x => panic!("{x:?}"),
    }
    assert_eq!(env.except_ranges, [ExceptionRange { nesting_level: 1, code_offset: 0, num_code_bytes: 11, kind: ExceptionRangeKind::Loop { break_offset: 12, continue_offset: Some(0) } }]);
    assert_eq!(env.cmd_map, [CmdLocation { code_offset: 0, num_code_bytes: 12, src_offset: 0, num_src_bytes: 12 }]);
    assert_eq!(env.check(), Ok(()));
}

#[test]
#[should_panic(expected = "never bound")]
fn test_assemble_unbound_label() {
    let mut asm = Assembler::new();
    let nowhere = asm.new_label();
    asm.jump(Opcode::Jump4, nowhere);
    asm.finish();
}
