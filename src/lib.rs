//! A post-codegen compaction and relocation pass for stack-based bytecode.
//!
//! Code generation emits wide (4-byte operand) instructions and [`Opcode::Nop`] padding wherever it is convenient.
//! [`optimize_bytecode`] runs once per compiled unit, after code generation and before the bytecode is stored or executed,
//! and rewrites the unit's [`CompileEnv`] in place: padding is removed, wide instructions are narrowed where their operands allow,
//! jumps to the next instruction are elided, and every offset that refers into the code is relocated to match.
//!
//! ```
//! # use bytecode_compactor::*;
//! let mut asm = Assembler::new();
//! let end = asm.new_label();
//! asm.push(7).jump(Opcode::Jump4, end).op(Opcode::Nop).bind(end).op(Opcode::Done);
//! let mut env = asm.finish();
//! assert_eq!(env.code.len(), 12);
//!
//! let summary = optimize_bytecode(&mut env);
//! assert_eq!(env.code, [Opcode::Push1 as u8, 7, Opcode::Done as u8]);
//! assert_eq!(summary.new_size, 3);
//! ```

#![forbid(unsafe_code)]
#![no_std]

#[cfg(not(feature = "std"))]
#[macro_use] extern crate alloc;
#[cfg(feature = "std")]
#[macro_use] extern crate std as real_std;
extern crate no_std_compat as std;

pub mod opcode;
pub mod codec;
pub mod vecmap;
pub mod env;
pub mod check;
pub mod optimize;
pub mod assemble;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(test)]
mod test;

pub use compact_str::CompactString;

pub use opcode::{Opcode, OperandType, InstructionDesc, instruction_len};
pub use codec::CodeOffset;
pub use env::*;
pub use check::MalformedCode;
pub use optimize::{optimize_bytecode, OptimizeSummary, PositionMap};
pub use assemble::{Assembler, Label};
