//! A command line front end for inspecting and optimizing serialized compilation units.
//!
//! Units are read and written as JSON (the serde representation of [`CompileEnv`]).
//! Note that this module is only available with the `cli` feature flag.

use std::prelude::v1::*;
use std::fs::File;
use std::io::{self, Read, Write};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::*;

macro_rules! crash {
    ($ret:literal : $($tt:tt)*) => {{
        eprintln!($($tt)*);
        std::process::exit($ret);
    }}
}

/// Bytecode compaction actions that can be performed
#[derive(Parser, Debug)]
pub enum Mode {
    /// Optimizes a compilation unit and writes the result as JSON
    Optimize {
        /// Path to the (json) compilation unit
        src: String,
        /// Where to write the optimized unit (default: stdout)
        #[clap(long)]
        output: Option<String>,
        /// Print a disassembly of the unit before and after optimizing (to stderr)
        #[clap(long)]
        dump: bool,
    },
    /// Dumps the disassembly and metadata of a compilation unit to stdout
    Dump {
        /// Path to the (json) compilation unit
        src: String,
    },
    /// Checks that a compilation unit is well-formed
    Check {
        /// Path to the (json) compilation unit
        src: String,
    },
}

#[derive(Debug, thiserror::Error)]
enum OpenUnitError {
    #[error("failed to read file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse compilation unit: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("malformed compilation unit: {0}")]
    Malformed(#[from] MalformedCode),
}

fn read_file(src: &str) -> io::Result<String> {
    let mut file = File::open(src)?;
    let mut s = String::new();
    file.read_to_string(&mut s)?;
    Ok(s)
}
fn open_unit(src: &str) -> Result<CompileEnv, OpenUnitError> {
    let content = read_file(src)?;
    let env: CompileEnv = serde_json::from_str(&content)?;
    env.check()?;
    Ok(env)
}
fn dump_unit(env: &CompileEnv, f: &mut dyn Write) -> io::Result<()> {
    writeln!(f, "instructions:")?;
    env.dump_code(f)?;
    writeln!(f, "\nmetadata:")?;
    env.dump_metadata(f)?;
    writeln!(f, "\ntotal size: {}", env.code.len())
}

/// Installs a `tracing` subscriber writing to stderr, filtered by `RUST_LOG` (default `warn`).
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .try_init();
}

/// Runs a CLI client using the given [`Mode`] configuration.
pub fn run(mode: Mode) {
    match mode {
        Mode::Optimize { src, output, dump } => {
            let mut env = open_unit(&src).unwrap_or_else(|e| crash!(1: "{src}: {e}"));
            if dump {
                eprintln!("=== before ===");
                dump_unit(&env, &mut io::stderr().lock()).unwrap_or_else(|e| crash!(3: "failed to write disassembly: {e}"));
            }

            let summary = optimize_bytecode(&mut env);
            tracing::info!(passes = summary.passes, old_size = summary.old_size, new_size = summary.new_size, "optimized {src}");

            if dump {
                eprintln!("\n=== after ===");
                dump_unit(&env, &mut io::stderr().lock()).unwrap_or_else(|e| crash!(3: "failed to write disassembly: {e}"));
            }

            let json = serde_json::to_string_pretty(&env).unwrap_or_else(|e| crash!(2: "failed to serialize unit: {e}"));
            match output {
                Some(path) => {
                    let mut file = File::create(&path).unwrap_or_else(|e| crash!(1: "failed to create '{path}': {e}"));
                    writeln!(file, "{json}").unwrap_or_else(|e| crash!(1: "failed to write '{path}': {e}"));
                }
                None => println!("{json}"),
            }
        }
        Mode::Dump { src } => {
            let env = open_unit(&src).unwrap_or_else(|e| crash!(1: "{src}: {e}"));
            dump_unit(&env, &mut io::stdout().lock()).unwrap_or_else(|e| crash!(3: "failed to write disassembly: {e}"));
        }
        Mode::Check { src } => match open_unit(&src) {
            Ok(env) => println!("{src}: ok ({} bytes, {} commands)", env.code.len(), env.cmd_map.len()),
            Err(e) => crash!(1: "{src}: {e}"),
        }
    }
}
