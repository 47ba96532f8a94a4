use clap::Parser;

use bytecode_compactor::cli::{init_logging, run, Mode};

#[derive(Parser, Debug)]
#[clap(name = "bco", about = "Compacts and relocates serialized bytecode compilation units")]
struct Args {
    #[clap(subcommand)]
    mode: Mode,
}

fn main() {
    init_logging();
    run(Args::parse().mode);
}
