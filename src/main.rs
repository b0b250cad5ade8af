//! Command-line entry point for callflow.

use anyhow::Result;
use callflow_compiler::cli::{run_cli, Cli};
use clap::Parser;

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
