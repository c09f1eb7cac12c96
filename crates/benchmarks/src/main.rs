//! Benchmark harness executable for tileforge.

use anyhow::Result;
use clap::Parser;
use tileforge_harness::cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
