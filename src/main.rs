//! canflow CLI: capture bus traffic into SQLite; export or summarize the log.

use anyhow::Result;
use canflow::engine::arg_parser::Cli;
use canflow::engine::handle_run;
use clap::Parser;
use std::time::Instant;

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    handle_run(&cli)?;
    log::debug!("Total time: {:?}", start_time.elapsed());
    Ok(())
}
