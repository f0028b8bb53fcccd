use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::utils::config::PackagePaths;

struct DefaultArgs;

impl DefaultArgs {
    pub const SIMULATE_RATE: &'static str = "10";
}

/// Parse a CAN identifier: hex with or without `0x` (`0x100`, `7DF`).
pub fn parse_can_id(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let id = u32::from_str_radix(digits, 16).map_err(|e| format!("bad CAN id {s}: {e}"))?;
    if id > crate::types::MAX_EXTENDED_ID {
        return Err(format!("CAN id {s} exceeds 29 bits"));
    }
    Ok(id)
}

/// Bus capture pipeline with rate limiting, decoding, diagnostics and SQLite logging.
#[derive(Clone, Parser)]
#[command(name = "canflow")]
#[command(about = "Capture CAN traffic into a SQLite log; export or summarize what was stored.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand)]
pub enum Commands {
    /// Run the capture pipeline until Ctrl+C, --duration, or the end of a replay.
    Capture(CaptureArgs),
    /// Write stored messages as JSON lines.
    Export(ExportArgs),
    /// Print message and DTC statistics as JSON.
    Stats(StatsArgs),
}

#[derive(Clone, Args)]
pub struct CommonArgs {
    /// Path to the SQLite log. Default: `canflow.db` in the current directory.
    #[arg(long, short)]
    pub db: Option<PathBuf>,

    /// Verbose output.
    #[arg(long, short = 'v', num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub verbose: Option<bool>,
}

impl CommonArgs {
    /// Get the database path, defaulting to the package db filename in the working directory.
    pub fn db_path(&self) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| PathBuf::from(PackagePaths::get().db_filename()))
    }
}

#[derive(Clone, Args)]
pub struct CaptureArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Use the simulated bus at this many frames per second (default source).
    #[arg(long, num_args = 0..=1, default_missing_value = DefaultArgs::SIMULATE_RATE, conflicts_with = "replay")]
    pub simulate: Option<u32>,

    /// Replay a candump log instead of a live source.
    #[arg(long, value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// Keep the recorded inter-frame timing when replaying.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub realtime: Option<bool>,

    /// Signal database (TOML).
    #[arg(long, value_name = "FILE")]
    pub signals: Option<PathBuf>,

    /// DTC table (TOML or JSON).
    #[arg(long, value_name = "FILE")]
    pub dtc: Option<PathBuf>,

    /// Process without writing to the database.
    #[arg(long)]
    pub dry_run: bool,

    /// Capture ceiling in frames per second (0 = unlimited).
    #[arg(long, short = 'r')]
    pub rate: Option<u32>,

    /// Stop after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub duration: Option<f64>,

    /// Also append processed records as JSON lines to this file.
    #[arg(long, value_name = "FILE")]
    pub jsonl: Option<PathBuf>,

    /// Print every Nth processed frame to stdout (0 = off).
    #[arg(long, short = 'p')]
    pub print_every: Option<usize>,

    /// Only process these identifiers (hex). Can specify multiple: --id 100 7DF 0x18DAF110
    #[arg(long, num_args = 1.., value_parser = parse_can_id)]
    pub id: Vec<u32>,

    /// Records per database transaction.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Config file. Default: `.canflow.toml` in the current directory, if present.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Time window shared by export and stats (Unix seconds).
#[derive(Clone, Args)]
pub struct RangeArgs {
    /// Only records at or after this time (Unix seconds).
    #[arg(long, value_name = "SECS")]
    pub since: Option<f64>,

    /// Only records at or before this time (Unix seconds).
    #[arg(long, value_name = "SECS")]
    pub until: Option<f64>,
}

#[derive(Clone, Args)]
pub struct ExportArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub range: RangeArgs,

    /// Output file. Default: stdout.
    #[arg(long, short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Clone, Args)]
pub struct StatsArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub range: RangeArgs,
}
