//! Engine module: collaborators the pipeline calls out to, storage, and CLI plumbing

pub mod arg_parser;
pub mod cli;
pub mod db_ops;
pub mod decoder;
pub mod diagnostics;
pub mod hardware;
pub mod progress;
pub mod sinks;

// Re-export commonly used items
pub use arg_parser::{CaptureArgs, Cli, Commands, CommonArgs, ExportArgs, StatsArgs};
pub use cli::{build_collaborators, handle_capture, handle_export, handle_run, handle_stats};
pub use db_ops::{SqliteStorage, Storage, open_db, open_db_in_memory};
pub use decoder::{Decoder, SignalDatabase};
pub use diagnostics::{DiagnosticMatcher, DtcTable, find_diagnostics};
pub use hardware::{Hardware, ReplayBus, SimulatedBus, parse_candump_line};
pub use sinks::{ChannelSink, ConsoleSink, JsonLinesSink, Sink};
