//! CLI command handlers: capture (pipeline run), export (JSON lines), stats (JSON summary).

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::Opts;
use crate::engine::arg_parser::{CaptureArgs, Cli, Commands, ExportArgs, RangeArgs, StatsArgs};
use crate::engine::db_ops::{SqliteStorage, TimeRange, for_each_message, open_db, statistics};
use crate::engine::decoder::SignalDatabase;
use crate::engine::diagnostics::DtcTable;
use crate::engine::hardware::{Hardware, ReplayBus, SimulatedBus};
use crate::engine::progress::{create_counter, refresh_bar, status_counter};
use crate::engine::sinks::{ConsoleSink, JsonLinesSink};
use crate::pipeline::{Collaborators, IdFilter, PipelineController, PipelineTuning};
use crate::utils::canflow_toml::{
    apply_file_to_opts, load_canflow_toml, load_default_canflow_toml, secs_to_duration,
};
use crate::utils::setup_logging;

/// Dispatch a parsed command line.
pub fn handle_run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Capture(args) => handle_capture(args),
        Commands::Export(args) => handle_export(args),
        Commands::Stats(args) => handle_stats(args),
    }
}

/// Defaults, then the config file, then CLI flags. Also returns warnings to log once logging is
/// set up (the file decides the log level).
fn setup_opts(args: &CaptureArgs) -> Result<(Opts, Vec<String>)> {
    let mut opts = Opts::default();
    let mut notices = Vec::new();
    match &args.config {
        Some(path) => apply_file_to_opts(&load_canflow_toml(path)?, &mut opts)?,
        None => match load_default_canflow_toml(Path::new(".")) {
            Ok(Some(file)) => apply_file_to_opts(&file, &mut opts)?,
            Ok(None) => {}
            Err(e) => notices.push(format!("ignoring config file: {e:#}")),
        },
    }
    if let Some(ref db) = args.common.db {
        opts.db_path = Some(db.clone());
    }
    if let Some(v) = args.common.verbose {
        opts.verbose = v;
    }
    if let Some(rate) = args.rate {
        opts.max_rate = rate;
    }
    if let Some(n) = args.batch_size {
        opts.batch_size = n;
    }
    if let Some(n) = args.print_every {
        opts.print_every = n;
    }
    if !args.id.is_empty() {
        opts.id_filter = args.id.clone();
    }
    if args.signals.is_some() {
        opts.signals_path = args.signals.clone();
    }
    if args.dtc.is_some() {
        opts.dtc_path = args.dtc.clone();
    }
    if args.jsonl.is_some() {
        opts.jsonl_path = args.jsonl.clone();
    }
    opts.dry_run = args.dry_run;
    Ok((opts, notices))
}

fn open_hardware(args: &CaptureArgs) -> Result<Box<dyn Hardware>> {
    if let Some(ref path) = args.replay {
        let bus = ReplayBus::open(path, args.realtime.unwrap_or(false))?;
        return Ok(Box::new(bus));
    }
    let rate = args.simulate.unwrap_or(10);
    Ok(Box::new(SimulatedBus::with_rate(rate)))
}

/// Build collaborators from opts. Any file that was asked for but cannot be loaded is fatal.
pub fn build_collaborators(opts: &Opts) -> Result<Collaborators> {
    let mut collab = Collaborators::default();
    if let Some(ref path) = opts.signals_path {
        collab.decoder = Some(Arc::new(SignalDatabase::load(path)?));
    }
    if let Some(ref path) = opts.dtc_path {
        collab.matcher = Some(Arc::new(DtcTable::load(path)?));
    }
    if !opts.dry_run {
        let db_path = opts.db_path_or_default();
        collab.storage = Some(Box::new(SqliteStorage::open(&db_path)?));
        debug!("Logging to {}", db_path.display());
    }
    if !opts.id_filter.is_empty() {
        collab.filters.push(Box::new(IdFilter::new(opts.id_filter.iter().copied())));
    }
    if opts.print_every > 0 {
        collab.sinks.push(Box::new(ConsoleSink::new(opts.print_every)));
    }
    if let Some(ref path) = opts.jsonl_path {
        collab.sinks.push(Box::new(JsonLinesSink::create(path)?));
    }
    collab.on_hardware_error = Some(Box::new(|e: &anyhow::Error| debug!("hardware: {e:#}")));
    Ok(collab)
}

/// Run the pipeline until Ctrl+C, the duration elapses, or a replay is fully processed.
pub fn handle_capture(args: &CaptureArgs) -> Result<()> {
    let setup = setup_opts(args);
    setup_logging(match &setup {
        Ok((opts, _)) => opts.verbose,
        Err(_) => args.common.verbose.unwrap_or(false),
    });
    let (opts, notices) = setup?;
    for notice in &notices {
        warn!("{notice}");
    }
    let limit = args
        .duration
        .map(secs_to_duration)
        .transpose()
        .context("--duration")?;
    debug!(
        "{} CONFIG:{:#?}",
        env!("CARGO_PKG_NAME").to_string().to_uppercase(),
        opts
    );
    if opts.dry_run {
        warn!("RUNNING IN DRY-RUN MODE. NOTHING WILL BE WRITTEN TO THE DATABASE.");
    }

    let hardware = open_hardware(args)?;
    info!("Source: {}", hardware.describe());
    let mut collab = build_collaborators(&opts)?;
    if opts.verbose {
        let bar = create_counter("Capturing");
        refresh_bar(&bar);
        collab.status_observers.push(status_counter(&bar));
    }

    let cancel_requested = Arc::new(AtomicBool::new(false));
    let cancel_requested_handler = Arc::clone(&cancel_requested);
    ctrlc::set_handler(move || {
        cancel_requested_handler.store(true, Ordering::Relaxed);
    })
    .context("set Ctrl+C handler")?;

    let mut controller = PipelineController::new(PipelineTuning::from(&opts));
    controller.start(hardware, collab)?;

    let started = Instant::now();
    loop {
        if cancel_requested.load(Ordering::Relaxed) {
            info!("Interrupted; shutting down");
            break;
        }
        if limit.is_some_and(|l| started.elapsed() >= l) {
            debug!("Duration reached");
            break;
        }
        if controller.is_idle_after_source() {
            info!("Replay finished");
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let counters = controller.stop();
    debug!("Capture ran for {:?}", started.elapsed());
    if counters.not_logged > 0 && !opts.dry_run {
        warn!("Some frames were processed but not logged; see warnings above");
    }
    Ok(())
}

fn time_range(range: &RangeArgs) -> TimeRange {
    let to_ns = |s: f64| (s * 1e9) as i64;
    TimeRange {
        start_ns: range.since.map(to_ns),
        end_ns: range.until.map(to_ns),
    }
}

fn open_existing_db(path: &Path) -> Result<rusqlite::Connection> {
    anyhow::ensure!(path.is_file(), "no database at {}", path.display());
    open_db(path)
}

/// Write stored messages as JSON lines to a file or stdout.
pub fn handle_export(args: &ExportArgs) -> Result<()> {
    setup_logging(args.common.verbose.unwrap_or(false));
    let conn = open_existing_db(&args.common.db_path())?;
    let range = time_range(&args.range);
    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    };
    let n = for_each_message(&conn, range, |m| {
        serde_json::to_writer(&mut out, &m).context("serialize message")?;
        out.write_all(b"\n").context("write message")?;
        Ok(())
    })?;
    out.flush().context("flush export")?;
    info!("Exported {n} messages");
    Ok(())
}

/// Print summary statistics as pretty JSON.
pub fn handle_stats(args: &StatsArgs) -> Result<()> {
    setup_logging(args.common.verbose.unwrap_or(false));
    let conn = open_existing_db(&args.common.db_path())?;
    let stats = statistics(&conn, time_range(&args.range))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("serialize statistics")?
    );
    Ok(())
}
