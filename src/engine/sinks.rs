//! Sink collaborators: read-only consumers of processed records (console, JSON lines, fan-out).

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::pipeline::channel::ChannelTx;
use crate::types::{DiagnosticHit, ProcessedRecord, SignalValue};

/// Called by the processing loop for every record. Errors (and panics) are counted and logged by
/// the caller; they never stop processing.
pub trait Sink: Send {
    fn on_record(&mut self, record: &ProcessedRecord) -> Result<()>;

    /// Called once when the processing loop exits.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "sink"
    }
}

/// `HH:MM:SS.mmm` (UTC) of a nanosecond timestamp.
pub fn format_clock(timestamp_ns: i64) -> String {
    let ms = timestamp_ns.max(0) as u64 / 1_000_000;
    let secs_of_day = (ms / 1000) % 86_400;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs_of_day / 3600,
        (secs_of_day / 60) % 60,
        secs_of_day % 60,
        ms % 1000
    )
}

/// One display line: `12:00:01.250 RX 0x100 [8] 01 02 03 04 05 06 07 08 - EngineData`.
pub fn format_record(record: &ProcessedRecord) -> String {
    let f = &record.frame;
    let data = f
        .payload
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ");
    let mut line = format!(
        "{} {} 0x{:03X} [{}] {}",
        format_clock(f.timestamp_ns),
        f.direction.label(),
        f.id,
        f.dlc(),
        data
    );
    if let Some(name) = record.symbolic_name() {
        line.push_str(" - ");
        line.push_str(name);
    }
    for hit in &record.diagnostics {
        line.push_str(&format!(" [DTC {} {}]", hit.code, hit.info.name));
    }
    line
}

/// Prints every Nth record to stdout.
pub struct ConsoleSink {
    every: usize,
    seen: usize,
}

impl ConsoleSink {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            seen: 0,
        }
    }
}

impl Sink for ConsoleSink {
    fn on_record(&mut self, record: &ProcessedRecord) -> Result<()> {
        self.seen += 1;
        if self.seen % self.every == 0 || self.seen == 1 {
            println!("{}", format_record(record));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Serialized shape of a record on the JSON-lines and export paths.
#[derive(Debug, Serialize)]
pub struct RecordLine<'a> {
    pub seq: u64,
    pub timestamp_ns: i64,
    pub id: u32,
    pub extended: bool,
    pub dlc: usize,
    pub data: String,
    pub direction: &'static str,
    pub channel: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signals: Option<&'a std::collections::BTreeMap<String, SignalValue>>,
    #[serde(skip_serializing_if = "no_hits")]
    pub dtcs: &'a [DiagnosticHit],
}

fn no_hits(hits: &&[DiagnosticHit]) -> bool {
    hits.is_empty()
}

impl<'a> From<&'a ProcessedRecord> for RecordLine<'a> {
    fn from(r: &'a ProcessedRecord) -> Self {
        RecordLine {
            seq: r.seq,
            timestamp_ns: r.frame.timestamp_ns,
            id: r.frame.id,
            extended: r.frame.extended,
            dlc: r.frame.dlc(),
            data: r.frame.payload_hex(),
            direction: r.frame.direction.label(),
            channel: r.frame.channel,
            name: r.symbolic_name(),
            signals: r.decoded.as_ref().map(|d| &d.signals),
            dtcs: &r.diagnostics,
        }
    }
}

/// Appends one JSON object per record to a file.
pub struct JsonLinesSink {
    out: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl Sink for JsonLinesSink {
    fn on_record(&mut self, record: &ProcessedRecord) -> Result<()> {
        serde_json::to_writer(&mut self.out, &RecordLine::from(record)).context("serialize record")?;
        self.out.write_all(b"\n").context("write record")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush().context("flush JSON lines")
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

/// Forwards a copy of each record into a bounded channel without waiting. A full channel drops
/// the copy and counts it.
pub struct ChannelSink {
    tx: ChannelTx<ProcessedRecord>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    pub fn new(tx: ChannelTx<ProcessedRecord>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared drop counter (readable after the sink moved into the pipeline).
    pub fn dropped(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl Sink for ChannelSink {
    fn on_record(&mut self, record: &ProcessedRecord) -> Result<()> {
        if self.tx.try_push(record.clone(), Duration::ZERO).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        self.tx.name()
    }
}
