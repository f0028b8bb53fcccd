//! Public and internal types for the canflow API and pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::utils::config::{
    BatchConsts, BreakerConsts, CaptureConsts, ChannelConsts, HealthConsts, PackagePaths,
};

/// Largest 29-bit (extended) identifier.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// Largest 11-bit (standard) identifier.
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Classic frames carry at most 8 payload bytes.
pub const MAX_PAYLOAD_LEN: usize = 8;

/// Whether a frame was seen on the bus or sent by us.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Received,
    Transmitted,
}

impl Direction {
    pub fn is_rx(&self) -> bool {
        matches!(self, Direction::Received)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Direction::Received => "RX",
            Direction::Transmitted => "TX",
        }
    }
}

/// One frame as pulled from the hardware. Immutable once built.
#[derive(Clone, Debug)]
pub struct RawFrame {
    /// Monotonic arrival time (rate limiting, rolling windows).
    pub arrival: Instant,
    /// Wall-clock arrival in nanoseconds since the Unix epoch (persisted).
    pub timestamp_ns: i64,
    pub id: u32,
    pub extended: bool,
    pub payload: Vec<u8>,
    pub direction: Direction,
    pub channel: u16,
}

impl RawFrame {
    /// Frame stamped with the current time. `extended` is inferred from the id width.
    pub fn new(id: u32, payload: &[u8], direction: Direction) -> Self {
        Self {
            arrival: Instant::now(),
            timestamp_ns: now_ns(),
            id,
            extended: id > MAX_STANDARD_ID,
            payload: payload.to_vec(),
            direction,
            channel: 0,
        }
    }

    pub fn with_channel(mut self, channel: u16) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_arrival(mut self, arrival: Instant) -> Self {
        self.arrival = arrival;
        self
    }

    pub fn dlc(&self) -> usize {
        self.payload.len()
    }

    /// Upper-case hex of the payload, no separators (`0102A0`).
    pub fn payload_hex(&self) -> String {
        self.payload.iter().map(|b| format!("{b:02X}")).collect()
    }
}

/// Decoded signal value: physical number, or a value-table label.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Number(f64),
    Enum(String),
}

impl std::fmt::Display for SignalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalValue::Number(v) => write!(f, "{v}"),
            SignalValue::Enum(s) => f.write_str(s),
        }
    }
}

/// Result of a successful decode: message name and its signals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodedMessage {
    pub name: String,
    pub signals: BTreeMap<String, SignalValue>,
}

/// Diagnostic table entry for one code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DtcInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: String,
}

/// A diagnostic code found in a frame and resolved against the table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DiagnosticHit {
    pub code: String,
    pub info: DtcInfo,
    /// Signal the code was found in; `None` when matched on raw payload hex.
    pub source_signal: Option<String>,
}

/// A frame after the processing stage. Sinks get `&ProcessedRecord`; storage consumes it in a batch.
#[derive(Clone, Debug)]
pub struct ProcessedRecord {
    pub frame: RawFrame,
    pub decoded: Option<DecodedMessage>,
    pub diagnostics: Vec<DiagnosticHit>,
    pub seq: u64,
    pub processed_ns: i64,
}

impl ProcessedRecord {
    pub fn symbolic_name(&self) -> Option<&str> {
        self.decoded.as_ref().map(|d| d.name.as_str())
    }

    /// Decoded signals as a JSON object (`{}` when undecoded).
    pub fn signals_json(&self) -> String {
        match &self.decoded {
            Some(d) => serde_json::to_string(&d.signals).unwrap_or_else(|_| "{}".to_string()),
            None => "{}".to_string(),
        }
    }
}

/// Wall clock now, nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Full runtime options (CLI, config file, and lib callers).
#[derive(Clone, Debug)]
pub struct Opts {
    /// SQLite log path. When None, uses `<package log filename>` in the working directory.
    pub db_path: Option<PathBuf>,
    /// Run without storage: batches are counted as not durably logged.
    pub dry_run: bool,
    /// Capture ceiling in frames per second (0 disables the limiter).
    pub max_rate: u32,
    /// Capacity of the capture → processing channel.
    pub channel_capacity: usize,
    /// Hardware poll timeout per capture iteration.
    pub poll_timeout: Duration,
    /// Channel push timeout in the capture loop.
    pub push_timeout: Duration,
    /// Channel pop timeout in the processing loop.
    pub pop_timeout: Duration,
    /// Records per storage flush.
    pub batch_size: usize,
    /// Flush a partial batch after this long.
    pub flush_interval: Duration,
    /// Pending records kept before evicting the oldest half.
    pub max_pending: usize,
    /// Concurrent flush tasks.
    pub max_inflight_flushes: usize,
    pub storage_failure_threshold: u32,
    pub storage_cooldown: Duration,
    pub capture_failure_threshold: u32,
    pub capture_cooldown: Duration,
    pub processing_failure_threshold: u32,
    pub processing_cooldown: Duration,
    /// Rolling window for the message rate.
    pub rate_window: Duration,
    /// Rolling window for the error rate.
    pub error_window: Duration,
    /// Status snapshot interval.
    pub status_interval: Duration,
    /// Only process these identifiers (empty = all).
    pub id_filter: Vec<u32>,
    /// Signal database (TOML).
    pub signals_path: Option<PathBuf>,
    /// DTC table (TOML or JSON).
    pub dtc_path: Option<PathBuf>,
    /// Write processed records as JSON lines here.
    pub jsonl_path: Option<PathBuf>,
    /// Print every Nth processed record to stdout (0 = off).
    pub print_every: usize,
    /// Debug logs and live counter.
    pub verbose: bool,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            db_path: None,
            dry_run: false,
            max_rate: CaptureConsts::MAX_RATE_PER_SEC,
            channel_capacity: ChannelConsts::CAPTURE_CAPACITY,
            poll_timeout: CaptureConsts::POLL_TIMEOUT,
            push_timeout: CaptureConsts::PUSH_TIMEOUT,
            pop_timeout: ChannelConsts::POP_TIMEOUT,
            batch_size: BatchConsts::BATCH_SIZE,
            flush_interval: BatchConsts::FLUSH_INTERVAL,
            max_pending: BatchConsts::MAX_PENDING,
            max_inflight_flushes: BatchConsts::MAX_INFLIGHT_FLUSHES,
            storage_failure_threshold: BreakerConsts::STORAGE_THRESHOLD,
            storage_cooldown: BreakerConsts::STORAGE_COOLDOWN,
            capture_failure_threshold: BreakerConsts::CAPTURE_THRESHOLD,
            capture_cooldown: BreakerConsts::CAPTURE_COOLDOWN,
            processing_failure_threshold: BreakerConsts::PROCESSING_THRESHOLD,
            processing_cooldown: BreakerConsts::PROCESSING_COOLDOWN,
            rate_window: HealthConsts::RATE_WINDOW,
            error_window: HealthConsts::ERROR_WINDOW,
            status_interval: HealthConsts::STATUS_INTERVAL,
            id_filter: Vec::new(),
            signals_path: None,
            dtc_path: None,
            jsonl_path: None,
            print_every: 0,
            verbose: false,
        }
    }
}

impl Opts {
    /// `db_path`, or the package log file name in the working directory.
    pub fn db_path_or_default(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(PackagePaths::get().db_filename()))
    }

    /// Minimum spacing between admitted frames derived from `max_rate`.
    pub fn min_interval(&self) -> Duration {
        if self.max_rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / self.max_rate as f64)
        }
    }
}
