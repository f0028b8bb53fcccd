//! Application configuration constants.
//! Tuning and thresholds in one place.

use std::sync::OnceLock;
use std::time::Duration;

// ---- Package / paths (from CARGO_PKG_NAME, cached) ----

/// Package-derived file names: built once from `CARGO_PKG_NAME`, then cached.
pub struct PackagePaths {
    pkg_name: &'static str,
    db_filename: String,
    config_filename: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    /// Build and cache names from `CARGO_PKG_NAME`. Called once on first use.
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                pkg_name: pkg,
                db_filename: format!("{pkg}.db"),
                config_filename: format!(".{pkg}.toml"),
            }
        })
    }

    pub fn pkg_name(&self) -> &str {
        self.pkg_name
    }

    /// Default SQLite log file name (`canflow.db`).
    pub fn db_filename(&self) -> &str {
        &self.db_filename
    }

    /// Config file looked up in the working directory (`.canflow.toml`).
    pub fn config_filename(&self) -> &str {
        &self.config_filename
    }
}

// ---- Capture ----

/// Capture loop pacing.
pub struct CaptureConsts;

impl CaptureConsts {
    /// Capture ceiling (frames/s) enforced by the rate limiter.
    pub const MAX_RATE_PER_SEC: u32 = 1000;
    /// Hardware poll timeout per iteration.
    pub const POLL_TIMEOUT: Duration = Duration::from_millis(10);
    /// Channel push timeout; on expiry the frame is dropped.
    pub const PUSH_TIMEOUT: Duration = Duration::from_millis(1);
    /// First backoff after a hardware error; doubles up to `BACKOFF_MAX`.
    pub const BACKOFF_START: Duration = Duration::from_millis(10);
    pub const BACKOFF_MAX: Duration = Duration::from_secs(1);
    /// Join deadline before the capture worker is abandoned.
    pub const STOP_DEADLINE: Duration = Duration::from_secs(2);
}

// ---- Channels ----

/// Bounded channel sizing.
pub struct ChannelConsts;

impl ChannelConsts {
    /// Capture → processing buffer.
    pub const CAPTURE_CAPACITY: usize = 10_000;
    /// Transmit requests from the controller to the capture worker.
    pub const TRANSMIT_CAPACITY: usize = 64;
    /// Processing loop pop timeout (shutdown flag checked between pops).
    pub const POP_TIMEOUT: Duration = Duration::from_millis(100);
    /// Drain deadline for the processing loop at shutdown.
    pub const DRAIN_DEADLINE: Duration = Duration::from_secs(2);
}

// ---- Circuit breakers ----

/// Per-stage breaker thresholds and cooldowns.
pub struct BreakerConsts;

impl BreakerConsts {
    pub const STORAGE_THRESHOLD: u32 = 5;
    pub const STORAGE_COOLDOWN: Duration = Duration::from_secs(30);
    pub const CAPTURE_THRESHOLD: u32 = 50;
    pub const CAPTURE_COOLDOWN: Duration = Duration::from_secs(1);
    pub const PROCESSING_THRESHOLD: u32 = 10;
    pub const PROCESSING_COOLDOWN: Duration = Duration::from_secs(30);
}

// ---- Batching ----

/// Pending batch and flush task limits.
pub struct BatchConsts;

impl BatchConsts {
    /// Records per flush.
    pub const BATCH_SIZE: usize = 100;
    /// Partial batch flushed after this long.
    pub const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
    /// Pending records kept; the oldest half is evicted past this.
    pub const MAX_PENDING: usize = 10_000;
    pub const MAX_INFLIGHT_FLUSHES: usize = 2;
    /// Wait for in-flight flushes at shutdown.
    pub const FLUSH_DEADLINE: Duration = Duration::from_secs(5);
    /// Wait for the storage lock before a flush gives up on its batch.
    pub const LOCK_WAIT: Duration = Duration::from_secs(5);
    /// Wait for the storage lock when closing at shutdown.
    pub const CLOSE_DEADLINE: Duration = Duration::from_secs(1);
}

// ---- Health ----

/// Rolling windows and status thresholds.
pub struct HealthConsts;

impl HealthConsts {
    pub const RATE_WINDOW: Duration = Duration::from_secs(5);
    pub const ERROR_WINDOW: Duration = Duration::from_secs(60);
    pub const STATUS_INTERVAL: Duration = Duration::from_secs(1);
    /// Above this rate (msg/s) activity is High; above zero it is Low.
    pub const HIGH_ACTIVITY_RATE: f64 = 10.0;
    pub const MEMORY_HIGH_BYTES: u64 = 500 * 1024 * 1024;
    pub const MEMORY_CRITICAL_BYTES: u64 = 1000 * 1024 * 1024;
}

// ---- Logging ----

/// Log-storm control for repeated failures.
pub struct LogSampling;

impl LogSampling {
    /// Always log the first few occurrences.
    pub const FIRST: u64 = 3;
    /// Then every Nth overload drop.
    pub const DROP_EVERY: u64 = 100;
    /// Then every Nth storage / hardware / sink error.
    pub const ERROR_EVERY: u64 = 10;
}

// ---- Reports ----

/// Ids listed in the frequency table of `canflow stats`.
pub const STATS_TOP_IDS: usize = 20;
