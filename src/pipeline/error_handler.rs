//! Log-storm control for repeated failures, and the end-of-run summary.

use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::pipeline::health::CounterSnapshot;
use crate::utils::config::LogSampling;

/// Decides whether the Nth occurrence of a repeated event should be logged: always the first
/// few, then every `every`th.
#[derive(Debug)]
pub struct LogSampler {
    first: u64,
    every: u64,
    seen: AtomicU64,
}

impl LogSampler {
    pub fn new(first: u64, every: u64) -> Self {
        Self {
            first,
            every: every.max(1),
            seen: AtomicU64::new(0),
        }
    }

    /// Sampler for overload drops (channel full, breaker shed).
    pub fn for_drops() -> Self {
        Self::new(LogSampling::FIRST, LogSampling::DROP_EVERY)
    }

    /// Sampler for storage / hardware / sink errors.
    pub fn for_errors() -> Self {
        Self::new(LogSampling::FIRST, LogSampling::ERROR_EVERY)
    }

    /// Count one occurrence. Returns `Some(n)` (1-based occurrence number) when it should be logged.
    pub fn sample(&self) -> Option<u64> {
        let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        (n <= self.first || n % self.every == 0).then_some(n)
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

/// Log the totals of a finished run. Losses are warned about so they are never silent.
pub fn report_shutdown(counters: &CounterSnapshot) {
    info!(
        "Processed {} frames ({} RX, {} TX, {} decoded, {} DTC hits); stored {}",
        counters.processed,
        counters.rx,
        counters.tx,
        counters.decoded,
        counters.dtcs,
        counters.stored
    );
    let drops = counters.drop_count();
    if drops > 0 {
        warn!(
            "Dropped {} frames (rate limit {}, channel full {}, breaker shed {}, evicted {})",
            drops,
            counters.rate_dropped,
            counters.channel_dropped,
            counters.breaker_shed,
            counters.evicted
        );
    }
    if counters.not_logged > 0 {
        warn!(
            "{} processed frames were not written to storage ({} failed flushes)",
            counters.not_logged, counters.storage_failures
        );
    }
    if counters.errors > 0 {
        warn!(
            "{} errors during the run ({} hardware, {} invalid frames, {} sink)",
            counters.errors, counters.hardware_errors, counters.invalid_frames, counters.sink_errors
        );
    }
}
