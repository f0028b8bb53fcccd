//! Rolling-window rate/error accounting and the status snapshot built from it.
//!
//! Counters are atomics; windows sit behind a mutex whose critical sections are
//! O(window size) and never do I/O. Readers on other threads get a consistent copy.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::utils::config::HealthConsts;

use super::breaker::{BreakerState, CircuitBreaker};

/// Time-bounded series of `(instant, value)` pairs, non-decreasing by instant.
/// Entries older than the horizon are evicted on every read (and on push).
#[derive(Debug)]
pub struct RollingWindow<T> {
    horizon: Duration,
    entries: Mutex<VecDeque<(Instant, T)>>,
}

impl<T: Clone> RollingWindow<T> {
    pub fn new(horizon: Duration) -> Self {
        Self {
            horizon,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    fn evict(entries: &mut VecDeque<(Instant, T)>, horizon: Duration, now: Instant) {
        while let Some((at, _)) = entries.front() {
            if now.saturating_duration_since(*at) > horizon {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Append a sample. An instant earlier than the newest entry is clamped to it.
    pub fn push(&self, now: Instant, value: T) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let at = match entries.back() {
            Some((last, _)) if *last > now => *last,
            _ => now,
        };
        entries.push_back((at, value));
        Self::evict(&mut entries, self.horizon, at);
    }

    /// Number of samples inside the horizon as of `now`.
    pub fn count_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict(&mut entries, self.horizon, now);
        entries.len()
    }

    /// Copy of the samples inside the horizon as of `now`, oldest first.
    pub fn snapshot_at(&self, now: Instant) -> Vec<(Instant, T)> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict(&mut entries, self.horizon, now);
        entries.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl RollingWindow<u64> {
    /// Sum of values inside the horizon as of `now`.
    pub fn sum_at(&self, now: Instant) -> u64 {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict(&mut entries, self.horizon, now);
        entries.iter().map(|(_, v)| *v).sum()
    }

    /// Sum inside the horizon divided by the horizon in seconds.
    pub fn rate_at(&self, now: Instant) -> f64 {
        let secs = self.horizon.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.sum_at(now) as f64 / secs
    }
}

/// Pipeline stage owning a breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Stage {
    Capture,
    Processing,
    Storage,
}

/// Monotonic counters shared by every stage.
#[derive(Debug, Default)]
pub struct Counters {
    pub captured: AtomicU64,
    pub rate_dropped: AtomicU64,
    pub channel_dropped: AtomicU64,
    pub breaker_shed: AtomicU64,
    pub evicted: AtomicU64,
    pub filtered: AtomicU64,
    pub processed: AtomicU64,
    pub rx: AtomicU64,
    pub tx: AtomicU64,
    pub decoded: AtomicU64,
    pub dtcs: AtomicU64,
    pub errors: AtomicU64,
    pub hardware_errors: AtomicU64,
    pub invalid_frames: AtomicU64,
    pub sink_errors: AtomicU64,
    pub stored: AtomicU64,
    pub storage_failures: AtomicU64,
    /// Records accounted as processed but not durably logged (breaker open, failed batch, dry run).
    pub not_logged: AtomicU64,
    pub transmitted: AtomicU64,
}

/// Plain copy of [`Counters`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub captured: u64,
    pub rate_dropped: u64,
    pub channel_dropped: u64,
    pub breaker_shed: u64,
    pub evicted: u64,
    pub filtered: u64,
    pub processed: u64,
    pub rx: u64,
    pub tx: u64,
    pub decoded: u64,
    pub dtcs: u64,
    pub errors: u64,
    pub hardware_errors: u64,
    pub invalid_frames: u64,
    pub sink_errors: u64,
    pub stored: u64,
    pub storage_failures: u64,
    pub not_logged: u64,
    pub transmitted: u64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(counter: &AtomicU64, n: u64) -> u64 {
        counter.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let r = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            captured: r(&self.captured),
            rate_dropped: r(&self.rate_dropped),
            channel_dropped: r(&self.channel_dropped),
            breaker_shed: r(&self.breaker_shed),
            evicted: r(&self.evicted),
            filtered: r(&self.filtered),
            processed: r(&self.processed),
            rx: r(&self.rx),
            tx: r(&self.tx),
            decoded: r(&self.decoded),
            dtcs: r(&self.dtcs),
            errors: r(&self.errors),
            hardware_errors: r(&self.hardware_errors),
            invalid_frames: r(&self.invalid_frames),
            sink_errors: r(&self.sink_errors),
            stored: r(&self.stored),
            storage_failures: r(&self.storage_failures),
            not_logged: r(&self.not_logged),
            transmitted: r(&self.transmitted),
        }
    }
}

impl CounterSnapshot {
    /// Every frame lost to an overload policy.
    pub fn drop_count(&self) -> u64 {
        self.rate_dropped + self.channel_dropped + self.breaker_shed + self.evicted
    }
}

/// Traffic indicator derived from the message rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ActivityLevel {
    Idle,
    Low,
    High,
}

impl ActivityLevel {
    pub fn from_rate(rate: f64) -> Self {
        if rate > HealthConsts::HIGH_ACTIVITY_RATE {
            ActivityLevel::High
        } else if rate > 0.0 {
            ActivityLevel::Low
        } else {
            ActivityLevel::Idle
        }
    }
}

/// Resident memory indicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MemoryLevel {
    Ok,
    High,
    Critical,
}

impl MemoryLevel {
    pub fn from_bytes(bytes: u64) -> Self {
        if bytes > HealthConsts::MEMORY_CRITICAL_BYTES {
            MemoryLevel::Critical
        } else if bytes > HealthConsts::MEMORY_HIGH_BYTES {
            MemoryLevel::High
        } else {
            MemoryLevel::Ok
        }
    }
}

/// Periodic externally visible state of the pipeline.
#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    pub message_rate: f64,
    pub error_rate: f64,
    pub drop_count: u64,
    pub breaker_states: BTreeMap<Stage, BreakerState>,
    pub queue_depth: usize,
    pub activity: ActivityLevel,
    pub rss_bytes: Option<u64>,
    pub memory: Option<MemoryLevel>,
    pub counters: CounterSnapshot,
}

/// Shared accounting for all stages. Cheap to clone via `Arc`.
#[derive(Debug)]
pub struct HealthAccounting {
    pub counters: Counters,
    accepted: RollingWindow<u64>,
    errors: RollingWindow<u64>,
    breakers: Mutex<Vec<(Stage, Arc<CircuitBreaker>)>>,
}

impl HealthAccounting {
    pub fn new(rate_window: Duration, error_window: Duration) -> Self {
        Self {
            counters: Counters::default(),
            accepted: RollingWindow::new(rate_window),
            errors: RollingWindow::new(error_window),
            breakers: Mutex::new(Vec::new()),
        }
    }

    /// Make a stage's breaker visible in [`HealthAccounting::breaker_states`].
    pub fn register_breaker(&self, stage: Stage, breaker: Arc<CircuitBreaker>) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.retain(|(s, _)| *s != stage);
        breakers.push((stage, breaker));
    }

    /// Count one processed item in the rate window.
    pub fn record_accepted(&self, now: Instant) {
        self.accepted.push(now, 1);
    }

    /// Count one error in the error window and the total error counter.
    pub fn record_error(&self, now: Instant) {
        Counters::bump(&self.counters.errors);
        self.errors.push(now, 1);
    }

    pub fn message_rate(&self) -> f64 {
        self.accepted.rate_at(Instant::now())
    }

    pub fn error_rate(&self) -> f64 {
        self.errors.rate_at(Instant::now())
    }

    pub fn drop_count(&self) -> u64 {
        self.counters.snapshot().drop_count()
    }

    pub fn breaker_states(&self) -> BTreeMap<Stage, BreakerState> {
        let now = Instant::now();
        // Clone the handles out so breaker locks are never taken while holding ours.
        let breakers: Vec<(Stage, Arc<CircuitBreaker>)> = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        breakers
            .into_iter()
            .map(|(stage, b)| (stage, b.state_at(now)))
            .collect()
    }

    /// Build a snapshot. `queue_depth` and `rss_bytes` come from the caller (controller).
    pub fn snapshot(&self, queue_depth: usize, rss_bytes: Option<u64>) -> HealthSnapshot {
        let now = Instant::now();
        let message_rate = self.accepted.rate_at(now);
        let counters = self.counters.snapshot();
        HealthSnapshot {
            message_rate,
            error_rate: self.errors.rate_at(now),
            drop_count: counters.drop_count(),
            breaker_states: self.breaker_states(),
            queue_depth,
            activity: ActivityLevel::from_rate(message_rate),
            rss_bytes,
            memory: rss_bytes.map(MemoryLevel::from_bytes),
            counters,
        }
    }
}
