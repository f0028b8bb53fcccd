//! Pipeline context and tuning: the collaborators handed to the controller, loop state shared
//! between the controller and its workers, and settings derived from [`Opts`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::Opts;
use crate::engine::db_ops::Storage;
use crate::engine::decoder::Decoder;
use crate::engine::diagnostics::DiagnosticMatcher;
use crate::engine::sinks::Sink;
use crate::pipeline::health::HealthSnapshot;
use crate::pipeline::processing::FrameFilter;
use crate::utils::config::{BatchConsts, CaptureConsts, ChannelConsts};

/// Called with every hardware error the capture loop absorbs.
pub type ErrorCallback = Box<dyn Fn(&anyhow::Error) + Send>;

/// Called by the status reporter with each periodic snapshot.
pub type StatusCallback = Box<dyn FnMut(&HealthSnapshot) + Send>;

/// Failure threshold and cooldown of one breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

/// Every timing and sizing knob of a running pipeline.
#[derive(Clone, Debug)]
pub struct PipelineTuning {
    pub min_interval: Duration,
    pub channel_capacity: usize,
    pub transmit_capacity: usize,
    pub poll_timeout: Duration,
    pub push_timeout: Duration,
    pub pop_timeout: Duration,
    pub backoff_start: Duration,
    pub backoff_max: Duration,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_pending: usize,
    pub max_inflight_flushes: usize,
    pub capture_breaker: BreakerSettings,
    pub processing_breaker: BreakerSettings,
    pub storage_breaker: BreakerSettings,
    pub rate_window: Duration,
    pub error_window: Duration,
    pub status_interval: Duration,
    pub capture_deadline: Duration,
    pub drain_deadline: Duration,
    pub flush_deadline: Duration,
    pub close_deadline: Duration,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self::from(&Opts::default())
    }
}

impl From<&Opts> for PipelineTuning {
    fn from(opts: &Opts) -> Self {
        Self {
            min_interval: opts.min_interval(),
            channel_capacity: opts.channel_capacity.max(1),
            transmit_capacity: ChannelConsts::TRANSMIT_CAPACITY,
            poll_timeout: opts.poll_timeout,
            push_timeout: opts.push_timeout,
            pop_timeout: opts.pop_timeout,
            backoff_start: CaptureConsts::BACKOFF_START,
            backoff_max: CaptureConsts::BACKOFF_MAX,
            batch_size: opts.batch_size.max(1),
            flush_interval: opts.flush_interval,
            max_pending: opts.max_pending.max(opts.batch_size).max(1),
            max_inflight_flushes: opts.max_inflight_flushes.max(1),
            capture_breaker: BreakerSettings {
                failure_threshold: opts.capture_failure_threshold,
                cooldown: opts.capture_cooldown,
            },
            processing_breaker: BreakerSettings {
                failure_threshold: opts.processing_failure_threshold,
                cooldown: opts.processing_cooldown,
            },
            storage_breaker: BreakerSettings {
                failure_threshold: opts.storage_failure_threshold,
                cooldown: opts.storage_cooldown,
            },
            rate_window: opts.rate_window,
            error_window: opts.error_window,
            status_interval: opts.status_interval,
            capture_deadline: CaptureConsts::STOP_DEADLINE,
            drain_deadline: ChannelConsts::DRAIN_DEADLINE,
            flush_deadline: BatchConsts::FLUSH_DEADLINE,
            close_deadline: BatchConsts::CLOSE_DEADLINE,
        }
    }
}

/// Everything the pipeline calls out to. All optional: a pipeline with no collaborators still
/// captures, counts and drops.
#[derive(Default)]
pub struct Collaborators {
    pub decoder: Option<Arc<dyn Decoder>>,
    pub matcher: Option<Arc<dyn DiagnosticMatcher>>,
    /// `None` runs without durable logging; every batch is counted as not logged.
    pub storage: Option<Box<dyn Storage>>,
    pub sinks: Vec<Box<dyn Sink>>,
    pub filters: Vec<Box<dyn FrameFilter>>,
    pub on_hardware_error: Option<ErrorCallback>,
    pub status_observers: Vec<StatusCallback>,
}

/// Worker lifecycle: Idle → Running → Stopping → Stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

/// Lock-free cell holding a [`LoopState`], shared by a worker and the controller.
#[derive(Debug)]
pub struct LoopStatus(AtomicU8);

impl Default for LoopStatus {
    fn default() -> Self {
        Self(AtomicU8::new(LoopState::Idle as u8))
    }
}

impl LoopStatus {
    pub fn get(&self) -> LoopState {
        match self.0.load(Ordering::Acquire) {
            0 => LoopState::Idle,
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }

    pub fn set(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.get() == LoopState::Running
    }

    /// Running → Stopping. Returns false if the worker was not running.
    pub fn request_stop(&self) -> bool {
        self.0
            .compare_exchange(
                LoopState::Running as u8,
                LoopState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Join `handle` if it finishes within `deadline`. `None` means it did not and was detached.
pub fn join_within<T>(handle: JoinHandle<T>, deadline: Duration) -> Option<thread::Result<T>> {
    let until = Instant::now() + deadline;
    while !handle.is_finished() {
        if Instant::now() >= until {
            return None;
        }
        thread::sleep(Duration::from_millis(2));
    }
    Some(handle.join())
}

/// Sleep up to `total`, waking early once `keep_going` returns false.
pub fn sleep_while(total: Duration, mut keep_going: impl FnMut() -> bool) {
    let slice = Duration::from_millis(10);
    let until = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= until || !keep_going() {
            return;
        }
        thread::sleep(slice.min(until - now));
    }
}
