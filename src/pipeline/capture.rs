//! Producer worker: hardware → rate limiter → capture breaker → bounded channel.
//!
//! Owns the hardware handle for its whole life and closes it on exit, whatever the exit path.
//! Transmit requests reach the hardware through a command channel drained between polls.

use anyhow::{Context, Result, anyhow};
use log::{debug, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::hardware::Hardware;
use crate::pipeline::breaker::CircuitBreaker;
use crate::pipeline::channel::{ChannelRx, ChannelTx, PushError};
use crate::pipeline::context::{ErrorCallback, LoopState, LoopStatus, PipelineTuning, sleep_while};
use crate::pipeline::error_handler::LogSampler;
use crate::pipeline::health::{Counters, HealthAccounting};
use crate::pipeline::rate::RateLimiter;
use crate::types::RawFrame;

/// Frame queued for transmission by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRequest {
    pub id: u32,
    pub payload: Vec<u8>,
}

/// Exponential delay after consecutive hardware errors; reset by any successful poll.
#[derive(Clone, Debug)]
pub struct Backoff {
    start: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            max: max.max(start),
            current: None,
        }
    }

    /// Next delay: `start`, then doubling, capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.start,
            Some(d) => (d * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

pub struct CaptureLoop {
    hardware: Box<dyn Hardware>,
    limiter: RateLimiter,
    out: ChannelTx<RawFrame>,
    commands: ChannelRx<TxRequest>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthAccounting>,
    state: Arc<LoopStatus>,
    exhausted: Arc<AtomicBool>,
    on_error: Option<ErrorCallback>,
    poll_timeout: Duration,
    push_timeout: Duration,
    backoff: Backoff,
    drop_log: LogSampler,
    error_log: LogSampler,
}

/// Shared handles a capture loop is built from.
pub struct CaptureParts {
    pub out: ChannelTx<RawFrame>,
    pub commands: ChannelRx<TxRequest>,
    pub breaker: Arc<CircuitBreaker>,
    pub health: Arc<HealthAccounting>,
    pub state: Arc<LoopStatus>,
    pub exhausted: Arc<AtomicBool>,
    pub on_error: Option<ErrorCallback>,
}

impl CaptureLoop {
    pub fn new(hardware: Box<dyn Hardware>, parts: CaptureParts, tuning: &PipelineTuning) -> Self {
        Self {
            hardware,
            limiter: RateLimiter::new(tuning.min_interval),
            out: parts.out,
            commands: parts.commands,
            breaker: parts.breaker,
            health: parts.health,
            state: parts.state,
            exhausted: parts.exhausted,
            on_error: parts.on_error,
            poll_timeout: tuning.poll_timeout,
            push_timeout: tuning.push_timeout,
            backoff: Backoff::new(tuning.backoff_start, tuning.backoff_max),
            drop_log: LogSampler::for_drops(),
            error_log: LogSampler::for_errors(),
        }
    }

    /// Mark Running and start the worker thread.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let state = Arc::clone(&self.state);
        state.set(LoopState::Running);
        thread::Builder::new()
            .name("canflow-capture".to_string())
            .spawn(move || self.run())
            .map_err(|e| {
                state.set(LoopState::Stopped);
                anyhow!(e)
            })
            .context("spawn capture thread")
    }

    /// Loop until the state leaves Running, then release the hardware.
    pub fn run(mut self) {
        debug!("capture: started on {}", self.hardware.describe());
        while self.state.is_running() {
            if catch_unwind(AssertUnwindSafe(|| self.step())).is_err() {
                self.hardware_fault(anyhow!("capture step panicked"));
            }
        }
        if let Err(e) = self.hardware.close() {
            warn!("capture: closing hardware failed: {e:#}");
        }
        self.state.set(LoopState::Stopped);
        debug!("capture: stopped");
    }

    /// One iteration: pending transmits, one bounded poll, admission of the result.
    pub fn step(&mut self) {
        self.drain_commands();
        match self.hardware.poll(self.poll_timeout) {
            Ok(Some(frame)) => {
                self.backoff.reset();
                self.admit(frame);
            }
            Ok(None) => {
                self.backoff.reset();
                if self.hardware.is_exhausted() {
                    self.exhausted.store(true, Ordering::Release);
                }
            }
            Err(e) => self.hardware_fault(e),
        }
    }

    fn admit(&mut self, frame: RawFrame) {
        let counters = &self.health.counters;
        Counters::bump(&counters.captured);
        if !self.limiter.admit(frame.arrival) {
            Counters::bump(&counters.rate_dropped);
            return;
        }
        let now = Instant::now();
        if !self.breaker.allow_at(now) {
            let n = Counters::bump(&counters.breaker_shed);
            if self.drop_log.sample().is_some() {
                warn!("capture: breaker open, shedding frames ({n} so far)");
            }
            return;
        }
        match self.out.try_push(frame, self.push_timeout) {
            Ok(()) => self.breaker.record_success_at(now),
            Err(PushError::Full(_)) => {
                let n = Counters::bump(&counters.channel_dropped);
                self.breaker.record_failure_at(now);
                if self.drop_log.sample().is_some() {
                    warn!(
                        "capture: {} full ({} slots), dropped {n} frames so far",
                        self.out.name(),
                        self.out.capacity()
                    );
                }
            }
            Err(PushError::Closed(_)) => {
                Counters::bump(&counters.channel_dropped);
                warn!("capture: {} closed by consumer; stopping", self.out.name());
                self.state.request_stop();
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(req) = self.commands.try_pop(Duration::ZERO) {
            match self.hardware.send(req.id, &req.payload) {
                Ok(()) => {
                    Counters::bump(&self.health.counters.transmitted);
                }
                Err(e) => self.report_error(e.context(format!("send {:#X}", req.id))),
            }
        }
    }

    fn report_error(&self, e: anyhow::Error) {
        let n = Counters::bump(&self.health.counters.hardware_errors);
        self.health.record_error(Instant::now());
        if let Some(cb) = &self.on_error
            && catch_unwind(AssertUnwindSafe(|| cb(&e))).is_err()
        {
            warn!("capture: error callback panicked");
        }
        if self.error_log.sample().is_some() {
            warn!("capture: hardware error #{n}: {e:#}");
        }
    }

    /// Count, report, then back off without delaying a stop request.
    fn hardware_fault(&mut self, e: anyhow::Error) {
        self.report_error(e);
        let delay = self.backoff.next_delay();
        let state = &self.state;
        sleep_while(delay, || state.is_running());
    }
}
