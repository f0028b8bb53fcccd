//! Consumer worker: channel → validate/filter → decode → diagnostics → sinks → pending batch →
//! flush tasks.

use anyhow::{Context, Result, anyhow, ensure};
use log::{debug, error, warn};
use std::collections::{HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::decoder::Decoder;
use crate::engine::diagnostics::{DiagnosticMatcher, find_diagnostics};
use crate::engine::sinks::Sink;
use crate::pipeline::batch::BatchLogger;
use crate::pipeline::breaker::CircuitBreaker;
use crate::pipeline::channel::{ChannelRx, PopError};
use crate::pipeline::context::{LoopState, LoopStatus, PipelineTuning, join_within};
use crate::pipeline::error_handler::LogSampler;
use crate::pipeline::health::{Counters, HealthAccounting};
use crate::types::{MAX_EXTENDED_ID, MAX_PAYLOAD_LEN, MAX_STANDARD_ID, ProcessedRecord, RawFrame, now_ns};

/// Pre-processing gate. A frame rejected by any filter is counted and skipped.
pub trait FrameFilter: Send {
    fn accept(&self, frame: &RawFrame) -> bool;
}

/// Accepts only the listed identifiers (an empty list accepts everything).
#[derive(Clone, Debug, Default)]
pub struct IdFilter {
    ids: HashSet<u32>,
}

impl IdFilter {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }
}

impl FrameFilter for IdFilter {
    fn accept(&self, frame: &RawFrame) -> bool {
        self.ids.is_empty() || self.ids.contains(&frame.id)
    }
}

/// Reject frames no bus could carry: id wider than its format allows, payload over 8 bytes.
pub fn validate_frame(frame: &RawFrame) -> Result<()> {
    let max_id = if frame.extended {
        MAX_EXTENDED_ID
    } else {
        MAX_STANDARD_ID
    };
    ensure!(frame.id <= max_id, "id {:#X} out of range", frame.id);
    ensure!(
        frame.payload.len() <= MAX_PAYLOAD_LEN,
        "payload of {} bytes on id {:#X}",
        frame.payload.len(),
        frame.id
    );
    Ok(())
}

/// Run a collaborator call, turning a panic into `None`.
fn guarded<T>(f: impl FnOnce() -> T) -> Option<T> {
    catch_unwind(AssertUnwindSafe(f)).ok()
}

/// Collaborators and shared handles a processing loop is built from.
pub struct ProcessingParts {
    pub input: ChannelRx<RawFrame>,
    pub decoder: Option<Arc<dyn Decoder>>,
    pub matcher: Option<Arc<dyn DiagnosticMatcher>>,
    pub filters: Vec<Box<dyn FrameFilter>>,
    pub sinks: Vec<Box<dyn Sink>>,
    pub logger: Arc<BatchLogger>,
    pub breaker: Arc<CircuitBreaker>,
    pub health: Arc<HealthAccounting>,
    pub state: Arc<LoopStatus>,
}

pub struct ProcessingLoop {
    input: ChannelRx<RawFrame>,
    decoder: Option<Arc<dyn Decoder>>,
    matcher: Option<Arc<dyn DiagnosticMatcher>>,
    filters: Vec<Box<dyn FrameFilter>>,
    sinks: Vec<Box<dyn Sink>>,
    logger: Arc<BatchLogger>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthAccounting>,
    state: Arc<LoopStatus>,
    pending: VecDeque<ProcessedRecord>,
    flushes: Vec<JoinHandle<usize>>,
    last_flush: Instant,
    next_seq: u64,
    pop_timeout: Duration,
    batch_size: usize,
    flush_interval: Duration,
    max_pending: usize,
    max_inflight_flushes: usize,
    drain_deadline: Duration,
    flush_deadline: Duration,
    shed_log: LogSampler,
    error_log: LogSampler,
    evict_log: LogSampler,
}

impl ProcessingLoop {
    pub fn new(parts: ProcessingParts, tuning: &PipelineTuning) -> Self {
        Self {
            input: parts.input,
            decoder: parts.decoder,
            matcher: parts.matcher,
            filters: parts.filters,
            sinks: parts.sinks,
            logger: parts.logger,
            breaker: parts.breaker,
            health: parts.health,
            state: parts.state,
            pending: VecDeque::new(),
            flushes: Vec::new(),
            last_flush: Instant::now(),
            next_seq: 1,
            pop_timeout: tuning.pop_timeout,
            batch_size: tuning.batch_size.max(1),
            flush_interval: tuning.flush_interval,
            max_pending: tuning.max_pending.max(1),
            max_inflight_flushes: tuning.max_inflight_flushes.max(1),
            drain_deadline: tuning.drain_deadline,
            flush_deadline: tuning.flush_deadline,
            shed_log: LogSampler::for_drops(),
            error_log: LogSampler::for_errors(),
            evict_log: LogSampler::for_drops(),
        }
    }

    /// Mark Running and start the worker thread.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let state = Arc::clone(&self.state);
        state.set(LoopState::Running);
        thread::Builder::new()
            .name("canflow-processing".to_string())
            .spawn(move || self.run())
            .map_err(|e| {
                state.set(LoopState::Stopped);
                anyhow!(e)
            })
            .context("spawn processing thread")
    }

    /// Process until stopped (or every producer is gone), then drain, flush once and wait for
    /// in-flight flushes.
    pub fn run(mut self) {
        debug!("processing: started");
        while self.state.is_running() {
            match self.input.try_pop(self.pop_timeout) {
                Ok(frame) => self.handle(frame),
                Err(PopError::Empty) => {}
                Err(PopError::Closed) => {
                    debug!("processing: input closed");
                    break;
                }
            }
            self.maybe_flush();
        }
        self.drain();
        self.finish();
        self.state.set(LoopState::Stopped);
        debug!("processing: stopped");
    }

    /// Handle whatever is still queued, up to the drain deadline. Leftovers are counted as drops.
    fn drain(&mut self) {
        let until = Instant::now() + self.drain_deadline;
        let mut drained = 0_usize;
        while Instant::now() < until {
            match self.input.try_pop(Duration::ZERO) {
                Ok(frame) => {
                    self.handle(frame);
                    self.maybe_flush();
                    drained += 1;
                }
                Err(_) => break,
            }
        }
        let left = self.input.len();
        if left > 0 {
            Counters::add(&self.health.counters.channel_dropped, left as u64);
            warn!("processing: drain deadline reached with {left} frames still queued");
        }
        debug!("processing: drained {drained} frames at shutdown");
    }

    /// Final flush of everything pending, bounded wait for flush tasks, sink finish.
    fn finish(&mut self) {
        self.flush_now(self.pending.len());
        let until = Instant::now() + self.flush_deadline;
        for handle in self.flushes.drain(..) {
            let left = until.saturating_duration_since(Instant::now());
            match join_within(handle, left) {
                Some(Ok(_)) => {}
                Some(Err(_)) => error!("processing: flush task panicked"),
                None => warn!("processing: flush task still running at deadline; detached"),
            }
        }
        for sink in &mut self.sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.finish())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("processing: sink {} failed to finish: {e:#}", sink.name()),
                Err(_) => warn!("processing: sink {} panicked in finish", sink.name()),
            }
        }
    }

    /// Process one frame. Exactly one breaker outcome is recorded for every attempted frame.
    pub fn handle(&mut self, frame: RawFrame) {
        let now = Instant::now();
        let counters = &self.health.counters;
        if !self.breaker.allow_at(now) {
            let n = Counters::bump(&counters.breaker_shed);
            if self.shed_log.sample().is_some() {
                warn!("processing: breaker open, shedding frames ({n} so far)");
            }
            return;
        }

        if let Err(e) = validate_frame(&frame) {
            Counters::bump(&counters.invalid_frames);
            self.health.record_error(now);
            self.breaker.record_failure_at(now);
            if self.error_log.sample().is_some() {
                warn!("processing: invalid frame: {e:#}");
            }
            return;
        }

        let mut faulted = false;
        let mut accepted = true;
        for filter in &self.filters {
            match guarded(|| filter.accept(&frame)) {
                Some(true) => {}
                Some(false) => {
                    accepted = false;
                    break;
                }
                None => faulted = true,
            }
        }
        if !accepted {
            Counters::bump(&counters.filtered);
            self.breaker.record_success_at(now);
            return;
        }

        let decoded = match &self.decoder {
            Some(d) => guarded(|| d.decode(frame.id, &frame.payload)).unwrap_or_else(|| {
                faulted = true;
                None
            }),
            None => None,
        };
        let diagnostics = match &self.matcher {
            Some(m) => guarded(|| find_diagnostics(m.as_ref(), decoded.as_ref(), &frame.payload_hex()))
                .unwrap_or_else(|| {
                    faulted = true;
                    Vec::new()
                }),
            None => Vec::new(),
        };

        Counters::bump(&counters.processed);
        if frame.direction.is_rx() {
            Counters::bump(&counters.rx);
        } else {
            Counters::bump(&counters.tx);
        }
        if decoded.is_some() {
            Counters::bump(&counters.decoded);
        }
        if !diagnostics.is_empty() {
            Counters::add(&counters.dtcs, diagnostics.len() as u64);
        }
        self.health.record_accepted(now);

        let record = ProcessedRecord {
            frame,
            decoded,
            diagnostics,
            seq: self.next_seq,
            processed_ns: now_ns(),
        };
        self.next_seq += 1;

        self.dispatch(&record);
        self.push_pending(record);

        if faulted {
            self.health.record_error(now);
            self.breaker.record_failure_at(now);
            if self.error_log.sample().is_some() {
                warn!("processing: a filter, decoder or matcher panicked; frame kept undecoded");
            }
        } else {
            self.breaker.record_success_at(now);
        }
    }

    fn dispatch(&mut self, record: &ProcessedRecord) {
        for sink in &mut self.sinks {
            let outcome = catch_unwind(AssertUnwindSafe(|| sink.on_record(record)))
                .unwrap_or_else(|_| Err(anyhow!("panicked")));
            if let Err(e) = outcome {
                let n = Counters::bump(&self.health.counters.sink_errors);
                self.health.record_error(Instant::now());
                if self.error_log.sample().is_some() {
                    warn!("processing: sink {} failed (#{n}): {e:#}", sink.name());
                }
            }
        }
    }

    /// Append to the pending batch; past the bound, drop the oldest half.
    fn push_pending(&mut self, record: ProcessedRecord) {
        self.pending.push_back(record);
        if self.pending.len() > self.max_pending {
            let evict = self.pending.len() / 2;
            self.pending.drain(..evict);
            let total = Counters::add(&self.health.counters.evicted, evict as u64);
            if self.evict_log.sample().is_some() {
                warn!("processing: pending batch over {}, evicted {evict} oldest ({total} so far)", self.max_pending);
            }
        }
    }

    fn reap_flushes(&mut self) {
        let mut i = 0;
        while i < self.flushes.len() {
            if self.flushes[i].is_finished() {
                if self.flushes.swap_remove(i).join().is_err() {
                    error!("processing: flush task panicked");
                }
            } else {
                i += 1;
            }
        }
    }

    /// Start flush tasks for full batches (or a partial one once the interval passed) while
    /// in-flight slots are free.
    fn maybe_flush(&mut self) {
        self.reap_flushes();
        while !self.pending.is_empty() && self.flushes.len() < self.max_inflight_flushes {
            let full = self.pending.len() >= self.batch_size;
            if !full && self.last_flush.elapsed() < self.flush_interval {
                break;
            }
            self.flush_now(self.batch_size);
        }
    }

    /// Move up to `max` pending records into a new flush task, ignoring the in-flight limit.
    fn flush_now(&mut self, max: usize) {
        let n = self.pending.len().min(max);
        self.last_flush = Instant::now();
        if n == 0 {
            return;
        }
        let batch: Vec<ProcessedRecord> = self.pending.drain(..n).collect();
        let logger = Arc::clone(&self.logger);
        match thread::Builder::new()
            .name("canflow-flush".to_string())
            .spawn(move || logger.flush(batch))
        {
            Ok(handle) => self.flushes.push(handle),
            Err(e) => {
                Counters::add(&self.health.counters.not_logged, n as u64);
                error!("processing: could not start flush task for {n} records: {e}");
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}
