//! Lifecycle owner: builds the stages, starts their workers, reports status, and stops them in
//! order (capture, drain, final flush, storage close). Every wait in `stop` has a deadline.

use anyhow::{Result, bail, ensure};
use log::{debug, error, info, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};

use crate::engine::hardware::Hardware;
use crate::pipeline::batch::BatchLogger;
use crate::pipeline::breaker::CircuitBreaker;
use crate::pipeline::capture::{CaptureLoop, CaptureParts, TxRequest};
use crate::pipeline::channel::{BoundedChannel, ChannelRx, ChannelTx, PushError};
use crate::pipeline::context::{
    BreakerSettings, Collaborators, LoopStatus, PipelineTuning, StatusCallback, join_within,
    sleep_while,
};
use crate::pipeline::error_handler::report_shutdown;
use crate::pipeline::health::{CounterSnapshot, HealthAccounting, HealthSnapshot, Stage};
use crate::pipeline::processing::{ProcessingLoop, ProcessingParts};
use crate::types::{MAX_EXTENDED_ID, MAX_PAYLOAD_LEN, RawFrame};

/// Resident memory of this process, if the platform reports it.
pub fn current_rss_bytes(sys: &mut System) -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory())
}

/// Handles that exist only while the pipeline runs.
struct Running {
    capture: JoinHandle<()>,
    processing: JoinHandle<()>,
    reporter: Option<JoinHandle<()>>,
    reporter_stop: Arc<AtomicBool>,
    queue: ChannelRx<RawFrame>,
    commands: ChannelTx<TxRequest>,
    logger: Arc<BatchLogger>,
    exhausted: Arc<AtomicBool>,
}

pub struct PipelineController {
    tuning: PipelineTuning,
    health: Arc<HealthAccounting>,
    capture_breaker: Arc<CircuitBreaker>,
    processing_breaker: Arc<CircuitBreaker>,
    storage_breaker: Arc<CircuitBreaker>,
    capture_state: Arc<LoopStatus>,
    processing_state: Arc<LoopStatus>,
    /// Last resident memory sampled by the status reporter (0 = unknown).
    rss_bytes: Arc<AtomicU64>,
    running: Option<Running>,
}

fn breaker(name: &'static str, s: BreakerSettings) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(name, s.failure_threshold, s.cooldown))
}

impl PipelineController {
    pub fn new(tuning: PipelineTuning) -> Self {
        let health = Arc::new(HealthAccounting::new(tuning.rate_window, tuning.error_window));
        let capture_breaker = breaker("capture", tuning.capture_breaker);
        let processing_breaker = breaker("processing", tuning.processing_breaker);
        let storage_breaker = breaker("storage", tuning.storage_breaker);
        health.register_breaker(Stage::Capture, Arc::clone(&capture_breaker));
        health.register_breaker(Stage::Processing, Arc::clone(&processing_breaker));
        health.register_breaker(Stage::Storage, Arc::clone(&storage_breaker));
        Self {
            tuning,
            health,
            capture_breaker,
            processing_breaker,
            storage_breaker,
            capture_state: Arc::new(LoopStatus::default()),
            processing_state: Arc::new(LoopStatus::default()),
            rss_bytes: Arc::new(AtomicU64::new(0)),
            running: None,
        }
    }

    /// Start every worker. Fails (and starts nothing) when the hardware is not connected.
    pub fn start(&mut self, hardware: Box<dyn Hardware>, collab: Collaborators) -> Result<()> {
        ensure!(self.running.is_none(), "pipeline already started");
        if !hardware.is_connected() {
            bail!("hardware not connected: {}", hardware.describe());
        }
        let t = &self.tuning;
        let (frame_tx, frame_rx) = BoundedChannel::new::<RawFrame>("capture queue", t.channel_capacity);
        let (cmd_tx, cmd_rx) = BoundedChannel::new::<TxRequest>("transmit queue", t.transmit_capacity);
        let logger = Arc::new(
            BatchLogger::new(
                collab.storage,
                Arc::clone(&self.storage_breaker),
                Arc::clone(&self.health),
            )
            .with_lock_wait(t.flush_deadline),
        );
        let exhausted = Arc::new(AtomicBool::new(false));

        let processing = ProcessingLoop::new(
            ProcessingParts {
                input: frame_rx.clone(),
                decoder: collab.decoder,
                matcher: collab.matcher,
                filters: collab.filters,
                sinks: collab.sinks,
                logger: Arc::clone(&logger),
                breaker: Arc::clone(&self.processing_breaker),
                health: Arc::clone(&self.health),
                state: Arc::clone(&self.processing_state),
            },
            t,
        );
        let capture = CaptureLoop::new(
            hardware,
            CaptureParts {
                out: frame_tx,
                commands: cmd_rx,
                breaker: Arc::clone(&self.capture_breaker),
                health: Arc::clone(&self.health),
                state: Arc::clone(&self.capture_state),
                exhausted: Arc::clone(&exhausted),
                on_error: collab.on_hardware_error,
            },
            t,
        );

        let processing = processing.spawn()?;
        let capture = match capture.spawn() {
            Ok(h) => h,
            Err(e) => {
                // Processing exits on its own once the (dropped) capture sender closes the queue.
                self.processing_state.request_stop();
                let deadline = t.drain_deadline + t.flush_deadline + t.pop_timeout;
                match join_within(processing, deadline) {
                    Some(Ok(())) => debug!("processing joined after failed start"),
                    Some(Err(_)) => error!("processing thread panicked"),
                    None => error!(
                        "HARD STOP: processing worker did not finish within {deadline:?}; detached"
                    ),
                }
                if let Err(ce) = logger.close_within(t.close_deadline) {
                    warn!("closing storage failed: {ce:#}");
                }
                return Err(e);
            }
        };

        let reporter_stop = Arc::new(AtomicBool::new(false));
        let reporter = self.spawn_reporter(
            collab.status_observers,
            frame_rx.clone(),
            Arc::clone(&reporter_stop),
        );

        info!(
            "Pipeline started (queue {}, {} frames/s max, batch {})",
            t.channel_capacity,
            if t.min_interval.is_zero() {
                "unlimited".to_string()
            } else {
                format!("{:.0}", 1.0 / t.min_interval.as_secs_f64())
            },
            t.batch_size
        );
        self.running = Some(Running {
            capture,
            processing,
            reporter,
            reporter_stop,
            queue: frame_rx,
            commands: cmd_tx,
            logger,
            exhausted,
        });
        Ok(())
    }

    fn spawn_reporter(
        &self,
        mut observers: Vec<StatusCallback>,
        queue: ChannelRx<RawFrame>,
        stop: Arc<AtomicBool>,
    ) -> Option<JoinHandle<()>> {
        let interval = self.tuning.status_interval;
        if interval.is_zero() {
            return None;
        }
        let health = Arc::clone(&self.health);
        let rss_cache = Arc::clone(&self.rss_bytes);
        let spawned = thread::Builder::new()
            .name("canflow-status".to_string())
            .spawn(move || {
                let mut sys = System::new();
                while !stop.load(Ordering::Acquire) {
                    sleep_while(interval, || !stop.load(Ordering::Acquire));
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let rss = current_rss_bytes(&mut sys);
                    rss_cache.store(rss.unwrap_or(0), Ordering::Relaxed);
                    let snap = health.snapshot(queue.len(), rss);
                    debug!(
                        "status: {:.1} msg/s, {:.2} err/s, queue {}, drops {}, breakers {:?}",
                        snap.message_rate,
                        snap.error_rate,
                        snap.queue_depth,
                        snap.drop_count,
                        snap.breaker_states
                    );
                    for observer in observers.iter_mut() {
                        if catch_unwind(AssertUnwindSafe(|| observer(&snap))).is_err() {
                            warn!("status observer panicked");
                        }
                    }
                }
            });
        match spawned {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("status reporter not started: {e}");
                None
            }
        }
    }

    /// Queue a frame for transmission by the capture worker. `Ok(false)` when the transmit queue
    /// is full.
    pub fn send_frame(&self, id: u32, payload: &[u8]) -> Result<bool> {
        ensure!(id <= MAX_EXTENDED_ID, "id {id:#X} exceeds 29 bits");
        ensure!(
            payload.len() <= MAX_PAYLOAD_LEN,
            "payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
            payload.len()
        );
        let Some(running) = &self.running else {
            bail!("pipeline is not running");
        };
        let req = TxRequest {
            id,
            payload: payload.to_vec(),
        };
        match running.commands.try_push(req, Duration::ZERO) {
            Ok(()) => Ok(true),
            Err(PushError::Full(_)) => Ok(false),
            Err(PushError::Closed(_)) => bail!("capture worker has exited"),
        }
    }

    /// Current health, readable from any thread.
    pub fn status(&self) -> HealthSnapshot {
        let rss = match self.rss_bytes.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        };
        self.health.snapshot(self.queue_depth(), rss)
    }

    pub fn health(&self) -> Arc<HealthAccounting> {
        Arc::clone(&self.health)
    }

    pub fn tuning(&self) -> &PipelineTuning {
        &self.tuning
    }

    pub fn queue_depth(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.queue.len())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// True once a finite source has delivered everything it had.
    pub fn is_source_exhausted(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| r.exhausted.load(Ordering::Acquire))
    }

    /// True when the source is exhausted and every captured frame has left the queue.
    pub fn is_idle_after_source(&self) -> bool {
        self.is_source_exhausted() && self.queue_depth() == 0
    }

    /// Orderly shutdown: stop capture, drain processing, final flush, close storage. Problems
    /// are logged, never returned. Returns the final counters.
    pub fn stop(&mut self) -> CounterSnapshot {
        let Some(running) = self.running.take() else {
            return self.health.counters.snapshot();
        };
        let t = &self.tuning;

        self.capture_state.request_stop();
        match join_within(running.capture, t.capture_deadline + t.poll_timeout) {
            Some(Ok(())) => debug!("capture joined"),
            Some(Err(_)) => error!("capture thread panicked"),
            None => error!(
                "HARD STOP: capture worker did not exit within {:?}; detached with its hardware handle",
                t.capture_deadline
            ),
        }

        self.processing_state.request_stop();
        let processing_deadline = t.drain_deadline + t.flush_deadline + t.pop_timeout;
        match join_within(running.processing, processing_deadline) {
            Some(Ok(())) => debug!("processing joined"),
            Some(Err(_)) => error!("processing thread panicked"),
            None => error!(
                "HARD STOP: processing worker did not finish within {processing_deadline:?}; detached"
            ),
        }

        running.reporter_stop.store(true, Ordering::Release);
        if let Some(h) = running.reporter
            && h.join().is_err()
        {
            warn!("status reporter panicked");
        }

        if let Err(e) = running.logger.close_within(t.close_deadline) {
            warn!("closing storage failed: {e:#}");
        }

        let counters = self.health.counters.snapshot();
        report_shutdown(&counters);
        counters
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if self.running.is_some() {
            self.stop();
        }
    }
}
