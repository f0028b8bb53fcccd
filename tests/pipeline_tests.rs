//! End-to-end pipeline tests: scripted hardware through capture, processing, sinks and storage.

use anyhow::{Result, anyhow, bail};
use canflow::engine::db_ops::{TimeRange, load_messages};
use canflow::engine::{Hardware, SignalDatabase, SimulatedBus, Sink, SqliteStorage, Storage, open_db};
use canflow::pipeline::{BreakerSettings, BreakerState, IdFilter, Stage};
use canflow::{
    Collaborators, Direction, HealthSnapshot, PipelineController, PipelineTuning, ProcessedRecord,
    RawFrame,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const MS: Duration = Duration::from_millis(1);

enum Step {
    Frame(RawFrame),
    Fail,
}

/// Plays a fixed script of frames and faults, then reports itself exhausted.
struct ScriptedHardware {
    script: VecDeque<Step>,
    connected: bool,
    closed: Arc<AtomicBool>,
}

impl ScriptedHardware {
    fn new(script: Vec<Step>) -> Self {
        Self {
            script: script.into(),
            connected: true,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn frames(frames: Vec<RawFrame>) -> Self {
        Self::new(frames.into_iter().map(Step::Frame).collect())
    }
}

impl Hardware for ScriptedHardware {
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawFrame>> {
        match self.script.pop_front() {
            Some(Step::Frame(f)) => Ok(Some(f)),
            Some(Step::Fail) => Err(anyhow!("bus off")),
            None => {
                thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn send(&mut self, _id: u32, _payload: &[u8]) -> Result<()> {
        bail!("scripted hardware cannot transmit")
    }

    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_exhausted(&self) -> bool {
        self.script.is_empty()
    }
}

/// Keeps every record it sees; optionally slow or failing.
#[derive(Clone, Default)]
struct RecordingSink {
    seen: Arc<Mutex<Vec<ProcessedRecord>>>,
    delay: Duration,
}

impl RecordingSink {
    fn records(&self) -> Vec<ProcessedRecord> {
        self.seen.lock().unwrap().clone()
    }
}

impl Sink for RecordingSink {
    fn on_record(&mut self, record: &ProcessedRecord) -> Result<()> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.seen.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

struct FailingSink;

impl Sink for FailingSink {
    fn on_record(&mut self, _record: &ProcessedRecord) -> Result<()> {
        bail!("sink unavailable")
    }
}

struct PanickingSink;

impl Sink for PanickingSink {
    fn on_record(&mut self, _record: &ProcessedRecord) -> Result<()> {
        panic!("sink bug")
    }
}

/// Storage whose inserts block until the gate opens (or a 10 s safety cap passes). Keeps the
/// sequence numbers of committed records.
#[derive(Clone, Default)]
struct GatedStorage {
    open: Arc<AtomicBool>,
    entered: Arc<AtomicUsize>,
    in_tx: Arc<Mutex<Vec<u64>>>,
    committed: Arc<Mutex<Vec<u64>>>,
}

impl GatedStorage {
    fn release(&self) {
        self.open.store(true, Ordering::Release);
    }

    fn committed(&self) -> Vec<u64> {
        let mut seqs = self.committed.lock().unwrap().clone();
        seqs.sort_unstable();
        seqs
    }
}

impl Storage for GatedStorage {
    fn begin_transaction(&mut self) -> Result<()> {
        self.in_tx.lock().unwrap().clear();
        Ok(())
    }

    fn insert(&mut self, record: &ProcessedRecord) -> Result<()> {
        self.entered.fetch_add(1, Ordering::AcqRel);
        let cap = Instant::now() + Duration::from_secs(10);
        while !self.open.load(Ordering::Acquire) && Instant::now() < cap {
            thread::sleep(MS);
        }
        self.in_tx.lock().unwrap().push(record.seq);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut *self.in_tx.lock().unwrap());
        self.committed.lock().unwrap().extend(batch);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.in_tx.lock().unwrap().clear();
        Ok(())
    }
}

/// Ignores its poll timeout and sits in every poll for seconds.
struct StubbornHardware {
    closed: Arc<AtomicBool>,
}

impl Hardware for StubbornHardware {
    fn poll(&mut self, _timeout: Duration) -> Result<Option<RawFrame>> {
        thread::sleep(Duration::from_secs(3));
        Ok(None)
    }

    fn send(&mut self, _id: u32, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(2 * MS);
    }
    done()
}

fn tuning() -> PipelineTuning {
    PipelineTuning {
        min_interval: Duration::ZERO,
        pop_timeout: 5 * MS,
        poll_timeout: 2 * MS,
        flush_interval: 10 * MS,
        status_interval: Duration::ZERO,
        ..PipelineTuning::default()
    }
}

fn frame(id: u32) -> RawFrame {
    RawFrame::new(id, &[1, 2, 3, 4, 5, 6, 7, 8], Direction::Received)
}

fn run_until_idle(controller: &mut PipelineController) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !controller.is_idle_after_source() && Instant::now() < deadline {
        thread::sleep(2 * MS);
    }
}

// --- Rate limiting ---

#[test]
fn test_rate_limit_drops_frames_closer_than_min_interval() {
    let t0 = Instant::now();
    let hw = ScriptedHardware::frames(vec![
        frame(0x100).with_arrival(t0),
        frame(0x100).with_arrival(t0 + 5 * MS),
        frame(0x100).with_arrival(t0 + 10 * MS),
    ]);
    let sink = RecordingSink::default();
    let collab = Collaborators {
        sinks: vec![Box::new(sink.clone())],
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(PipelineTuning {
        min_interval: 10 * MS,
        ..tuning()
    });
    controller.start(Box::new(hw), collab).unwrap();
    run_until_idle(&mut controller);
    let counters = controller.stop();

    assert_eq!(counters.captured, 3);
    assert_eq!(counters.rate_dropped, 1);
    assert_eq!(counters.processed, 2);
    assert_eq!(sink.records().len(), 2);
}

// --- Ordering / decoding / storage ---

#[test]
fn test_frames_processed_in_capture_order() {
    let hw = ScriptedHardware::frames((0..50).map(frame).collect());
    let sink = RecordingSink::default();
    let collab = Collaborators {
        sinks: vec![Box::new(sink.clone())],
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(tuning());
    controller.start(Box::new(hw), collab).unwrap();
    run_until_idle(&mut controller);
    let counters = controller.stop();

    assert_eq!(counters.processed, 50);
    let records = sink.records();
    let ids: Vec<u32> = records.iter().map(|r| r.frame.id).collect();
    assert_eq!(ids, (0..50).collect::<Vec<_>>());
    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (1..=50).collect::<Vec<_>>());
}

#[test]
fn test_unknown_id_still_reaches_sinks_and_storage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.db");
    let db = SignalDatabase::from_toml_str(
        "[[message]]\nid = 0x100\nname = \"EngineData\"\nlength = 8\n",
    )
    .unwrap();
    let hw = ScriptedHardware::frames(vec![frame(0x100), frame(0x321)]);
    let sink = RecordingSink::default();
    let collab = Collaborators {
        decoder: Some(Arc::new(db)),
        storage: Some(Box::new(SqliteStorage::open(&path).unwrap())),
        sinks: vec![Box::new(sink.clone())],
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(tuning());
    controller.start(Box::new(hw), collab).unwrap();
    run_until_idle(&mut controller);
    let counters = controller.stop();

    assert_eq!(counters.processed, 2);
    assert_eq!(counters.decoded, 1);
    assert_eq!(counters.stored, 2);
    let records = sink.records();
    assert_eq!(records[0].symbolic_name(), Some("EngineData"));
    assert_eq!(records[1].symbolic_name(), None);

    let conn = open_db(&path).unwrap();
    let msgs = load_messages(&conn, TimeRange::default()).unwrap();
    assert_eq!(msgs.len(), 2);
    let unknown = msgs.iter().find(|m| m.can_id == 0x321).unwrap();
    assert_eq!(unknown.name, None);
}

#[test]
fn test_final_flush_stores_partial_batch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.db");
    let hw = ScriptedHardware::frames((0..7).map(frame).collect());
    let collab = Collaborators {
        storage: Some(Box::new(SqliteStorage::open(&path).unwrap())),
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(PipelineTuning {
        batch_size: 100,
        flush_interval: Duration::from_secs(60),
        ..tuning()
    });
    controller.start(Box::new(hw), collab).unwrap();
    run_until_idle(&mut controller);
    let counters = controller.stop();

    assert_eq!(counters.stored, 7);
    let conn = open_db(&path).unwrap();
    assert_eq!(load_messages(&conn, TimeRange::default()).unwrap().len(), 7);
}

// --- Overload ---

#[test]
fn test_full_channel_drops_without_blocking_capture() {
    let hw = ScriptedHardware::frames((0..20).map(frame).collect());
    let sink = RecordingSink {
        delay: 100 * MS,
        ..RecordingSink::default()
    };
    let collab = Collaborators {
        sinks: vec![Box::new(sink.clone())],
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(PipelineTuning {
        channel_capacity: 4,
        push_timeout: MS,
        ..tuning()
    });
    controller.start(Box::new(hw), collab).unwrap();
    run_until_idle(&mut controller);
    assert!(controller.queue_depth() <= 4);
    let counters = controller.stop();

    assert!(counters.channel_dropped >= 1);
    assert_eq!(
        counters.processed + counters.channel_dropped + counters.breaker_shed,
        20
    );
    assert_eq!(sink.records().len() as u64, counters.processed);
}

#[test]
fn test_processing_breaker_sheds_after_invalid_frames() {
    let mut bad = frame(0x800);
    bad.extended = false;
    let hw = ScriptedHardware::frames(vec![bad.clone(), bad, frame(0x100), frame(0x101)]);
    let mut controller = PipelineController::new(PipelineTuning {
        processing_breaker: BreakerSettings {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
        },
        ..tuning()
    });
    controller.start(Box::new(hw), Collaborators::default()).unwrap();
    run_until_idle(&mut controller);
    let status = controller.status();
    let counters = controller.stop();

    assert_eq!(counters.invalid_frames, 2);
    assert_eq!(counters.breaker_shed, 2);
    assert_eq!(counters.processed, 0);
    assert_eq!(status.breaker_states[&Stage::Processing], BreakerState::Open);
}

// --- Isolation ---

#[test]
fn test_failing_sinks_do_not_stop_processing() {
    let hw = ScriptedHardware::frames(vec![frame(0x1), frame(0x2), frame(0x3)]);
    let sink = RecordingSink::default();
    let collab = Collaborators {
        sinks: vec![
            Box::new(FailingSink),
            Box::new(PanickingSink),
            Box::new(sink.clone()),
        ],
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(tuning());
    controller.start(Box::new(hw), collab).unwrap();
    run_until_idle(&mut controller);
    let counters = controller.stop();

    assert_eq!(sink.records().len(), 3);
    assert_eq!(counters.sink_errors, 6);
    assert_eq!(counters.processed, 3);
}

#[test]
fn test_id_filter_skips_other_ids() {
    let hw = ScriptedHardware::frames(vec![frame(0x100), frame(0x200), frame(0x100)]);
    let sink = RecordingSink::default();
    let collab = Collaborators {
        filters: vec![Box::new(IdFilter::new([0x100]))],
        sinks: vec![Box::new(sink.clone())],
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(tuning());
    controller.start(Box::new(hw), collab).unwrap();
    run_until_idle(&mut controller);
    let counters = controller.stop();

    assert_eq!(counters.processed, 2);
    assert_eq!(counters.filtered, 1);
    assert!(sink.records().iter().all(|r| r.frame.id == 0x100));
}

#[test]
fn test_hardware_errors_reported_and_capture_continues() {
    let hw = ScriptedHardware::new(vec![Step::Fail, Step::Fail, Step::Frame(frame(0x100))]);
    let reported = Arc::new(AtomicUsize::new(0));
    let reported_cb = Arc::clone(&reported);
    let collab = Collaborators {
        on_hardware_error: Some(Box::new(move |_e: &anyhow::Error| {
            reported_cb.fetch_add(1, Ordering::Relaxed);
        })),
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(tuning());
    controller.start(Box::new(hw), collab).unwrap();
    run_until_idle(&mut controller);
    let counters = controller.stop();

    assert_eq!(counters.hardware_errors, 2);
    assert_eq!(reported.load(Ordering::Relaxed), 2);
    assert_eq!(counters.processed, 1);
}

// --- Lifecycle ---

#[test]
fn test_start_fails_when_hardware_not_connected() {
    let mut hw = ScriptedHardware::frames(vec![frame(0x100)]);
    hw.connected = false;
    let mut controller = PipelineController::new(tuning());
    assert!(controller.start(Box::new(hw), Collaborators::default()).is_err());
    assert!(!controller.is_running());
}

#[test]
fn test_start_twice_fails() {
    let mut controller = PipelineController::new(tuning());
    controller
        .start(Box::new(ScriptedHardware::frames(vec![])), Collaborators::default())
        .unwrap();
    assert!(
        controller
            .start(Box::new(ScriptedHardware::frames(vec![])), Collaborators::default())
            .is_err()
    );
    controller.stop();
}

#[test]
fn test_stop_closes_hardware_and_is_idempotent() {
    let hw = ScriptedHardware::frames(vec![frame(0x1)]);
    let closed = Arc::clone(&hw.closed);
    let mut controller = PipelineController::new(tuning());
    controller.start(Box::new(hw), Collaborators::default()).unwrap();
    run_until_idle(&mut controller);
    let first = controller.stop();
    assert!(closed.load(Ordering::Acquire));
    assert!(!controller.is_running());
    let second = controller.stop();
    assert_eq!(first, second);
}

#[test]
fn test_drop_stops_pipeline() {
    let hw = ScriptedHardware::frames(vec![frame(0x1)]);
    let closed = Arc::clone(&hw.closed);
    {
        let mut controller = PipelineController::new(tuning());
        controller.start(Box::new(hw), Collaborators::default()).unwrap();
    }
    assert!(closed.load(Ordering::Acquire));
}

#[test]
fn test_send_frame_is_echoed_as_tx() {
    let mut controller = PipelineController::new(tuning());
    assert!(controller.send_frame(0x123, &[0xAA]).is_err());
    controller
        .start(Box::new(SimulatedBus::with_rate(0)), Collaborators::default())
        .unwrap();
    assert!(controller.send_frame(0x123, &[0xAA]).unwrap());
    assert!(controller.send_frame(0x2000_0000, &[]).is_err());
    assert!(controller.send_frame(0x123, &[0; 9]).is_err());

    let health = controller.health();
    let deadline = Instant::now() + Duration::from_secs(5);
    while health.counters.snapshot().tx < 1 && Instant::now() < deadline {
        thread::sleep(2 * MS);
    }
    let counters = controller.stop();
    assert_eq!(counters.transmitted, 1);
    assert_eq!(counters.tx, 1);
    assert_eq!(counters.rx, 0);
}

#[test]
fn test_status_observers_receive_snapshots() {
    let snapshots: Arc<Mutex<Vec<HealthSnapshot>>> = Arc::default();
    let sink = Arc::clone(&snapshots);
    let collab = Collaborators {
        status_observers: vec![Box::new(move |s: &HealthSnapshot| {
            sink.lock().unwrap().push(s.clone());
        })],
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(PipelineTuning {
        status_interval: 20 * MS,
        ..tuning()
    });
    controller
        .start(Box::new(ScriptedHardware::frames(vec![frame(0x1)])), collab)
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while snapshots.lock().unwrap().is_empty() && Instant::now() < deadline {
        thread::sleep(5 * MS);
    }
    controller.stop();

    let snaps = snapshots.lock().unwrap();
    assert!(!snaps.is_empty());
    assert_eq!(snaps[0].breaker_states.len(), 3);
    assert!(
        snaps[0]
            .breaker_states
            .values()
            .all(|s| *s == BreakerState::Closed)
    );
}

// --- Shutdown deadlines and slow storage ---

#[test]
fn test_stop_returns_while_storage_is_hung() {
    let storage = GatedStorage::default();
    let hw = ScriptedHardware::frames(vec![frame(0x100)]);
    let collab = Collaborators {
        storage: Some(Box::new(storage.clone())),
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(PipelineTuning {
        drain_deadline: 100 * MS,
        flush_deadline: 300 * MS,
        close_deadline: 100 * MS,
        ..tuning()
    });
    controller.start(Box::new(hw), collab).unwrap();
    assert!(wait_for(|| storage.entered.load(Ordering::Acquire) > 0));

    let started = Instant::now();
    let counters = controller.stop();
    let took = started.elapsed();
    storage.release();

    assert!(took < Duration::from_secs(2), "stop took {took:?}");
    assert_eq!(counters.processed, 1);
    assert_eq!(counters.stored, 0);
    assert!(!controller.is_running());
}

#[test]
fn test_pending_bound_evicts_oldest_half() {
    let storage = GatedStorage::default();
    let hw = ScriptedHardware::frames((0..15).map(|i| frame(0x100 + i)).collect());
    let collab = Collaborators {
        storage: Some(Box::new(storage.clone())),
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(PipelineTuning {
        batch_size: 4,
        max_pending: 10,
        max_inflight_flushes: 1,
        flush_interval: Duration::from_secs(60),
        ..tuning()
    });
    controller.start(Box::new(hw), collab).unwrap();
    let health = controller.health();
    assert!(wait_for(|| health.counters.snapshot().processed == 15));

    // Batch 1..=4 is stuck in storage; 5..=15 piled up, 11 > 10 so 5..=9 went.
    let mid = health.counters.snapshot();
    assert_eq!(mid.evicted, 5);
    assert_eq!(mid.drop_count(), 5);

    storage.release();
    let counters = controller.stop();
    assert_eq!(counters.stored, 10);
    let mut expected: Vec<u64> = (1..=4).collect();
    expected.extend(10..=15);
    assert_eq!(storage.committed(), expected);
}

#[test]
fn test_frames_left_at_drain_deadline_count_as_dropped() {
    let sink = RecordingSink {
        delay: 50 * MS,
        ..RecordingSink::default()
    };
    let hw = ScriptedHardware::frames((0..20).map(frame).collect());
    let collab = Collaborators {
        sinks: vec![Box::new(sink.clone())],
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(PipelineTuning {
        drain_deadline: 100 * MS,
        ..tuning()
    });
    controller.start(Box::new(hw), collab).unwrap();
    assert!(wait_for(|| controller.is_source_exhausted()));
    let counters = controller.stop();

    assert_eq!(counters.captured, 20);
    assert!(counters.channel_dropped > 0);
    assert!(counters.processed < 20);
    assert_eq!(counters.processed + counters.channel_dropped, 20);
    assert_eq!(sink.records().len() as u64, counters.processed);
}

#[test]
fn test_capture_worker_past_deadline_is_detached() {
    let closed = Arc::new(AtomicBool::new(false));
    let hw = StubbornHardware {
        closed: Arc::clone(&closed),
    };
    let mut controller = PipelineController::new(PipelineTuning {
        capture_deadline: 50 * MS,
        drain_deadline: 50 * MS,
        flush_deadline: 50 * MS,
        ..tuning()
    });
    controller.start(Box::new(hw), Collaborators::default()).unwrap();
    thread::sleep(20 * MS);

    let started = Instant::now();
    controller.stop();
    let took = started.elapsed();

    assert!(took < Duration::from_millis(1500), "stop took {took:?}");
    assert!(!controller.is_running());
    // The detached worker still owns the hardware; it closes it once its poll returns.
    assert!(!closed.load(Ordering::Acquire));
}

#[test]
fn test_slow_storage_does_not_stall_processing() {
    let storage = GatedStorage::default();
    let sink = RecordingSink::default();
    let hw = ScriptedHardware::frames((0..30).map(frame).collect());
    let collab = Collaborators {
        storage: Some(Box::new(storage.clone())),
        sinks: vec![Box::new(sink.clone())],
        ..Collaborators::default()
    };
    let mut controller = PipelineController::new(PipelineTuning {
        batch_size: 5,
        ..tuning()
    });
    controller.start(Box::new(hw), collab).unwrap();

    assert!(wait_for(|| sink.records().len() == 30));
    assert!(wait_for(|| storage.entered.load(Ordering::Acquire) > 0));
    assert!(storage.committed().is_empty());

    storage.release();
    let counters = controller.stop();
    assert_eq!(counters.processed, 30);
    assert_eq!(counters.stored, 30);
    assert_eq!(storage.committed(), (1..=30).collect::<Vec<_>>());
}
