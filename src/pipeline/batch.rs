//! Transactional batch writes to the storage collaborator, guarded by the storage breaker.

use anyhow::{Result, anyhow};
use log::{debug, error, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::db_ops::Storage;
use crate::pipeline::breaker::CircuitBreaker;
use crate::pipeline::error_handler::LogSampler;
use crate::pipeline::health::{Counters, HealthAccounting};
use crate::types::ProcessedRecord;
use crate::utils::config::BatchConsts;

type StorageSlot = Option<Box<dyn Storage>>;

/// Sole owner of the storage handle. Shared by flush tasks via `Arc`; writes are serialized.
pub struct BatchLogger {
    storage: Mutex<StorageSlot>,
    /// Longest a flush or close waits for a storage call already in progress.
    lock_wait: Duration,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthAccounting>,
    error_log: LogSampler,
    skip_log: LogSampler,
    attempts: AtomicU64,
}

/// Insert the whole batch inside one transaction. Any error leaves the transaction open for the
/// caller to roll back.
fn write_batch(storage: &mut dyn Storage, batch: &[ProcessedRecord]) -> Result<()> {
    storage.begin_transaction()?;
    for record in batch {
        storage.insert(record)?;
    }
    storage.commit()
}

impl BatchLogger {
    /// `storage: None` runs without durability; every batch is counted as not logged.
    pub fn new(
        storage: Option<Box<dyn Storage>>,
        breaker: Arc<CircuitBreaker>,
        health: Arc<HealthAccounting>,
    ) -> Self {
        Self {
            storage: Mutex::new(storage),
            lock_wait: BatchConsts::LOCK_WAIT,
            breaker,
            health,
            error_log: LogSampler::for_errors(),
            skip_log: LogSampler::for_drops(),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Take the storage lock, giving up after `wait`. A poisoned lock is recovered.
    fn lock_within(&self, wait: Duration) -> Option<MutexGuard<'_, StorageSlot>> {
        let until = Instant::now() + wait;
        loop {
            match self.storage.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(e)) => return Some(e.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    let now = Instant::now();
                    if now >= until {
                        return None;
                    }
                    thread::sleep(Duration::from_millis(1).min(until - now));
                }
            }
        }
    }

    /// Write `batch` all-or-nothing. Returns the number of committed records (0 when the breaker
    /// is open, there is no storage, or the write failed and was rolled back).
    pub fn flush(&self, batch: Vec<ProcessedRecord>) -> usize {
        let n = batch.len();
        if n == 0 {
            return 0;
        }
        let counters = &self.health.counters;
        let Some(mut guard) = self.lock_within(self.lock_wait) else {
            // A previous write still holds storage.
            self.breaker.record_failure();
            Counters::bump(&counters.storage_failures);
            Counters::add(&counters.not_logged, n as u64);
            self.health.record_error(Instant::now());
            if self.error_log.sample().is_some() {
                error!("storage busy for over {:?}; {n} records not logged", self.lock_wait);
            }
            return 0;
        };
        let Some(storage) = guard.as_mut() else {
            Counters::add(&counters.not_logged, n as u64);
            return 0;
        };

        let now = Instant::now();
        if !self.breaker.allow_at(now) {
            let total = Counters::add(&counters.not_logged, n as u64);
            if self.skip_log.sample().is_some() {
                warn!(
                    "storage suspended ({:?} until retry); {total} records not logged so far",
                    self.breaker.remaining_cooldown().unwrap_or_default()
                );
            }
            return 0;
        }

        self.attempts.fetch_add(1, Ordering::Relaxed);
        let result = catch_unwind(AssertUnwindSafe(|| write_batch(&mut **storage, &batch)))
            .unwrap_or_else(|_| Err(anyhow!("storage panicked during flush")));
        match result {
            Ok(()) => {
                self.breaker.record_success();
                Counters::add(&counters.stored, n as u64);
                debug!("flushed {n} records");
                n
            }
            Err(e) => {
                let rollback = catch_unwind(AssertUnwindSafe(|| storage.rollback()))
                    .unwrap_or_else(|_| Err(anyhow!("storage panicked during rollback")));
                if let Err(rb) = rollback {
                    warn!("rollback after failed flush also failed: {rb:#}");
                }
                self.breaker.record_failure();
                let failures = Counters::bump(&counters.storage_failures);
                Counters::add(&counters.not_logged, n as u64);
                self.health.record_error(Instant::now());
                if self.error_log.sample().is_some() {
                    error!("storage flush of {n} records failed (failure #{failures}): {e:#}");
                }
                0
            }
        }
    }

    /// Flushes that actually reached storage (skipped ones excluded).
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Release the storage handle. Later flushes count as not logged.
    pub fn close(&self) -> Result<()> {
        self.close_within(self.lock_wait).map(|_| ())
    }

    /// Like [`close`](Self::close) but waits at most `wait` for a storage call in progress.
    /// Returns `Ok(false)` when the handle was left with the call that still holds it.
    pub fn close_within(&self, wait: Duration) -> Result<bool> {
        let Some(mut guard) = self.lock_within(wait) else {
            error!("HARD STOP: storage still busy after {wait:?}; handle left with the stuck flush");
            return Ok(false);
        };
        match guard.take() {
            Some(mut s) => s.close().map(|()| true),
            None => Ok(true),
        }
    }
}
