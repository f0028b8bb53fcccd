//! Consecutive-failure circuit breaker with a single retry-after-cooldown rule.
//!
//! Closed: calls pass. After `failure_threshold` consecutive failures: Open, calls are refused
//! without being attempted. Once `cooldown` has passed since the last failure the next call is
//! allowed as a trial: success closes the breaker, failure re-opens it for another cooldown.
//!
//! Every guarded call site checks [`CircuitBreaker::allow`] first and then records exactly one of
//! [`CircuitBreaker::record_success`] / [`CircuitBreaker::record_failure`].

use log::{info, warn};
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Externally visible breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    /// Time of the most recent failure; the cooldown runs from here.
    opened_at: Option<Instant>,
    trips: u64,
}

/// One breaker per pipeline stage. Mutated by that stage; read by the health reporter.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Critical sections only touch counters; a poisoned lock still holds consistent data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_open_at(&self, inner: &BreakerInner, now: Instant) -> bool {
        if inner.consecutive_failures < self.failure_threshold {
            return false;
        }
        match inner.opened_at {
            Some(at) => now.saturating_duration_since(at) < self.cooldown,
            None => false,
        }
    }

    /// True if a call may be attempted now. Does not change the failure count.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        let inner = self.lock();
        !self.is_open_at(&inner, now)
    }

    pub fn record_success(&self) {
        self.record_success_at(Instant::now())
    }

    /// Reset the consecutive-failure count. An open breaker is only cleared once its cooldown has passed.
    pub fn record_success_at(&self, now: Instant) {
        let mut inner = self.lock();
        if self.is_open_at(&inner, now) {
            return;
        }
        if inner.consecutive_failures >= self.failure_threshold {
            info!("{} breaker closed after successful trial", self.name);
        }
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    /// Count a failure; trips (or re-trips after a failed trial) once the threshold is reached.
    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.opened_at = Some(now);
        if inner.consecutive_failures == self.failure_threshold {
            inner.trips += 1;
            warn!(
                "{} breaker OPEN after {} consecutive failures; retry in {:?}",
                self.name, inner.consecutive_failures, self.cooldown
            );
        } else if inner.consecutive_failures > self.failure_threshold {
            inner.trips += 1;
            warn!("{} breaker trial failed; open for another {:?}", self.name, self.cooldown);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> BreakerState {
        let inner = self.lock();
        if self.is_open_at(&inner, now) {
            BreakerState::Open
        } else {
            BreakerState::Closed
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Number of Closed → Open transitions (including failed trials).
    pub fn trips(&self) -> u64 {
        self.lock().trips
    }

    /// Time left before the next trial, if open.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let now = Instant::now();
        let inner = self.lock();
        if !self.is_open_at(&inner, now) {
            return None;
        }
        inner
            .opened_at
            .map(|at| self.cooldown.saturating_sub(now.saturating_duration_since(at)))
    }
}
