//! Minimum-spacing admission gate for the capture loop.

use std::time::{Duration, Instant};

/// Admits an item only if at least `min_interval` passed since the last admitted one.
/// Rejected items are dropped by the caller, never queued. Owned by the capture thread.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    last_accepted: Option<Instant>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_accepted: None,
            min_interval,
        }
    }

    /// Limiter for a ceiling of `per_sec` items per second (0 admits everything).
    pub fn per_second(per_sec: u32) -> Self {
        if per_sec == 0 {
            Self::new(Duration::ZERO)
        } else {
            Self::new(Duration::from_secs_f64(1.0 / per_sec as f64))
        }
    }

    /// True (and records `now`) iff `now - last_accepted >= min_interval`. The first call always admits.
    /// A `now` earlier than the last admission is rejected.
    pub fn admit(&mut self, now: Instant) -> bool {
        let ok = match self.last_accepted {
            None => true,
            Some(last) => now
                .checked_duration_since(last)
                .is_some_and(|gap| gap >= self.min_interval),
        };
        if ok {
            self.last_accepted = Some(now);
        }
        ok
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn last_accepted(&self) -> Option<Instant> {
        self.last_accepted
    }
}
