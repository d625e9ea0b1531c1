//! Clock port.
//!
//! All time-based state-machine thresholds are expressed in wall-clock
//! durations; the monotonic reading is only used for latency measurement.
//! The simulated clock never reads system time, so resolution sweeps and
//! staleness gates are fully deterministic under test.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

pub trait ClockPort: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn monotonic_ms(&self) -> u64;
}

/// Production clock.
pub struct WallClock {
    started: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockPort for WallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Deterministic clock for tests. Only moves forward.
#[derive(Clone)]
pub struct SimClock {
    current: Arc<Mutex<DateTime<Utc>>>,
    epoch: DateTime<Utc>,
}

impl SimClock {
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
            epoch: start,
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        debug_assert!(secs >= 0, "SimClock: cannot go backward");
        let mut current = self.current.lock();
        *current += ChronoDuration::seconds(secs);
    }

    pub fn advance_to(&self, t: DateTime<Utc>) {
        let mut current = self.current.lock();
        debug_assert!(t >= *current, "SimClock: cannot go backward");
        *current = t;
    }
}

impl ClockPort for SimClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }

    fn monotonic_ms(&self) -> u64 {
        (*self.current.lock() - self.epoch).num_milliseconds().max(0) as u64
    }
}
