//! Abstractions over wall-clock time so that trial bookkeeping and run
//! tagging stay deterministic under test.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

use crate::calendar::to_berlin;

// ==================== Clock Trait ====================

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current instant in Berlin local time.
    fn now_local(&self) -> DateTime<FixedOffset> {
        to_berlin(self.now_utc())
    }

    /// Current Berlin calendar date.
    fn today(&self) -> NaiveDate {
        self.now_local().date_naive()
    }
}

/// Real time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Controllable clock for tests.
///
/// Every read advances the clock by `tick`, which gives each trial a
/// distinct start and end timestamp without sleeping.
#[derive(Debug, Clone)]
pub struct MockClock {
    state: Arc<Mutex<DateTime<Utc>>>,
    tick: chrono::Duration,
}

impl MockClock {
    /// Create a frozen clock at `time`.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(time)),
            tick: chrono::Duration::zero(),
        }
    }

    /// Create a clock that moves forward by `tick` on every read.
    pub fn ticking(time: DateTime<Utc>, tick: chrono::Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(time)),
            tick,
        }
    }

    /// Jump to a new time.
    pub fn set_time(&self, time: DateTime<Utc>) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = time;
        }
    }

    /// Advance by a duration.
    pub fn advance(&self, duration: chrono::Duration) {
        if let Ok(mut guard) = self.state.lock() {
            *guard += duration;
        }
    }
}

impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        match self.state.lock() {
            Ok(mut guard) => {
                let now = *guard;
                *guard += self.tick;
                now
            }
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
