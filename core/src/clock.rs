//! Wall clock used for every time-window decision.
//!
//! RULE: Nothing in the detector calls `Utc::now()` directly.
//! Stores and the assessor read time through a shared `Clock`, so
//! tests can slide the window without sleeping.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, PoisonError};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { current: Mutex::new(start) }
    }

    /// Start at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move forward by `by`. Returns the new time.
    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current += by;
        *current
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
