// formstage/src/clock.rs

//! Time source for expiry decisions. The engine never calls `Utc::now()` directly
//! so expiry paths can be driven deterministically.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::fmt;

/// Longest accepted ttl, lease or retention period: one hundred years.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 3600;

/// `secs` as a duration, saturating at `MAX_DURATION_SECS`.
pub fn seconds(secs: u64) -> Duration {
  Duration::try_seconds(secs.min(MAX_DURATION_SECS) as i64).unwrap_or(Duration::MAX)
}

pub trait Clock: Send + Sync + fmt::Debug {
  fn now(&self) -> DateTime<Utc>;
}

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
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self { now: Mutex::new(start) }
  }

  pub fn set(&self, at: DateTime<Utc>) {
    *self.now.lock() = at;
  }

  pub fn advance(&self, by: Duration) {
    let mut guard = self.now.lock();
    *guard += by;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock()
  }
}
