// formstage/src/reaper/mod.rs

//! Periodic cleanup of time-bounded resources.
//!
//! A `Reaper` runs a list of `ReapTarget`s. Each target selects its expired
//! candidates, deletes children before parents and isolates per-row failures:
//! a row that cannot be cleaned up is logged and counted, and the sweep moves on.
//! Sweeps are idempotent; a second sweep right after the first removes nothing.

pub mod carts;
pub mod sessions;

pub use carts::{CartItem, CartStore, GuestCart, GuestCartReapTarget, InMemoryCartStore};
pub use sessions::SessionReapTarget;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
  pub removed: usize,
  /// Candidates left alone this time, e.g. sessions with a live finalization claim.
  pub skipped: usize,
  pub failed: usize,
}

impl ReapReport {
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }
}

impl AddAssign for ReapReport {
  fn add_assign(&mut self, other: Self) {
    self.removed += other.removed;
    self.skipped += other.skipped;
    self.failed += other.failed;
  }
}

impl fmt::Display for ReapReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "removed={} skipped={} failed={}",
      self.removed, self.skipped, self.failed
    )
  }
}

#[async_trait]
pub trait ReapTarget: Send + Sync {
  fn name(&self) -> &str;

  /// Removes everything that expired before `now`. Never fails as a whole;
  /// problems are logged and counted in the report.
  async fn sweep(&self, now: DateTime<Utc>) -> ReapReport;
}

#[derive(Default, Clone)]
pub struct Reaper {
  targets: Vec<Arc<dyn ReapTarget>>,
}

impl Reaper {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_target(mut self, target: Arc<dyn ReapTarget>) -> Self {
    self.targets.push(target);
    self
  }

  pub fn target_names(&self) -> Vec<&str> {
    self.targets.iter().map(|t| t.name()).collect()
  }

  /// Sweeps every target in registration order and sums their reports.
  #[instrument(name = "Reaper::sweep", skip_all, fields(targets = self.targets.len()))]
  pub async fn sweep(&self, now: DateTime<Utc>) -> ReapReport {
    let mut total = ReapReport::default();
    for target in &self.targets {
      let report = target.sweep(now).await;
      if report.is_empty() {
        event!(Level::DEBUG, target = target.name(), "Nothing to reap.");
      } else {
        event!(Level::INFO, target = target.name(), %report, "Reap target swept.");
      }
      total += report;
    }
    total
  }
}
