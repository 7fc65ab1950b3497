// demos/marketplace/src/reaper_task.rs

//! Runs the reaper on a fixed interval until shutdown is signalled.

use formstage::{Clock, Reaper};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub fn spawn_reaper(
  reaper: Reaper,
  clock: Arc<dyn Clock>,
  interval: Duration,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    info!(targets = ?reaper.target_names(), interval_secs = interval.as_secs(), "Reaper task started.");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let report = reaper.sweep(clock.now()).await;
          if report.failed > 0 {
            warn!(%report, "Sweep finished with failures; they are retried next tick.");
          }
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    info!("Reaper task stopped.");
  })
}
