// formstage/src/reaper/sessions.rs

//! Reaps staged-submission sessions: in-progress sessions past their expiry, and
//! closed tombstones once they are no longer needed.

use crate::config::EngineConfig;
use crate::events::{EventSink, FormEvent};
use crate::files::FileStager;
use crate::reaper::{ReapReport, ReapTarget};
use crate::session::{FormSession, SessionStatus, SessionStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{event, instrument, Level};

pub struct SessionReapTarget {
  store: Arc<dyn SessionStore>,
  stager: Arc<FileStager>,
  events: Arc<dyn EventSink>,
  bypass_expiration: bool,
  finalize_lease: Duration,
  completed_retention: Duration,
  batch_size: usize,
}

/// What happened to a single candidate row.
enum RowOutcome {
  Removed,
  Skipped,
  Retained,
  Failed,
}

impl SessionReapTarget {
  pub fn new(
    store: Arc<dyn SessionStore>,
    stager: Arc<FileStager>,
    events: Arc<dyn EventSink>,
    config: &EngineConfig,
  ) -> Self {
    Self {
      store,
      stager,
      events,
      bypass_expiration: config.bypass_expiration,
      finalize_lease: config.finalize_lease(),
      completed_retention: config.completed_retention(),
      batch_size: config.sweep_batch_size.max(1),
    }
  }

  /// Tombstones first, so a session expired in this sweep whose blobs could not
  /// all be deleted is not retried (and double counted) within the same sweep.
  async fn sweep_tombstones(&self, now: DateTime<Utc>, report: &mut ReapReport) {
    let tombstones = match self.store.closed(self.batch_size).await {
      Ok(rows) => rows,
      Err(e) => {
        event!(Level::ERROR, error = %e, "Could not list closed sessions.");
        report.failed += 1;
        return;
      }
    };
    for session in tombstones {
      let outcome = self.purge_tombstone(session, now).await;
      tally(report, outcome);
    }
  }

  async fn purge_tombstone(&self, mut session: FormSession, now: DateTime<Utc>) -> RowOutcome {
    if session.status == SessionStatus::Completed && now - session.updated_at < self.completed_retention {
      return RowOutcome::Retained;
    }
    if !session.staged_files.is_empty() {
      let leftover = self.stager.release(&session.staged_files).await;
      if !leftover.is_empty() {
        event!(
          Level::WARN,
          session_id = %session.session_id,
          leftover = leftover.len(),
          "Tombstone still has undeletable staged files."
        );
        if leftover.len() != session.staged_files.len() {
          session.staged_files = leftover;
          if let Err(e) = self.store.compare_and_swap(session).await {
            event!(Level::WARN, error = %e, "Could not record remaining staged files.");
          }
        }
        return RowOutcome::Failed;
      }
    }
    self.remove(&session).await
  }

  async fn sweep_expired(&self, now: DateTime<Utc>, report: &mut ReapReport) {
    if self.bypass_expiration {
      return;
    }
    let expired = match self.store.expired_in_progress(now, self.batch_size).await {
      Ok(rows) => rows,
      Err(e) => {
        event!(Level::ERROR, error = %e, "Could not list expired sessions.");
        report.failed += 1;
        return;
      }
    };
    for session in expired {
      let outcome = self.reap_expired(session, now).await;
      tally(report, outcome);
    }
  }

  /// Expires the listed row before touching its blobs. A request that wrote the
  /// session after it was listed makes this write lose; its files stay intact.
  async fn reap_expired(&self, mut session: FormSession, now: DateTime<Utc>) -> RowOutcome {
    if session.has_live_claim(now, self.finalize_lease) {
      event!(
        Level::DEBUG,
        session_id = %session.session_id,
        "Skipping expired session with a finalization in progress."
      );
      return RowOutcome::Skipped;
    }

    let staged = std::mem::take(&mut session.staged_files);
    session.close(SessionStatus::Expired, now, staged);
    let tombstone = match self.store.compare_and_swap(session).await {
      Ok(stored) => stored,
      Err(e) => return self.lost_row(&e),
    };
    self.events.emit(FormEvent::SessionExpired {
      form_type: tombstone.form_type.clone(),
      session_id: tombstone.session_id.clone(),
    });

    let leftover = self.stager.release(&tombstone.staged_files).await;
    if leftover.is_empty() {
      return self.remove(&tombstone).await;
    }

    // Keep the tombstone so the remaining blobs are retried.
    event!(
      Level::WARN,
      session_id = %tombstone.session_id,
      leftover = leftover.len(),
      "Expired session still has undeletable staged files."
    );
    if leftover.len() != tombstone.staged_files.len() {
      let mut tombstone = tombstone;
      tombstone.staged_files = leftover;
      if let Err(e) = self.store.compare_and_swap(tombstone).await {
        event!(Level::WARN, error = %e, "Could not record remaining staged files.");
      }
    }
    RowOutcome::Failed
  }

  fn lost_row(&self, err: &StoreError) -> RowOutcome {
    match err {
      StoreError::VersionConflict { session_id, .. } | StoreError::NotFound(session_id) => {
        event!(
          Level::DEBUG,
          %session_id,
          "Session changed during sweep; leaving it for the next one."
        );
        RowOutcome::Skipped
      }
      other => {
        event!(Level::WARN, error = %other, "Could not write session during sweep.");
        RowOutcome::Failed
      }
    }
  }

  async fn remove(&self, session: &FormSession) -> RowOutcome {
    match self.store.remove(&session.session_id, session.version).await {
      Ok(()) => {
        event!(
          Level::INFO,
          session_id = %session.session_id,
          form_type = %session.form_type,
          status = %session.status,
          "Session reaped."
        );
        RowOutcome::Removed
      }
      Err(e) => self.lost_row(&e),
    }
  }
}

fn tally(report: &mut ReapReport, outcome: RowOutcome) {
  match outcome {
    RowOutcome::Removed => report.removed += 1,
    RowOutcome::Skipped => report.skipped += 1,
    RowOutcome::Failed => report.failed += 1,
    RowOutcome::Retained => {}
  }
}

#[async_trait]
impl ReapTarget for SessionReapTarget {
  fn name(&self) -> &str {
    "form_sessions"
  }

  #[instrument(name = "SessionReapTarget::sweep", skip(self))]
  async fn sweep(&self, now: DateTime<Utc>) -> ReapReport {
    let mut report = ReapReport::default();
    self.sweep_tombstones(now, &mut report).await;
    self.sweep_expired(now, &mut report).await;
    report
  }
}
