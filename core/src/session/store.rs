// formstage/src/session/store.rs

//! The session store contract and an in-memory implementation.
//!
//! The store is the only shared state in the engine. Writes are
//! compare-and-swap on `FormSession::version`: a writer submits the row it read
//! (carrying the version it saw) and the store rejects the write if anyone else
//! wrote in between. This is the per-session mutual exclusion for
//! read-modify-write sequences such as validate, merge and persist.

use crate::session::model::{FormSession, SessionId, SessionStatus};
use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{event, Level};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("Version conflict on session {session_id}: expected {expected}, found {found}")]
  VersionConflict {
    session_id: SessionId,
    expected: u64,
    found: u64,
  },

  #[error("Session already exists: {0}")]
  AlreadyExists(SessionId),

  #[error("Session not found: {0}")]
  NotFound(SessionId),

  #[error("Session store unavailable. Source: {source}")]
  Unavailable {
    #[source]
    source: AnyhowError,
  },
}

#[async_trait]
pub trait SessionStore: Send + Sync {
  /// Inserts a new session. The stored row gets version 1.
  async fn insert(&self, session: FormSession) -> Result<FormSession, StoreError>;

  async fn load(&self, session_id: &SessionId) -> Result<Option<FormSession>, StoreError>;

  /// Replaces the stored row if its version still equals `session.version`.
  /// Returns the row as stored, with the version bumped.
  async fn compare_and_swap(&self, session: FormSession) -> Result<FormSession, StoreError>;

  /// Deletes the row if its version still equals `expected_version`.
  async fn remove(&self, session_id: &SessionId, expected_version: u64) -> Result<(), StoreError>;

  /// In-progress sessions whose `expires_at` lies before `now`, oldest first.
  async fn expired_in_progress(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FormSession>, StoreError>;

  /// Closed tombstones (completed, abandoned, expired), least recently updated first.
  async fn closed(&self, limit: usize) -> Result<Vec<FormSession>, StoreError>;
}

/// In-memory session store.
///
/// Intended for tests/dev and single-process deployments. `set_unavailable`
/// simulates an outage of the shared store.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
  sessions: RwLock<HashMap<SessionId, FormSession>>,
  unavailable: AtomicBool,
}

impl InMemorySessionStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  pub fn len(&self) -> usize {
    self.sessions.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.read().is_empty()
  }

  pub fn contains(&self, session_id: &SessionId) -> bool {
    self.sessions.read().contains_key(session_id)
  }

  /// Reads a row without going through the async contract. Test helper.
  pub fn snapshot(&self, session_id: &SessionId) -> Option<FormSession> {
    self.sessions.read().get(session_id).cloned()
  }

  fn check_available(&self) -> Result<(), StoreError> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(StoreError::Unavailable {
        source: anyhow::anyhow!("in-memory session store marked unavailable"),
      });
    }
    Ok(())
  }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
  async fn insert(&self, mut session: FormSession) -> Result<FormSession, StoreError> {
    self.check_available()?;
    let mut sessions = self.sessions.write();
    if sessions.contains_key(&session.session_id) {
      return Err(StoreError::AlreadyExists(session.session_id));
    }
    session.version = 1;
    sessions.insert(session.session_id.clone(), session.clone());
    Ok(session)
  }

  async fn load(&self, session_id: &SessionId) -> Result<Option<FormSession>, StoreError> {
    self.check_available()?;
    Ok(self.sessions.read().get(session_id).cloned())
  }

  async fn compare_and_swap(&self, mut session: FormSession) -> Result<FormSession, StoreError> {
    self.check_available()?;
    let mut sessions = self.sessions.write();
    let current = sessions
      .get_mut(&session.session_id)
      .ok_or_else(|| StoreError::NotFound(session.session_id.clone()))?;

    if current.version != session.version {
      event!(
        Level::DEBUG,
        session_id = %session.session_id,
        expected = session.version,
        found = current.version,
        "Compare-and-swap lost."
      );
      return Err(StoreError::VersionConflict {
        session_id: session.session_id,
        expected: session.version,
        found: current.version,
      });
    }

    session.version += 1;
    *current = session.clone();
    Ok(session)
  }

  async fn remove(&self, session_id: &SessionId, expected_version: u64) -> Result<(), StoreError> {
    self.check_available()?;
    let mut sessions = self.sessions.write();
    let found = sessions
      .get(session_id)
      .map(|s| s.version)
      .ok_or_else(|| StoreError::NotFound(session_id.clone()))?;
    if found != expected_version {
      return Err(StoreError::VersionConflict {
        session_id: session_id.clone(),
        expected: expected_version,
        found,
      });
    }
    sessions.remove(session_id);
    Ok(())
  }

  async fn expired_in_progress(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FormSession>, StoreError> {
    self.check_available()?;
    let mut expired: Vec<FormSession> = self
      .sessions
      .read()
      .values()
      .filter(|s| s.is_expired_at(now))
      .cloned()
      .collect();
    expired.sort_by_key(|s| s.expires_at);
    expired.truncate(limit);
    Ok(expired)
  }

  async fn closed(&self, limit: usize) -> Result<Vec<FormSession>, StoreError> {
    self.check_available()?;
    let mut closed: Vec<FormSession> = self
      .sessions
      .read()
      .values()
      .filter(|s| s.status != SessionStatus::InProgress)
      .cloned()
      .collect();
    closed.sort_by_key(|s| s.updated_at);
    closed.truncate(limit);
    Ok(closed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn session() -> FormSession {
    FormSession::new(SessionId::generate(), "listing", None, 2, Utc::now(), None)
  }

  #[tokio::test]
  async fn compare_and_swap_bumps_version_and_rejects_stale_writers() {
    let store = InMemorySessionStore::new();
    let stored = store.insert(session()).await.unwrap();
    assert_eq!(stored.version, 1);

    let mut a = stored.clone();
    a.current_step = 1;
    let a = store.compare_and_swap(a).await.unwrap();
    assert_eq!(a.version, 2);

    let mut stale = stored;
    stale.current_step = 1;
    let err = store.compare_and_swap(stale).await.unwrap_err();
    assert!(matches!(err, StoreError::VersionConflict { expected: 1, found: 2, .. }));
  }

  #[tokio::test]
  async fn remove_checks_version() {
    let store = InMemorySessionStore::new();
    let stored = store.insert(session()).await.unwrap();
    assert!(store.remove(&stored.session_id, 7).await.is_err());
    store.remove(&stored.session_id, 1).await.unwrap();
    assert!(store.is_empty());
    assert!(matches!(
      store.remove(&stored.session_id, 1).await,
      Err(StoreError::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn duplicate_insert_is_rejected() {
    let store = InMemorySessionStore::new();
    let s = session();
    store.insert(s.clone()).await.unwrap();
    assert!(matches!(store.insert(s).await, Err(StoreError::AlreadyExists(_))));
  }

  #[tokio::test]
  async fn unavailable_store_fails_every_call() {
    let store = InMemorySessionStore::new();
    store.set_unavailable(true);
    assert!(matches!(
      store.load(&SessionId::generate()).await,
      Err(StoreError::Unavailable { .. })
    ));
  }
}
