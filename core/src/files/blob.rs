// formstage/src/files/blob.rs

//! Blob storage contract for uploaded assets, plus an in-memory backend with
//! fault injection for tests.

use crate::session::SessionId;
use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Location of a blob in temporary (staging) storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageRef(String);

impl StorageRef {
  pub fn new(location: impl Into<String>) -> Self {
    StorageRef(location.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for StorageRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Location of a blob in permanent storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermanentRef(String);

impl PermanentRef {
  pub fn new(location: impl Into<String>) -> Self {
    PermanentRef(location.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for PermanentRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
  pub session_id: SessionId,
  pub step: u32,
  pub field: String,
  pub original_name: String,
  pub size_bytes: u64,
  pub content_hash: String,
}

#[derive(Debug, Error)]
pub enum StorageError {
  #[error("Failed to stage '{name}'. Source: {source}")]
  Stage {
    name: String,
    #[source]
    source: AnyhowError,
  },

  #[error("Failed to promote {storage_ref}. Source: {source}")]
  Promote {
    storage_ref: StorageRef,
    #[source]
    source: AnyhowError,
  },

  #[error("Failed to delete {location}. Source: {source}")]
  Delete {
    location: String,
    #[source]
    source: AnyhowError,
  },

  #[error("Staged blob not found: {0}")]
  NotFound(StorageRef),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
  async fn stage(&self, bytes: Vec<u8>, metadata: &BlobMetadata) -> Result<StorageRef, StorageError>;

  /// Creates the permanent copy. The staged blob stays until `delete` is called,
  /// so a failed finalization can still be retried.
  async fn promote(&self, storage_ref: &StorageRef) -> Result<PermanentRef, StorageError>;

  /// Deletes a staged blob. Deleting a missing blob is not an error.
  async fn delete(&self, storage_ref: &StorageRef) -> Result<(), StorageError>;

  /// Deletes a permanent copy; used to roll back a promotion.
  async fn delete_permanent(&self, permanent_ref: &PermanentRef) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct Faults {
  /// Number of promotions that still succeed before every further one fails.
  promotions_before_failure: Option<usize>,
  failing_deletes: HashSet<StorageRef>,
  fail_staging: bool,
}

/// In-memory blob store.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
  staged: RwLock<HashMap<StorageRef, Vec<u8>>>,
  permanent: RwLock<HashMap<PermanentRef, Vec<u8>>>,
  faults: Mutex<Faults>,
}

impl InMemoryBlobStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn contains_staged(&self, storage_ref: &StorageRef) -> bool {
    self.staged.read().contains_key(storage_ref)
  }

  pub fn contains_permanent(&self, permanent_ref: &PermanentRef) -> bool {
    self.permanent.read().contains_key(permanent_ref)
  }

  pub fn staged_count(&self) -> usize {
    self.staged.read().len()
  }

  pub fn permanent_count(&self) -> usize {
    self.permanent.read().len()
  }

  /// Lets `n` more promotions succeed, then fails every further one.
  pub fn fail_promotions_after(&self, n: usize) {
    self.faults.lock().promotions_before_failure = Some(n);
  }

  pub fn fail_deletes_of(&self, storage_ref: StorageRef) {
    self.faults.lock().failing_deletes.insert(storage_ref);
  }

  pub fn fail_staging(&self, fail: bool) {
    self.faults.lock().fail_staging = fail;
  }

  pub fn clear_faults(&self) {
    *self.faults.lock() = Faults::default();
  }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
  async fn stage(&self, bytes: Vec<u8>, metadata: &BlobMetadata) -> Result<StorageRef, StorageError> {
    if self.faults.lock().fail_staging {
      return Err(StorageError::Stage {
        name: metadata.original_name.clone(),
        source: anyhow::anyhow!("staging disabled by fault injection"),
      });
    }
    let storage_ref = StorageRef::new(format!(
      "staged/{}/{}/{}",
      metadata.session_id,
      metadata.step,
      Uuid::new_v4().simple()
    ));
    self.staged.write().insert(storage_ref.clone(), bytes);
    Ok(storage_ref)
  }

  async fn promote(&self, storage_ref: &StorageRef) -> Result<PermanentRef, StorageError> {
    {
      let mut faults = self.faults.lock();
      if let Some(remaining) = faults.promotions_before_failure.as_mut() {
        if *remaining == 0 {
          return Err(StorageError::Promote {
            storage_ref: storage_ref.clone(),
            source: anyhow::anyhow!("promotion disabled by fault injection"),
          });
        }
        *remaining -= 1;
      }
    }
    let bytes = self
      .staged
      .read()
      .get(storage_ref)
      .cloned()
      .ok_or_else(|| StorageError::NotFound(storage_ref.clone()))?;
    let permanent_ref = PermanentRef::new(format!("permanent/{}", Uuid::new_v4().simple()));
    self.permanent.write().insert(permanent_ref.clone(), bytes);
    Ok(permanent_ref)
  }

  async fn delete(&self, storage_ref: &StorageRef) -> Result<(), StorageError> {
    if self.faults.lock().failing_deletes.contains(storage_ref) {
      return Err(StorageError::Delete {
        location: storage_ref.to_string(),
        source: anyhow::anyhow!("delete disabled by fault injection"),
      });
    }
    self.staged.write().remove(storage_ref);
    Ok(())
  }

  async fn delete_permanent(&self, permanent_ref: &PermanentRef) -> Result<(), StorageError> {
    self.permanent.write().remove(permanent_ref);
    Ok(())
  }
}
