// formstage/src/files/stager.rs

//! Temporary storage of uploads owned by a session, and their promotion to
//! permanent storage at finalization.

use crate::error::{FormError, FormResult};
use crate::files::blob::{BlobMetadata, BlobStore, PermanentRef};
use crate::session::{SessionId, StagedFile};
use crate::validation::{FieldError, FieldErrorCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{event, instrument, Level};
use uuid::Uuid;

/// A staged file after promotion to permanent storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotedFile {
  pub file_id: String,
  pub step: u32,
  pub field: String,
  pub original_name: String,
  pub permanent_ref: PermanentRef,
  pub size_bytes: u64,
  pub content_hash: String,
}

pub fn content_hash(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  format!("{:x}", hasher.finalize())
}

pub struct FileStager {
  blobs: Arc<dyn BlobStore>,
  max_file_bytes: u64,
}

impl FileStager {
  pub fn new(blobs: Arc<dyn BlobStore>, max_file_bytes: u64) -> Self {
    Self { blobs, max_file_bytes }
  }

  /// Writes the bytes to staging storage and returns the record to attach to the session.
  #[instrument(
    name = "FileStager::stage",
    skip(self, bytes),
    fields(size_bytes = bytes.len()),
    err(Display)
  )]
  pub async fn stage(
    &self,
    session_id: &SessionId,
    step: u32,
    field: &str,
    original_name: &str,
    bytes: Vec<u8>,
    now: DateTime<Utc>,
  ) -> FormResult<StagedFile> {
    let size_bytes = bytes.len() as u64;
    if size_bytes > self.max_file_bytes {
      return Err(FormError::ValidationFailure {
        step,
        errors: vec![FieldError::new(
          field,
          FieldErrorCode::FileTooLarge,
          format!(
            "'{}' is {} bytes, the limit is {} bytes",
            original_name, size_bytes, self.max_file_bytes
          ),
        )],
      });
    }
    if original_name.trim().is_empty() {
      return Err(FormError::ValidationFailure {
        step,
        errors: vec![FieldError::new(field, FieldErrorCode::Required, "file name must not be empty")],
      });
    }

    let metadata = BlobMetadata {
      session_id: session_id.clone(),
      step,
      field: field.to_string(),
      original_name: original_name.to_string(),
      size_bytes,
      content_hash: content_hash(&bytes),
    };
    let storage_ref = self.blobs.stage(bytes, &metadata).await?;
    event!(Level::DEBUG, %storage_ref, "Upload staged.");

    Ok(StagedFile {
      file_id: Uuid::new_v4().simple().to_string(),
      session_id: metadata.session_id,
      step,
      field: metadata.field,
      original_name: metadata.original_name,
      storage_ref,
      size_bytes,
      content_hash: metadata.content_hash,
      staged_at: now,
    })
  }

  /// Promotes every file, all-or-nothing: on the first failure the copies already
  /// promoted in this call are deleted again and the error is returned.
  #[instrument(name = "FileStager::promote_all", skip_all, fields(files = files.len()))]
  pub async fn promote_all(&self, files: &[&StagedFile]) -> FormResult<Vec<PromotedFile>> {
    let mut promoted = Vec::with_capacity(files.len());
    for file in files {
      match self.blobs.promote(&file.storage_ref).await {
        Ok(permanent_ref) => promoted.push(PromotedFile {
          file_id: file.file_id.clone(),
          step: file.step,
          field: file.field.clone(),
          original_name: file.original_name.clone(),
          permanent_ref,
          size_bytes: file.size_bytes,
          content_hash: file.content_hash.clone(),
        }),
        Err(e) => {
          event!(
            Level::ERROR,
            file_id = %file.file_id,
            error = %e,
            rolled_back = promoted.len(),
            "Promotion failed; rolling back promoted files."
          );
          self.rollback(&promoted).await;
          return Err(e.into());
        }
      }
    }
    Ok(promoted)
  }

  /// Deletes permanent copies created by a promotion that is being abandoned.
  pub async fn rollback(&self, promoted: &[PromotedFile]) {
    for file in promoted {
      if let Err(e) = self.blobs.delete_permanent(&file.permanent_ref).await {
        event!(
          Level::WARN,
          permanent_ref = %file.permanent_ref,
          error = %e,
          "Could not delete promoted copy during rollback."
        );
      }
    }
  }

  /// Deletes staged blobs, returning the records whose blob could not be deleted.
  pub async fn release(&self, files: &[StagedFile]) -> Vec<StagedFile> {
    let mut leftover = Vec::new();
    for file in files {
      if let Err(e) = self.blobs.delete(&file.storage_ref).await {
        event!(
          Level::WARN,
          file_id = %file.file_id,
          storage_ref = %file.storage_ref,
          error = %e,
          "Could not delete staged blob."
        );
        leftover.push(file.clone());
      }
    }
    leftover
  }

  pub async fn discard(&self, file: &StagedFile) -> FormResult<()> {
    self.blobs.delete(&file.storage_ref).await?;
    Ok(())
  }
}
