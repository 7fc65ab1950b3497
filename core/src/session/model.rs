// formstage/src/session/model.rs

//! The in-flight session row and the shapes of the data it accumulates.

use crate::definition::MergePolicy;
use crate::error::{FormError, FormResult};
use crate::files::StorageRef;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque, unguessable session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
  pub fn generate() -> Self {
    SessionId(Uuid::new_v4().simple().to_string())
  }

  /// Accepts a client-supplied id: 8 to 128 characters of `[A-Za-z0-9_-]`.
  pub fn parse(raw: impl Into<String>) -> FormResult<Self> {
    let raw = raw.into();
    let valid_len = (8..=128).contains(&raw.len());
    let valid_chars = raw
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid_len && valid_chars {
      Ok(SessionId(raw))
    } else {
      Err(FormError::InvalidSessionId(raw))
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for SessionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// The authenticated user a session belongs to. Guests have none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerRef(String);

impl OwnerRef {
  pub fn new(id: impl Into<String>) -> Self {
    OwnerRef(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for OwnerRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Reference to the domain entity a finalized session created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
  pub kind: String,
  pub id: String,
}

impl EntityRef {
  pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      id: id.into(),
    }
  }
}

impl fmt::Display for EntityRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.kind, self.id)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
  InProgress,
  Completed,
  Abandoned,
  Expired,
}

impl SessionStatus {
  pub fn is_closed(self) -> bool {
    self != SessionStatus::InProgress
  }
}

impl fmt::Display for SessionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SessionStatus::InProgress => "in_progress",
      SessionStatus::Completed => "completed",
      SessionStatus::Abandoned => "abandoned",
      SessionStatus::Expired => "expired",
    };
    f.write_str(s)
  }
}

/// One repeated-row entry, e.g. `{"attribute_id": 5, "value_id": 2}`.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFileRef {
  pub file_id: String,
  pub original_name: String,
}

/// The three payload shapes a field can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
  Scalar(Value),
  Rows(Vec<Row>),
  Files(Vec<StagedFileRef>),
}

/// An accepted field value together with the policy it merges under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepField {
  pub policy: MergePolicy,
  pub value: FieldValue,
  /// Replace directive for append-only fields.
  #[serde(default)]
  pub replace: bool,
}

pub type StepFields = BTreeMap<String, StepField>;

/// Accumulated data: step number to that step's accepted fields.
pub type SessionData = BTreeMap<u32, StepFields>;

/// An uploaded asset held pending finalization. Owned by exactly one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
  pub file_id: String,
  pub session_id: SessionId,
  pub step: u32,
  pub field: String,
  pub original_name: String,
  pub storage_ref: StorageRef,
  pub size_bytes: u64,
  pub content_hash: String,
  pub staged_at: DateTime<Utc>,
}

impl StagedFile {
  pub fn to_ref(&self) -> StagedFileRef {
    StagedFileRef {
      file_id: self.file_id.clone(),
      original_name: self.original_name.clone(),
    }
  }

  pub fn extension(&self) -> Option<String> {
    self
      .original_name
      .rsplit_once('.')
      .map(|(_, ext)| ext.to_ascii_lowercase())
      .filter(|ext| !ext.is_empty())
  }
}

/// Marks a session as being finalized. Acts as the per-session lock for the
/// final step: only the writer that installed the claim may commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeClaim {
  pub token: String,
  pub claimed_at: DateTime<Utc>,
}

impl FinalizeClaim {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      token: Uuid::new_v4().to_string(),
      claimed_at: now,
    }
  }

  pub fn is_live(&self, now: DateTime<Utc>, lease: Duration) -> bool {
    now < self.claimed_at + lease
  }
}

/// One client's in-progress staged submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSession {
  pub session_id: SessionId,
  pub form_type: String,
  pub owner: Option<OwnerRef>,
  pub current_step: u32,
  pub total_steps: u32,
  pub status: SessionStatus,
  pub data: SessionData,
  pub staged_files: Vec<StagedFile>,
  pub finalizing: Option<FinalizeClaim>,
  pub entity_ref: Option<EntityRef>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  /// `None` when expiration was bypassed at start.
  pub expires_at: Option<DateTime<Utc>>,
  /// Optimistic-concurrency token, bumped by the store on every write.
  pub version: u64,
}

impl FormSession {
  pub fn new(
    session_id: SessionId,
    form_type: impl Into<String>,
    owner: Option<OwnerRef>,
    total_steps: u32,
    now: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
  ) -> Self {
    Self {
      session_id,
      form_type: form_type.into(),
      owner,
      current_step: 0,
      total_steps,
      status: SessionStatus::InProgress,
      data: SessionData::new(),
      staged_files: Vec::new(),
      finalizing: None,
      entity_ref: None,
      created_at: now,
      updated_at: now,
      expires_at,
      version: 0,
    }
  }

  pub fn next_step(&self) -> u32 {
    self.current_step + 1
  }

  pub fn is_guest(&self) -> bool {
    self.owner.is_none()
  }

  /// In progress and past its expiry. Closed sessions never "expire" again.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.status == SessionStatus::InProgress && self.expires_at.map_or(false, |at| at < now)
  }

  pub fn has_live_claim(&self, now: DateTime<Utc>, lease: Duration) -> bool {
    self.finalizing.as_ref().map_or(false, |c| c.is_live(now, lease))
  }

  pub fn staged_file(&self, file_id: &str) -> Option<&StagedFile> {
    self.staged_files.iter().find(|f| f.file_id == file_id)
  }

  /// Rejects callers other than the owner. Guest sessions are bearer-token sessions.
  pub(crate) fn check_owner(&self, caller: Option<&OwnerRef>) -> FormResult<()> {
    match &self.owner {
      Some(owner) if caller != Some(owner) => Err(FormError::NotOwner {
        session_id: self.session_id.clone(),
      }),
      _ => Ok(()),
    }
  }

  pub(crate) fn closed_error(&self) -> FormError {
    FormError::SessionClosed {
      session_id: self.session_id.clone(),
      status: self.status,
      entity_ref: self.entity_ref.clone(),
    }
  }

  /// Turns the row into a closed tombstone. Accumulated data is dropped; staged-file
  /// records are replaced with whatever could not be released.
  pub(crate) fn close(&mut self, status: SessionStatus, now: DateTime<Utc>, leftover_files: Vec<StagedFile>) {
    self.status = status;
    self.data.clear();
    self.staged_files = leftover_files;
    self.finalizing = None;
    self.updated_at = now;
  }
}
