// formstage/src/error.rs
use crate::files::StorageError;
use crate::session::{EntityRef, SessionId, SessionStatus, StoreError};
use crate::validation::FieldError;
use anyhow::Error as AnyhowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormError {
  #[error("Unknown form type: {form_type}")]
  UnknownFormType { form_type: String },

  #[error("Unknown step {step} for form type '{form_type}'")]
  UnknownStep { form_type: String, step: u32 },

  #[error("Out-of-order step for session {session_id}: expected step {expected}, got {submitted}")]
  OutOfOrderStep {
    session_id: SessionId,
    expected: u32,
    submitted: u32,
  },

  #[error("Validation failed for step {step} ({} field error(s))", .errors.len())]
  ValidationFailure { step: u32, errors: Vec<FieldError> },

  #[error("Session not found: {session_id}")]
  SessionNotFound { session_id: SessionId },

  #[error("Session {session_id} has expired")]
  SessionExpired { session_id: SessionId },

  #[error("Session {session_id} is closed (status: {status})")]
  SessionClosed {
    session_id: SessionId,
    status: SessionStatus,
    /// Set when the session completed, so a retried final submission can be answered.
    entity_ref: Option<EntityRef>,
  },

  #[error("Session {session_id} belongs to another owner")]
  NotOwner { session_id: SessionId },

  #[error("Concurrent modification of session {session_id}: {message}")]
  Conflict { session_id: SessionId, message: String },

  #[error("Finalization rejected for session {session_id}: {reason}")]
  FinalizationError {
    session_id: SessionId,
    reason: String,
    errors: Vec<FieldError>,
  },

  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),

  #[error("Transient failure in {component}. Source: {source}")]
  Unavailable {
    component: &'static str,
    #[source]
    source: AnyhowError,
  },

  #[error("Configuration error for form type '{form_type}': {message}")]
  Configuration { form_type: String, message: String },

  #[error("Invalid session id: {0}")]
  InvalidSessionId(String),
}

impl FormError {
  pub(crate) fn unavailable(component: &'static str, source: impl Into<AnyhowError>) -> Self {
    FormError::Unavailable {
      component,
      source: source.into(),
    }
  }

  pub(crate) fn config(form_type: impl Into<String>, message: impl Into<String>) -> Self {
    FormError::Configuration {
      form_type: form_type.into(),
      message: message.into(),
    }
  }

  /// True when resubmitting the same request (possibly corrected) against the same
  /// session can succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      FormError::OutOfOrderStep { .. }
        | FormError::ValidationFailure { .. }
        | FormError::Conflict { .. }
        | FormError::FinalizationError { .. }
        | FormError::Storage(_)
        | FormError::Unavailable { .. }
    )
  }

  /// True when the client has to start over with a new session.
  pub fn requires_new_session(&self) -> bool {
    matches!(
      self,
      FormError::SessionExpired { .. } | FormError::SessionClosed { .. } | FormError::SessionNotFound { .. }
    )
  }

  /// Field errors carried by validation or finalization failures.
  pub fn field_errors(&self) -> &[FieldError] {
    match self {
      FormError::ValidationFailure { errors, .. } | FormError::FinalizationError { errors, .. } => errors,
      _ => &[],
    }
  }
}

impl From<StoreError> for FormError {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::VersionConflict {
        session_id,
        expected,
        found,
      } => FormError::Conflict {
        session_id,
        message: format!("expected version {}, found {}", expected, found),
      },
      StoreError::AlreadyExists(session_id) => FormError::Conflict {
        session_id,
        message: "session id already in use".to_string(),
      },
      StoreError::NotFound(session_id) => FormError::SessionNotFound { session_id },
      StoreError::Unavailable { source } => FormError::Unavailable {
        component: "session_store",
        source,
      },
    }
  }
}

pub type FormResult<T, E = FormError> = std::result::Result<T, E>;
