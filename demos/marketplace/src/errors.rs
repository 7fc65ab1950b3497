// demos/marketplace/src/errors.rs

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use formstage::FormError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
  #[error("Validation Error: {0}")]
  Validation(String),

  #[error("Configuration Error: {0}")]
  Config(String),

  #[error("Form Session Error: {source}")]
  Form {
    #[from]
    source: FormError,
  },

  #[error("Internal Server Error: {0}")]
  Internal(String),
}

impl From<anyhow::Error> for AppError {
  fn from(err: anyhow::Error) -> Self {
    match err.downcast::<FormError>() {
      Ok(source) => AppError::Form { source },
      Err(other) => AppError::Internal(other.to_string()),
    }
  }
}

/// HTTP status for each engine outcome.
fn form_status(err: &FormError) -> StatusCode {
  match err {
    FormError::UnknownFormType { .. } | FormError::UnknownStep { .. } | FormError::SessionNotFound { .. } => {
      StatusCode::NOT_FOUND
    }
    FormError::InvalidSessionId(_) => StatusCode::BAD_REQUEST,
    FormError::ValidationFailure { .. } | FormError::FinalizationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    FormError::OutOfOrderStep { .. } | FormError::SessionClosed { .. } | FormError::Conflict { .. } => {
      StatusCode::CONFLICT
    }
    FormError::SessionExpired { .. } => StatusCode::GONE,
    FormError::NotOwner { .. } => StatusCode::FORBIDDEN,
    FormError::Unavailable { .. } | FormError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
    FormError::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

fn form_body(err: &FormError) -> serde_json::Value {
  let mut body = json!({
    "error": err.to_string(),
    "retryable": err.is_retryable(),
    "requires_new_session": err.requires_new_session(),
  });
  if !err.field_errors().is_empty() {
    body["field_errors"] = json!(err.field_errors());
  }
  match err {
    FormError::OutOfOrderStep { expected, .. } => body["expected_step"] = json!(expected),
    FormError::SessionClosed {
      status,
      entity_ref: Some(entity_ref),
      ..
    } => {
      body["status"] = json!(status);
      body["entity_ref"] = json!(entity_ref);
    }
    _ => {}
  }
  body
}

impl ResponseError for AppError {
  fn status_code(&self) -> StatusCode {
    match self {
      AppError::Validation(_) => StatusCode::BAD_REQUEST,
      AppError::Form { source } => form_status(source),
      AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  fn error_response(&self) -> HttpResponse {
    let status = self.status_code();
    if status.is_server_error() {
      tracing::error!(application_error = %self, "Responding with error");
    } else {
      tracing::info!(application_error = %self, status = status.as_u16(), "Rejecting request");
    }
    match self {
      AppError::Validation(m) => HttpResponse::build(status).json(json!({"error": m})),
      AppError::Form { source } => HttpResponse::build(status).json(form_body(source)),
      AppError::Config(m) => {
        HttpResponse::build(status).json(json!({"error": "Configuration issue", "detail": m}))
      }
      AppError::Internal(m) => {
        HttpResponse::build(status).json(json!({"error": "An internal error occurred", "detail": m}))
      }
    }
  }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
