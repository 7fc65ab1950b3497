// demos/marketplace/src/web/handlers/file_handlers.rs

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use super::{parse_session_id, OptionalUser};
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Deserialize, Debug)]
pub struct StageFileQuery {
  /// Original file name; its extension is checked against the field's rule.
  pub name: String,
}

/// Stages the raw request body as an upload for `step`/`field`.
#[instrument(name = "handler::stage_file", skip(app_state, body, user), fields(size_bytes = body.len()))]
pub async fn stage_file_handler(
  app_state: web::Data<AppState>,
  path: web::Path<(String, u32, String)>,
  query: web::Query<StageFileQuery>,
  body: web::Bytes,
  user: OptionalUser,
) -> Result<HttpResponse, AppError> {
  let (raw_id, step, field) = path.into_inner();
  if query.name.trim().is_empty() {
    return Err(AppError::Validation("query parameter 'name' must not be empty".to_string()));
  }
  let session_id = parse_session_id(&raw_id)?;
  let staged = app_state
    .orchestrator
    .stage_file(&session_id, user.owner(), step, &field, &query.name, body.to_vec())
    .await?;

  Ok(HttpResponse::Created().json(json!({
    "file_id": staged.file_id,
    "original_name": staged.original_name,
    "size_bytes": staged.size_bytes,
    "content_hash": staged.content_hash,
    "step": staged.step,
    "field": staged.field,
  })))
}

#[instrument(name = "handler::discard_file", skip(app_state, user))]
pub async fn discard_file_handler(
  app_state: web::Data<AppState>,
  path: web::Path<(String, String)>,
  user: OptionalUser,
) -> Result<HttpResponse, AppError> {
  let (raw_id, file_id) = path.into_inner();
  let session_id = parse_session_id(&raw_id)?;
  app_state
    .orchestrator
    .discard_file(&session_id, user.owner(), &file_id)
    .await?;
  Ok(HttpResponse::NoContent().finish())
}
