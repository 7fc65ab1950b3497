// demos/marketplace/src/web/handlers/session_handlers.rs

use actix_web::{web, HttpResponse};
use formstage::StepOutcome;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::{parse_session_id, OptionalUser};
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Deserialize, Debug, Default)]
pub struct StartSessionRequest {
  /// Client-proposed session id; a fresh one is issued when absent.
  #[serde(default)]
  pub session_id: Option<String>,
}

#[instrument(name = "handler::start_session", skip(app_state, body, user), fields(form_type = %form_type))]
pub async fn start_session_handler(
  app_state: web::Data<AppState>,
  form_type: web::Path<String>,
  body: Option<web::Json<StartSessionRequest>>,
  user: OptionalUser,
) -> Result<HttpResponse, AppError> {
  let orchestrator = &app_state.orchestrator;
  let requested = body.and_then(|b| b.into_inner().session_id);
  let session = match requested {
    Some(raw) => {
      orchestrator
        .start_with_id(&form_type, user.0, parse_session_id(&raw)?)
        .await?
    }
    None => orchestrator.start(&form_type, user.0).await?,
  };
  info!(session_id = %session.session_id, "Form session started.");

  let progress = orchestrator.progress(&session.session_id, session.owner.as_ref()).await?;
  Ok(HttpResponse::Created().json(progress))
}

#[instrument(name = "handler::submit_step", skip(app_state, payload, user))]
pub async fn submit_step_handler(
  app_state: web::Data<AppState>,
  path: web::Path<(String, u32)>,
  payload: web::Json<Value>,
  user: OptionalUser,
) -> Result<HttpResponse, AppError> {
  let (raw_id, step) = path.into_inner();
  let session_id = parse_session_id(&raw_id)?;
  let outcome = app_state
    .orchestrator
    .submit_step(&session_id, user.owner(), step, payload.into_inner())
    .await?;

  let response = match outcome {
    StepOutcome::Advanced { session, next_step } => HttpResponse::Ok().json(json!({
      "status": session.status,
      "session_id": session.session_id,
      "current_step": session.current_step,
      "total_steps": session.total_steps,
      "next_step": next_step,
    })),
    StepOutcome::Completed { entity_ref, session } => HttpResponse::Created().json(json!({
      "status": session.status,
      "session_id": session.session_id,
      "entity_ref": entity_ref,
    })),
  };
  Ok(response)
}

#[instrument(name = "handler::get_progress", skip(app_state, user))]
pub async fn get_progress_handler(
  app_state: web::Data<AppState>,
  session_id: web::Path<String>,
  user: OptionalUser,
) -> Result<HttpResponse, AppError> {
  let session_id = parse_session_id(&session_id)?;
  let progress = app_state.orchestrator.progress(&session_id, user.owner()).await?;
  Ok(HttpResponse::Ok().json(progress))
}

#[instrument(name = "handler::abandon_session", skip(app_state, user))]
pub async fn abandon_session_handler(
  app_state: web::Data<AppState>,
  session_id: web::Path<String>,
  user: OptionalUser,
) -> Result<HttpResponse, AppError> {
  let session_id = parse_session_id(&session_id)?;
  app_state.orchestrator.abandon(&session_id, user.owner()).await?;
  Ok(HttpResponse::NoContent().finish())
}

/// Lists the configured form types and their steps.
pub async fn list_forms_handler(app_state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
  let registry = app_state.orchestrator.registry();
  let mut form_types: Vec<&str> = registry.form_types().collect();
  form_types.sort_unstable();
  let forms: Vec<Value> = form_types
    .into_iter()
    .filter_map(|form_type| registry.definition(form_type).ok())
    .map(|def| {
      let steps: Vec<Value> = def
        .steps
        .iter()
        .map(|s| json!({"step": s.step, "label": s.label, "description": s.description}))
        .collect();
      json!({ "form_type": def.form_type, "total_steps": def.total_steps, "steps": steps })
    })
    .collect();
  Ok(HttpResponse::Ok().json(json!({ "forms": forms })))
}
