// demos/marketplace/src/web/handlers/event_handlers.rs

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::errors::AppError;
use crate::state::AppState;

#[derive(Deserialize, Debug)]
pub struct EventQuery {
  /// Filter by event name, e.g. `resource_created`.
  pub name: Option<String>,
}

/// Debug view of the engine events emitted since startup.
pub async fn list_events_handler(
  app_state: web::Data<AppState>,
  query: web::Query<EventQuery>,
) -> Result<HttpResponse, AppError> {
  let events = match &query.name {
    Some(name) => app_state.recent_events.named(name),
    None => app_state.recent_events.events(),
  };
  Ok(HttpResponse::Ok().json(json!({ "count": events.len(), "events": events })))
}
