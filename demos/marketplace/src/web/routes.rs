// demos/marketplace/src/web/routes.rs

use actix_web::web;

use crate::state::AppState;
use crate::web::handlers::{event_handlers, file_handlers, session_handlers};

async fn health_check_handler(app_state: web::Data<AppState>) -> actix_web::HttpResponse {
  actix_web::HttpResponse::Ok().json(serde_json::json!({
    "status": "ok",
    "forms_config": app_state.config.forms_config.display().to_string(),
    "form_types": app_state.orchestrator.registry().len(),
    "bypass_expiration": app_state.orchestrator.config().bypass_expiration,
    "entities_created": app_state.catalog.len(),
    "recent_events": app_state.recent_events.len(),
  }))
}

pub fn configure_app_routes(cfg: &mut web::ServiceConfig) {
  cfg.service(
    web::scope("/api/v1")
      .route("/health", web::get().to(health_check_handler))
      .route("/events", web::get().to(event_handlers::list_events_handler))
      .service(
        web::scope("/forms")
          .route("", web::get().to(session_handlers::list_forms_handler))
          .route(
            "/{form_type}/sessions",
            web::post().to(session_handlers::start_session_handler),
          ),
      )
      .service(
        web::scope("/sessions/{session_id}")
          .route("", web::get().to(session_handlers::get_progress_handler))
          .route("", web::delete().to(session_handlers::abandon_session_handler))
          .route(
            "/steps/{step}",
            web::post().to(session_handlers::submit_step_handler),
          )
          .route(
            "/steps/{step}/files/{field}",
            web::post().to(file_handlers::stage_file_handler),
          )
          .route(
            "/files/{file_id}",
            web::delete().to(file_handlers::discard_file_handler),
          ),
      ),
  );
}
