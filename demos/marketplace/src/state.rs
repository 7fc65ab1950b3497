// demos/marketplace/src/state.rs
use crate::config::AppConfig;
use crate::services::catalog_mock::MockCatalog;
use formstage::{InMemoryEventSink, SessionOrchestrator};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
  pub orchestrator: Arc<SessionOrchestrator>,
  pub config: Arc<AppConfig>,
  pub catalog: Arc<MockCatalog>,
  /// Recent engine events, served by the debug endpoint.
  pub recent_events: Arc<InMemoryEventSink>,
}
