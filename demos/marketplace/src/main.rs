// demos/marketplace/src/main.rs

mod config;
mod errors;
mod reaper_task;
mod services;
mod state;
mod web;

use crate::config::AppConfig;
use crate::services::catalog_mock::MockCatalog;
use crate::services::reference_seed::seed_reference_data;
use crate::state::AppState;

use actix_web::{web as actix_data, App, HttpServer};
use chrono::Duration;
use formstage::{
  Clock, Collaborators, FanoutEventSink, FormCatalog, GuestCartReapTarget, InMemoryBlobStore, InMemoryCartStore,
  InMemoryEventSink, InMemorySessionStore, Reaper, SessionOrchestrator, SystemClock, TracingEventSink,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;

/// Leaves a few abandoned guest carts behind, some already past their ttl.
fn seed_guest_carts(carts: &InMemoryCartStore, clock: &dyn Clock, ttl: Duration) {
  let now = clock.now();
  for (age, product) in [(ttl * 2, "prod-boots"), (ttl + Duration::hours(1), "prod-tent"), (Duration::minutes(5), "prod-mug")] {
    let cart_id = carts.create_cart(None, now - age);
    carts.add_item(cart_id, product, 1, now - age);
  }
  tracing::info!(carts = carts.len(), "Seeded demo guest carts.");
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
  tracing_subscriber::fmt()
    .with_max_level(Level::INFO)
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()) // Allow RUST_LOG override
    .with_span_events(FmtSpan::CLOSE)
    .init();

  tracing::info!("Starting marketplace demo server...");

  let app_config = match AppConfig::from_env() {
    Ok(cfg) => Arc::new(cfg),
    Err(e) => {
      tracing::error!(error = %e, "Failed to load application configuration.");
      return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()));
    }
  };

  let (engine_config, registry) = match FormCatalog::from_path(&app_config.forms_config).and_then(FormCatalog::into_parts) {
    Ok(parts) => parts,
    Err(e) => {
      tracing::error!(error = %e, path = %app_config.forms_config.display(), "Failed to load form catalog.");
      return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()));
    }
  };
  let engine_config = app_config.apply_overrides(engine_config);
  if let Err(e) = engine_config.check() {
    tracing::error!(error = %e, "Engine settings out of range after environment overrides.");
    return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()));
  }
  tracing::info!(form_types = registry.len(), "Form registry ready.");

  let clock: Arc<dyn Clock> = Arc::new(SystemClock);
  let recent_events = Arc::new(InMemoryEventSink::with_capacity(app_config.recent_events_capacity));
  let catalog = Arc::new(MockCatalog::new());
  let events = FanoutEventSink::new()
    .with(Arc::new(TracingEventSink))
    .with(recent_events.clone());

  let orchestrator = Arc::new(SessionOrchestrator::new(
    Arc::new(registry),
    engine_config.clone(),
    Collaborators {
      store: Arc::new(InMemorySessionStore::new()),
      blobs: Arc::new(InMemoryBlobStore::new()),
      reference: Arc::new(seed_reference_data()),
      persistence: catalog.clone(),
      events: Arc::new(events),
      clock: clock.clone(),
    },
  ));

  let carts = Arc::new(InMemoryCartStore::new());
  if app_config.seed_demo_carts {
    seed_guest_carts(&carts, clock.as_ref(), engine_config.guest_cart_ttl());
  }

  let reaper = Reaper::new()
    .with_target(Arc::new(orchestrator.reaper_target()))
    .with_target(Arc::new(GuestCartReapTarget::new(
      carts,
      engine_config.guest_cart_ttl(),
      engine_config.sweep_batch_size,
    )));
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let reaper_handle = reaper_task::spawn_reaper(reaper, clock, engine_config.sweep_interval(), shutdown_rx);

  let app_state = AppState {
    orchestrator,
    config: app_config.clone(),
    catalog,
    recent_events,
  };

  // Uploads arrive as raw bodies, so the payload limit follows the staging limit.
  let upload_limit = usize::try_from(engine_config.max_staged_file_bytes).unwrap_or(usize::MAX);
  let server_address = format!("{}:{}", app_config.server_host, app_config.server_port);
  tracing::info!("Attempting to bind server to {}...", server_address);

  let result = HttpServer::new(move || {
    App::new()
      .app_data(actix_data::Data::new(app_state.clone()))
      .app_data(actix_data::PayloadConfig::new(upload_limit))
      .wrap(tracing_actix_web::TracingLogger::default())
      .configure(web::configure_app_routes)
  })
  .bind(&server_address)?
  .run()
  .await;

  let _ = shutdown_tx.send(true);
  if let Err(e) = reaper_handle.await {
    tracing::warn!(error = %e, "Reaper task did not shut down cleanly.");
  }
  result
}
