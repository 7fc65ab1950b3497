// demos/marketplace/src/config.rs

use crate::errors::{AppError, Result};
use dotenvy::dotenv;
use formstage::EngineConfig;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
  pub server_host: String,
  pub server_port: u16,
  /// Form catalog: engine settings plus form-type definitions.
  pub forms_config: PathBuf,

  // Environment overrides for the catalog's engine section.
  pub bypass_expiration: Option<bool>,
  pub sweep_interval_secs: Option<u64>,
  pub completed_retention_secs: Option<u64>,

  /// Seed a few stale guest carts so the cart reaper has work on a fresh start.
  pub seed_demo_carts: bool,
  /// How many recent events the debug endpoint keeps.
  pub recent_events_capacity: usize,
}

fn parse_opt<T: std::str::FromStr>(var_name: &str) -> Result<Option<T>>
where
  T::Err: std::fmt::Display,
{
  match env::var(var_name) {
    Ok(raw) => raw
      .trim()
      .parse::<T>()
      .map(Some)
      .map_err(|e| AppError::Config(format!("Invalid {} value '{}': {}", var_name, raw, e))),
    Err(_) => Ok(None),
  }
}

impl AppConfig {
  pub fn from_env() -> Result<Self> {
    dotenv().ok(); // Load .env file if present

    let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let server_port = parse_opt::<u16>("SERVER_PORT")?.unwrap_or(8080);
    let forms_config = env::var("FORMS_CONFIG")
      .map(PathBuf::from)
      .unwrap_or_else(|_| PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/config/forms.json")));

    let bypass_expiration = parse_opt::<bool>("FORMSTAGE_BYPASS_EXPIRATION")?;
    let sweep_interval_secs = parse_opt::<u64>("FORMSTAGE_SWEEP_INTERVAL_SECS")?;
    let completed_retention_secs = parse_opt::<u64>("FORMSTAGE_COMPLETED_RETENTION_SECS")?;
    let seed_demo_carts = parse_opt::<bool>("SEED_DEMO_CARTS")?.unwrap_or(true);
    let recent_events_capacity = parse_opt::<usize>("RECENT_EVENTS_CAPACITY")?.unwrap_or(1000);

    if sweep_interval_secs == Some(0) {
      return Err(AppError::Config(
        "FORMSTAGE_SWEEP_INTERVAL_SECS must be greater than zero".to_string(),
      ));
    }

    tracing::info!("Application configuration loaded successfully.");

    Ok(Self {
      server_host,
      server_port,
      forms_config,
      bypass_expiration,
      sweep_interval_secs,
      completed_retention_secs,
      seed_demo_carts,
      recent_events_capacity,
    })
  }

  /// Applies environment overrides on top of the catalog's engine settings.
  pub fn apply_overrides(&self, mut engine: EngineConfig) -> EngineConfig {
    if let Some(bypass) = self.bypass_expiration {
      engine.bypass_expiration = bypass;
    }
    if let Some(secs) = self.sweep_interval_secs {
      engine.sweep_interval_secs = secs;
    }
    if let Some(secs) = self.completed_retention_secs {
      engine.completed_retention_secs = secs;
    }
    if engine.bypass_expiration {
      tracing::warn!("Session expiration is bypassed; sessions started now never expire.");
    }
    engine
  }
}
