// formstage/src/config.rs

//! Engine settings and the JSON form catalog loaded at process start.

use crate::clock::{seconds, MAX_DURATION_SECS};
use crate::definition::FormTypeDefinition;
use crate::error::{FormError, FormResult};
use crate::registry::FormRegistry;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{event, Level};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Disables time-based expiration entirely. Explicit abandon still works.
  pub bypass_expiration: bool,
  /// A finalization claim older than this is treated as stale (crashed finalizer).
  pub finalize_lease_secs: u64,
  /// How long completed sessions are kept as tombstones for idempotent retries.
  pub completed_retention_secs: u64,
  pub sweep_interval_secs: u64,
  /// Upper bound on candidates handled per reap target in a single sweep.
  pub sweep_batch_size: usize,
  pub max_staged_file_bytes: u64,
  /// Guest carts untouched for this long are reaped.
  pub guest_cart_ttl_secs: u64,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      bypass_expiration: false,
      finalize_lease_secs: 120,
      completed_retention_secs: 3600,
      sweep_interval_secs: 60,
      sweep_batch_size: 500,
      max_staged_file_bytes: 10 * 1024 * 1024,
      guest_cart_ttl_secs: 24 * 3600,
    }
  }
}

fn secs(value: u64) -> Duration {
  seconds(value)
}

impl EngineConfig {
  pub fn finalize_lease(&self) -> Duration {
    secs(self.finalize_lease_secs)
  }

  pub fn completed_retention(&self) -> Duration {
    secs(self.completed_retention_secs)
  }

  pub fn guest_cart_ttl(&self) -> Duration {
    secs(self.guest_cart_ttl_secs)
  }

  /// Rejects durations the engine cannot represent and a zero lease, which would
  /// make every finalization claim stale on arrival.
  pub fn check(&self) -> FormResult<()> {
    if self.finalize_lease_secs == 0 {
      return Err(FormError::config("<engine>", "finalize_lease_secs must be greater than zero"));
    }
    for (name, value) in [
      ("finalize_lease_secs", self.finalize_lease_secs),
      ("completed_retention_secs", self.completed_retention_secs),
      ("sweep_interval_secs", self.sweep_interval_secs),
      ("guest_cart_ttl_secs", self.guest_cart_ttl_secs),
    ] {
      if value > MAX_DURATION_SECS {
        return Err(FormError::config(
          "<engine>",
          format!("{} must be at most {}, found {}", name, MAX_DURATION_SECS, value),
        ));
      }
    }
    Ok(())
  }

  pub fn sweep_interval(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
  }
}

/// The configuration document: engine settings plus every form-type definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormCatalog {
  #[serde(default)]
  pub engine: EngineConfig,
  #[serde(default)]
  pub forms: Vec<FormTypeDefinition>,
}

impl FormCatalog {
  pub fn from_json_str(raw: &str) -> FormResult<Self> {
    serde_json::from_str(raw).map_err(|e| FormError::config("<catalog>", format!("invalid catalog JSON: {}", e)))
  }

  pub fn from_path(path: impl AsRef<Path>) -> FormResult<Self> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
      .map_err(|e| FormError::config("<catalog>", format!("cannot read {}: {}", path.display(), e)))?;
    let catalog = Self::from_json_str(&raw)?;
    event!(
      Level::INFO,
      path = %path.display(),
      forms = catalog.forms.len(),
      "Form catalog loaded."
    );
    Ok(catalog)
  }

  /// Splits the catalog into engine settings and a checked registry.
  pub fn into_parts(self) -> FormResult<(EngineConfig, FormRegistry)> {
    self.engine.check()?;
    let registry = FormRegistry::from_definitions(self.forms)?;
    Ok((self.engine, registry))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::definition::{FieldKind, MergePolicy};

  const CATALOG: &str = r#"{
    "engine": { "bypass_expiration": true, "sweep_interval_secs": 5 },
    "forms": [
      {
        "form_type": "product_listing",
        "total_steps": 2,
        "ttl_secs": 3600,
        "guest_ttl_secs": 900,
        "entity_kind": "product",
        "steps": [
          {
            "step": 1,
            "label": "Details",
            "fields": [
              { "field": "name", "type": "string", "required": true, "max_len": 120 },
              { "field": "category_id", "type": "reference", "entity": "category", "required": true }
            ]
          },
          {
            "step": 2,
            "label": "Attributes",
            "fields": [
              {
                "field": "attributes",
                "type": "rows",
                "key": "attribute_id",
                "columns": [
                  { "column": "attribute_id", "type": "reference", "entity": "attribute", "required": true },
                  { "column": "value_id", "type": "reference", "entity": "attribute_value", "required": true }
                ]
              },
              { "field": "images", "type": "files", "max_files": 4, "merge": { "policy": "append_only" } }
            ]
          }
        ]
      }
    ]
  }"#;

  #[test]
  fn catalog_parses_and_registers() {
    let (engine, registry) = FormCatalog::from_json_str(CATALOG).unwrap().into_parts().unwrap();
    assert!(engine.bypass_expiration);
    assert_eq!(engine.sweep_interval_secs, 5);
    assert_eq!(engine.finalize_lease_secs, 120);

    let def = registry.definition("product_listing").unwrap();
    assert_eq!(def.total_steps, 2);
    let attributes = def.step(2).unwrap().rule("attributes").unwrap();
    assert!(matches!(attributes.kind, FieldKind::Rows { .. }));
    assert_eq!(
      attributes.merge_policy(),
      MergePolicy::UpsertByKey {
        key: "attribute_id".to_string()
      }
    );
  }

  #[test]
  fn catalog_rejects_bad_json() {
    let err = FormCatalog::from_json_str("{ nope").unwrap_err();
    assert!(matches!(err, FormError::Configuration { .. }));
  }

  #[test]
  fn engine_durations_are_range_checked() {
    assert!(EngineConfig::default().check().is_ok());
    let lease = EngineConfig {
      finalize_lease_secs: MAX_DURATION_SECS + 1,
      ..EngineConfig::default()
    };
    assert!(matches!(lease.check(), Err(FormError::Configuration { .. })));
    let guest = EngineConfig {
      guest_cart_ttl_secs: u64::MAX,
      ..EngineConfig::default()
    };
    assert!(guest.check().is_err());
    assert_eq!(secs(u64::MAX), Duration::seconds(MAX_DURATION_SECS as i64));
  }

  #[test]
  fn catalog_rejects_duplicate_form_types() {
    let mut catalog = FormCatalog::from_json_str(CATALOG).unwrap();
    let dup = catalog.forms[0].clone();
    catalog.forms.push(dup);
    assert!(catalog.into_parts().is_err());
  }
}
