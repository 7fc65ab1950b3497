// formstage/src/validation/reference.rs

//! Reference-data lookup used by referential rules and label resolution.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

#[async_trait]
pub trait ReferenceData: Send + Sync {
  /// Whether `id` exists among entities of kind `entity`.
  async fn exists(&self, entity: &str, id: &str) -> anyhow::Result<bool>;

  /// The display label of an entity, if it has one.
  async fn label(&self, entity: &str, id: &str) -> anyhow::Result<Option<String>>;
}

/// Renders an integer or string JSON id as the lookup key.
pub fn id_key(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
    _ => None,
  }
}

/// Fixed reference data, e.g. seeded categories and attributes.
#[derive(Debug, Default)]
pub struct StaticReferenceData {
  entries: RwLock<HashMap<(String, String), String>>,
}

impl StaticReferenceData {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(self, entity: &str, id: impl ToString, label: &str) -> Self {
    self.insert(entity, id, label);
    self
  }

  pub fn insert(&self, entity: &str, id: impl ToString, label: &str) {
    self
      .entries
      .write()
      .insert((entity.to_string(), id.to_string()), label.to_string());
  }

  pub fn remove(&self, entity: &str, id: impl ToString) {
    self.entries.write().remove(&(entity.to_string(), id.to_string()));
  }
}

#[async_trait]
impl ReferenceData for StaticReferenceData {
  async fn exists(&self, entity: &str, id: &str) -> anyhow::Result<bool> {
    Ok(self
      .entries
      .read()
      .contains_key(&(entity.to_string(), id.to_string())))
  }

  async fn label(&self, entity: &str, id: &str) -> anyhow::Result<Option<String>> {
    Ok(self
      .entries
      .read()
      .get(&(entity.to_string(), id.to_string()))
      .cloned())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn id_key_accepts_integers_and_strings_only() {
    assert_eq!(id_key(&json!(5)).as_deref(), Some("5"));
    assert_eq!(id_key(&json!("sku-1")).as_deref(), Some("sku-1"));
    assert_eq!(id_key(&json!("")), None);
    assert_eq!(id_key(&json!(1.5)), None);
    assert_eq!(id_key(&json!(true)), None);
  }
}
