// demos/marketplace/src/services/catalog_mock.rs

//! Mock product catalog standing in for the marketplace's domain database.

use async_trait::async_trait;
use formstage::{CreationRequest, DomainError, DomainPersistence, EntityRef, FieldError, FieldErrorCode, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Created {
  // (entity kind, lowercased name) -> created entity
  by_name: HashMap<(String, String), EntityRef>,
  by_session: HashMap<SessionId, EntityRef>,
}

/// Creates listings and seller profiles. Names must be unique per entity kind.
/// A repeated request for the same session returns the entity created the first time.
#[derive(Debug, Default)]
pub struct MockCatalog {
  created: Mutex<Created>,
}

impl MockCatalog {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of entities created so far.
  pub fn len(&self) -> usize {
    self.created.lock().by_session.len()
  }
}

fn display_name(request: &CreationRequest) -> Option<(&'static str, String)> {
  ["name", "shop_name"].into_iter().find_map(|field| {
    let value = request.fields.get(field)?.as_str()?;
    Some((field, value.trim().to_lowercase()))
  })
}

#[async_trait]
impl DomainPersistence for MockCatalog {
  #[instrument(name = "MockCatalog::create_entity", skip_all, fields(form_type = %request.form_type, session_id = %request.session_id))]
  async fn create_entity(&self, request: &CreationRequest) -> Result<EntityRef, DomainError> {
    // Simulate a database round trip.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let kind = request.entity_kind.clone().unwrap_or_else(|| request.form_type.clone());
    let Some((field, name)) = display_name(request) else {
      return Err(DomainError::Rejected {
        reason: "entity has no name".to_string(),
        errors: Vec::new(),
      });
    };

    let mut created = self.created.lock();
    if let Some(existing) = created.by_session.get(&request.session_id) {
      info!(entity_ref = %existing, "Entity already created for this session.");
      return Ok(existing.clone());
    }
    let key = (kind.clone(), name);
    if created.by_name.contains_key(&key) {
      warn!(entity_kind = %kind, name = %key.1, "Duplicate name rejected.");
      return Err(DomainError::Rejected {
        reason: format!("a {} with this name already exists", kind),
        errors: vec![FieldError::new(field, FieldErrorCode::Rejected, "name is already taken")],
      });
    }

    let entity_ref = EntityRef::new(kind, Uuid::new_v4().to_string());
    created.by_name.insert(key, entity_ref.clone());
    created.by_session.insert(request.session_id.clone(), entity_ref.clone());
    info!(
      entity_ref = %entity_ref,
      rows = request.rows.values().map(Vec::len).sum::<usize>(),
      files = request.files.len(),
      "Entity created."
    );
    Ok(entity_ref)
  }
}
