// tests/common/mod.rs
#![allow(dead_code)] // Allow unused code in this common test module

use async_trait::async_trait;
use formstage::{
  Clock, ColumnRule, Collaborators, CreationRequest, DomainError, DomainPersistence, EngineConfig, EntityRef,
  FieldError, FieldErrorCode, FieldKind, FieldRule, FormRegistry, FormTypeDefinition, InMemoryBlobStore,
  FormSession, InMemoryEventSink, InMemorySessionStore, ManualClock, OwnerRef, Reaper, ReferenceData, SessionId,
  SessionOrchestrator, SessionStore, StagedFile, StaticReferenceData, StepDefinition, StepOutcome, StoreError,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Barrier, Notify};
use tracing::Level;

pub const LISTING: &str = "product_listing";

// --- Form definition used across tests ---

pub fn product_listing() -> FormTypeDefinition {
  let mut definition = FormTypeDefinition::new(
    LISTING,
    3600,
    vec![
      StepDefinition::new(1, "Details")
        .describe("Name, price and category")
        .field(
          FieldRule::new(
            "name",
            FieldKind::String {
              min_len: Some(3),
              max_len: Some(80),
            },
          )
          .required(),
        )
        .field(FieldRule::new("description", FieldKind::string()))
        .field(
          FieldRule::new(
            "price",
            FieldKind::Decimal {
              min: Some(0.0),
              max: None,
            },
          )
          .required(),
        )
        .field(FieldRule::new("category_id", FieldKind::reference("category")).required()),
      StepDefinition::new(2, "Attributes").field(
        FieldRule::new(
          "attributes",
          FieldKind::Rows {
            key: "attribute_id".into(),
            columns: vec![
              ColumnRule::new("attribute_id", FieldKind::reference("attribute")).required(),
              ColumnRule::new(
                "value_id",
                FieldKind::Integer {
                  min: Some(1),
                  max: None,
                },
              )
              .required(),
            ],
            min_rows: Some(1),
            max_rows: None,
          },
        )
        .required(),
      ),
      StepDefinition::new(3, "Images").field(
        FieldRule::new(
          "images",
          FieldKind::Files {
            min_files: Some(1),
            max_files: Some(5),
            max_size_bytes: Some(1024 * 1024),
            allowed_extensions: vec!["png".into(), "jpg".into(), "jpeg".into()],
          },
        )
        .required(),
      ),
    ],
  )
  .with_guest_ttl(600);
  definition.entity_kind = Some("product".into());
  definition
}

pub fn reference_data() -> StaticReferenceData {
  StaticReferenceData::new()
    .with("category", 1, "Footwear")
    .with("category", 2, "Outdoor")
    .with("attribute", 5, "Color")
    .with("attribute", 6, "Size")
}

pub fn details_payload() -> Value {
  json!({ "name": "Trail Runner", "price": "89.90", "category_id": 1 })
}

pub fn attributes_payload() -> Value {
  json!({ "attributes": [
    { "attribute_id": 5, "value_id": 1 },
    { "attribute_id": 6, "value_id": 42 }
  ]})
}

pub fn images_payload(files: &[&StagedFile]) -> Value {
  json!({ "images": files.iter().map(|f| f.file_id.clone()).collect::<Vec<_>>() })
}

pub fn seller() -> OwnerRef {
  OwnerRef::new("seller-1")
}

// --- Collaborator doubles ---

/// Pauses the next call that passes through it until released.
#[derive(Default)]
pub struct Hold {
  armed: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl Hold {
  /// Arms the hold. The first notify fires when a call is parked; notifying the
  /// second lets it continue.
  pub fn arm(&self) -> (Arc<Notify>, Arc<Notify>) {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    *self.armed.lock() = Some((entered.clone(), release.clone()));
    (entered, release)
  }

  pub async fn pass(&self) {
    let armed = self.armed.lock().take();
    if let Some((entered, release)) = armed {
      entered.notify_one();
      release.notified().await;
    }
  }
}

/// Domain persistence double: records requests, can be told to reject or fail.
/// Idempotent on the session id, like a real implementation must be.
#[derive(Default)]
pub struct MockPersistence {
  pub created: Mutex<Vec<CreationRequest>>,
  pub hold: Hold,
  reject_reason: Mutex<Option<String>>,
  unavailable: AtomicBool,
  calls: AtomicUsize,
}

impl MockPersistence {
  pub fn reject_with(&self, reason: &str) {
    *self.reject_reason.lock() = Some(reason.to_string());
  }

  pub fn accept(&self) {
    *self.reject_reason.lock() = None;
    self.unavailable.store(false, Ordering::SeqCst);
  }

  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn created_count(&self) -> usize {
    self.created.lock().len()
  }
}

#[async_trait]
impl DomainPersistence for MockPersistence {
  async fn create_entity(&self, request: &CreationRequest) -> Result<EntityRef, DomainError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.hold.pass().await;
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(DomainError::Unavailable {
        source: anyhow::anyhow!("catalog database offline"),
      });
    }
    if let Some(reason) = self.reject_reason.lock().clone() {
      return Err(DomainError::Rejected {
        reason,
        errors: vec![FieldError::new("name", FieldErrorCode::Rejected, "a product with this name exists")],
      });
    }
    let mut created = self.created.lock();
    if let Some(existing) = created.iter().position(|r| r.session_id == request.session_id) {
      return Ok(EntityRef::new("product", format!("prod-{}", existing + 1)));
    }
    created.push(request.clone());
    Ok(EntityRef::new("product", format!("prod-{}", created.len())))
  }
}

/// Reference data that, once armed, makes every lookup wait until two lookups are
/// in flight. Forces two submissions to read the same session version.
pub struct BarrierReference {
  inner: StaticReferenceData,
  barrier: Barrier,
  armed: AtomicBool,
}

impl BarrierReference {
  pub fn new(inner: StaticReferenceData) -> Self {
    Self {
      inner,
      barrier: Barrier::new(2),
      armed: AtomicBool::new(false),
    }
  }

  pub fn arm(&self) {
    self.armed.store(true, Ordering::SeqCst);
  }
}

#[async_trait]
impl ReferenceData for BarrierReference {
  async fn exists(&self, entity: &str, id: &str) -> anyhow::Result<bool> {
    if self.armed.load(Ordering::SeqCst) {
      self.barrier.wait().await;
    }
    self.inner.exists(entity, id).await
  }

  async fn label(&self, entity: &str, id: &str) -> anyhow::Result<Option<String>> {
    self.inner.label(entity, id).await
  }
}

/// Reference data whose label lookups can be paused once.
pub struct HoldingReference {
  inner: StaticReferenceData,
  pub hold: Hold,
}

impl HoldingReference {
  pub fn new(inner: StaticReferenceData) -> Self {
    Self {
      inner,
      hold: Hold::default(),
    }
  }
}

#[async_trait]
impl ReferenceData for HoldingReference {
  async fn exists(&self, entity: &str, id: &str) -> anyhow::Result<bool> {
    self.inner.exists(entity, id).await
  }

  async fn label(&self, entity: &str, id: &str) -> anyhow::Result<Option<String>> {
    self.hold.pass().await;
    self.inner.label(entity, id).await
  }
}

/// Session store that can pause a sweep right after it listed expired sessions.
pub struct PausingStore {
  inner: Arc<InMemorySessionStore>,
  pub after_listing: Hold,
}

impl PausingStore {
  pub fn new(inner: Arc<InMemorySessionStore>) -> Self {
    Self {
      inner,
      after_listing: Hold::default(),
    }
  }
}

#[async_trait]
impl SessionStore for PausingStore {
  async fn insert(&self, session: FormSession) -> Result<FormSession, StoreError> {
    self.inner.insert(session).await
  }

  async fn load(&self, session_id: &SessionId) -> Result<Option<FormSession>, StoreError> {
    self.inner.load(session_id).await
  }

  async fn compare_and_swap(&self, session: FormSession) -> Result<FormSession, StoreError> {
    self.inner.compare_and_swap(session).await
  }

  async fn remove(&self, session_id: &SessionId, expected_version: u64) -> Result<(), StoreError> {
    self.inner.remove(session_id, expected_version).await
  }

  async fn expired_in_progress(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FormSession>, StoreError> {
    let rows = self.inner.expired_in_progress(now, limit).await?;
    self.after_listing.pass().await;
    Ok(rows)
  }

  async fn closed(&self, limit: usize) -> Result<Vec<FormSession>, StoreError> {
    self.inner.closed(limit).await
  }
}

/// Reference data whose backend is down.
pub struct FailingReference;

#[async_trait]
impl ReferenceData for FailingReference {
  async fn exists(&self, _entity: &str, _id: &str) -> anyhow::Result<bool> {
    anyhow::bail!("reference service timed out")
  }

  async fn label(&self, _entity: &str, _id: &str) -> anyhow::Result<Option<String>> {
    anyhow::bail!("reference service timed out")
  }
}

// --- Harness ---

pub struct Harness {
  pub orchestrator: Arc<SessionOrchestrator>,
  pub store: Arc<InMemorySessionStore>,
  pub blobs: Arc<InMemoryBlobStore>,
  pub persistence: Arc<MockPersistence>,
  pub events: Arc<InMemoryEventSink>,
  pub clock: Arc<ManualClock>,
}

impl Harness {
  pub fn new() -> Self {
    Self::with_config(EngineConfig::default())
  }

  pub fn with_config(config: EngineConfig) -> Self {
    Self::build(config, Arc::new(reference_data()))
  }

  pub fn build(config: EngineConfig, reference: Arc<dyn ReferenceData>) -> Self {
    setup_tracing();
    let registry = FormRegistry::from_definitions(vec![product_listing()]).expect("listing definition is valid");
    let store = Arc::new(InMemorySessionStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());
    let persistence = Arc::new(MockPersistence::default());
    let events = Arc::new(InMemoryEventSink::new());
    let clock = Arc::new(ManualClock::default());

    let orchestrator = SessionOrchestrator::new(
      Arc::new(registry),
      config,
      Collaborators {
        store: store.clone(),
        blobs: blobs.clone(),
        reference,
        persistence: persistence.clone(),
        events: events.clone(),
        clock: clock.clone(),
      },
    );
    Self {
      orchestrator: Arc::new(orchestrator),
      store,
      blobs,
      persistence,
      events,
      clock,
    }
  }

  pub fn reaper(&self) -> Reaper {
    Reaper::new().with_target(Arc::new(self.orchestrator.reaper_target()))
  }

  pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
    self.clock.now()
  }

  pub async fn start(&self, owner: Option<OwnerRef>) -> SessionId {
    self
      .orchestrator
      .start(LISTING, owner)
      .await
      .expect("session starts")
      .session_id
  }

  pub async fn stage_image(&self, session_id: &SessionId, owner: Option<&OwnerRef>, name: &str) -> StagedFile {
    self
      .orchestrator
      .stage_file(session_id, owner, 3, "images", name, name.as_bytes().to_vec())
      .await
      .expect("image stages")
  }

  /// Starts a session and submits steps 1 and 2.
  pub async fn session_at_final_step(&self, owner: Option<OwnerRef>) -> SessionId {
    let session_id = self.start(owner.clone()).await;
    self
      .orchestrator
      .submit_step(&session_id, owner.as_ref(), 1, details_payload())
      .await
      .expect("details accepted");
    self
      .orchestrator
      .submit_step(&session_id, owner.as_ref(), 2, attributes_payload())
      .await
      .expect("attributes accepted");
    session_id
  }

  pub async fn submit(&self, session_id: &SessionId, owner: Option<&OwnerRef>, step: u32, payload: Value) -> formstage::FormResult<StepOutcome> {
    self.orchestrator.submit_step(session_id, owner, step, payload).await
  }
}

// --- Helper for Tracing Setup ---
static TRACING_INIT: Lazy<()> = Lazy::new(|| {
  tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_test_writer()
    .try_init()
    .ok();
});

pub fn setup_tracing() {
  Lazy::force(&TRACING_INIT);
}
