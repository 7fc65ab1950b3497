// src/lib.rs

//! Formstage: an async staged-submission session engine.
//!
//! Formstage lets a client submit a complex resource (e.g. a product listing
//! with attribute rows and images) across several independent requests:
//!  - Form types are declared once at startup as typed, linear step definitions.
//!  - Each step payload is validated against its step's rules, collecting every violation.
//!  - Accepted payloads merge into the session per field: scalars overwrite,
//!    repeated rows upsert by key, file references accumulate.
//!  - Uploads are staged per session and promoted to permanent storage on finalization.
//!  - The final step creates the domain entity at most once and emits `ResourceCreated`.
//!  - Expired and abandoned sessions, and other time-bounded resources such as guest
//!    carts, are cleaned up by a periodic reaper.

pub mod clock;
pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod files;
pub mod finalize;
pub mod merge;
pub mod orchestrator;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod validation;

// --- Re-exports for the Public API ---

// Definitions and configuration
pub use crate::config::{EngineConfig, FormCatalog};
pub use crate::definition::{ColumnRule, FieldKind, FieldRule, FormTypeDefinition, MergePolicy, StepDefinition};
pub use crate::registry::FormRegistry;

// The state machine and its collaborators
pub use crate::clock::{Clock, ManualClock, SystemClock, MAX_DURATION_SECS};
pub use crate::events::{EventSink, FailureContext, FanoutEventSink, FormEvent, InMemoryEventSink, LabelledRow, TracingEventSink};
pub use crate::files::{BlobStore, InMemoryBlobStore, PermanentRef, PromotedFile, StorageError, StorageRef};
pub use crate::finalize::{CreationRequest, DomainError, DomainPersistence};
pub use crate::orchestrator::{Collaborators, NextStep, Progress, SessionOrchestrator, StepOutcome};
pub use crate::session::{
  EntityRef, FieldValue, FormSession, InMemorySessionStore, OwnerRef, SessionId, SessionStatus, SessionStore,
  StagedFile, StagedFileRef, StoreError,
};
pub use crate::validation::{FieldError, FieldErrorCode, ReferenceData, StaticReferenceData};

// Cleanup
pub use crate::reaper::{
  CartStore, GuestCartReapTarget, InMemoryCartStore, ReapReport, ReapTarget, Reaper, SessionReapTarget,
};

pub use crate::error::{FormError, FormResult};
