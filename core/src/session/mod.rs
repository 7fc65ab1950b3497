// formstage/src/session/mod.rs

//! Session model and the keyed store that holds in-flight sessions.

pub mod model;
pub mod store;

pub use model::{
  EntityRef, FieldValue, FinalizeClaim, FormSession, OwnerRef, Row, SessionData, SessionId, SessionStatus,
  StagedFile, StagedFileRef, StepField, StepFields,
};
pub use store::{InMemorySessionStore, SessionStore, StoreError};
