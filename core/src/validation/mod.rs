// formstage/src/validation/mod.rs

//! Per-step payload validation.

pub mod reference;
pub mod validator;

pub use reference::{id_key, ReferenceData, StaticReferenceData};
pub use validator::{FieldError, FieldErrorCode, NormalizedPayload, StepValidator, ValidationOutcome};
