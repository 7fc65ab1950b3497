// formstage/src/finalize.rs

//! Turns a claimed session's merged data into a persisted domain entity.
//!
//! The sequence is compensating rather than transactional:
//! promote staged files, resolve labels, ask the domain layer to create the
//! entity, then commit the session as completed. A failure before the commit
//! deletes the permanent copies made in this attempt and leaves the staged
//! files alone, so the final step can be resubmitted without re-uploading.
//!
//! The finalization claim is a lease. It is refreshed with a version-checked
//! write right before the domain layer is called, so a finalizer whose lease was
//! taken over backs off without creating anything. A domain call that outlives
//! the lease can still overlap a retry; `DomainPersistence` implementations must
//! therefore treat `CreationRequest::session_id` as an idempotency key.

use crate::clock::Clock;
use crate::definition::{ColumnRule, FieldKind, FormTypeDefinition};
use crate::error::{FormError, FormResult};
use crate::events::{EventSink, FailureContext, FormEvent, LabelledRow};
use crate::files::{FileStager, PromotedFile};
use crate::merge::{referenced_file_ids, DataMerger, FlattenedData};
use crate::session::{
  EntityRef, FieldValue, FinalizeClaim, FormSession, OwnerRef, SessionData, SessionId, SessionStatus, SessionStore, StagedFile,
};
use crate::validation::{id_key, FieldError, FieldErrorCode, ReferenceData};
use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, instrument, Level};

/// What the domain persistence layer receives to create the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationRequest {
  pub form_type: String,
  pub entity_kind: Option<String>,
  pub session_id: SessionId,
  pub owner: Option<OwnerRef>,
  /// Scalar fields across all steps.
  pub fields: BTreeMap<String, Value>,
  /// Labels of scalar reference fields.
  pub labels: BTreeMap<String, String>,
  pub rows: BTreeMap<String, Vec<LabelledRow>>,
  pub files: Vec<PromotedFile>,
}

#[derive(Debug, Error)]
pub enum DomainError {
  /// Business-rule or uniqueness rejection. The client can correct and resubmit.
  #[error("Rejected by the domain layer: {reason}")]
  Rejected { reason: String, errors: Vec<FieldError> },

  #[error("Domain persistence unavailable. Source: {source}")]
  Unavailable {
    #[source]
    source: AnyhowError,
  },
}

#[async_trait]
pub trait DomainPersistence: Send + Sync {
  /// Creates the entity described by `request`.
  ///
  /// Must be idempotent on `request.session_id`: a second call for a session whose
  /// entity already exists returns the existing reference instead of creating
  /// another entity.
  async fn create_entity(&self, request: &CreationRequest) -> Result<EntityRef, DomainError>;
}

pub struct Finalizer {
  store: Arc<dyn SessionStore>,
  stager: Arc<FileStager>,
  persistence: Arc<dyn DomainPersistence>,
  reference: Arc<dyn ReferenceData>,
  events: Arc<dyn EventSink>,
  clock: Arc<dyn Clock>,
}

impl Finalizer {
  pub fn new(
    store: Arc<dyn SessionStore>,
    stager: Arc<FileStager>,
    persistence: Arc<dyn DomainPersistence>,
    reference: Arc<dyn ReferenceData>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      store,
      stager,
      persistence,
      reference,
      events,
      clock,
    }
  }

  /// Finalizes `claimed`, a session row carrying this caller's finalization claim.
  /// `merged` is the session data including the final step's payload.
  ///
  /// On success the completed tombstone is returned. On failure the session data is
  /// left as it was and the claim is released.
  #[instrument(
    name = "Finalizer::finalize",
    skip_all,
    fields(session_id = %claimed.session_id, form_type = %definition.form_type),
    err(Display)
  )]
  pub async fn finalize(
    &self,
    definition: &FormTypeDefinition,
    claimed: FormSession,
    merged: &SessionData,
    raw_payload: &Value,
    now: DateTime<Utc>,
  ) -> FormResult<FormSession> {
    let mut claimed = claimed;
    let result = self.run(definition, &mut claimed, merged, raw_payload, now).await;
    if result.is_err() {
      self.release_claim(claimed).await;
    }
    result
  }

  async fn run(
    &self,
    definition: &FormTypeDefinition,
    claimed: &mut FormSession,
    merged: &SessionData,
    raw_payload: &Value,
    now: DateTime<Utc>,
  ) -> FormResult<FormSession> {
    let flat = DataMerger::flatten(merged);

    let to_promote: Vec<&StagedFile> = referenced_file_ids(&flat)
      .into_iter()
      .filter_map(|id| {
        let file = claimed.staged_file(id);
        if file.is_none() {
          event!(Level::WARN, file_id = %id, "Referenced file has no staged record; skipping.");
        }
        file
      })
      .collect();
    let promoted = self.stager.promote_all(&to_promote).await?;
    event!(Level::DEBUG, promoted = promoted.len(), "Staged files promoted.");

    let request = match self.build_request(definition, claimed, &flat, promoted).await {
      Ok(request) => request,
      Err((err, promoted)) => {
        self.stager.rollback(&promoted).await;
        return Err(err);
      }
    };

    match self.refresh_claim(claimed).await {
      Ok(refreshed) => *claimed = refreshed,
      Err(e) => {
        self.stager.rollback(&request.files).await;
        return Err(e);
      }
    }

    let entity_ref = match self.persistence.create_entity(&request).await {
      Ok(entity_ref) => entity_ref,
      Err(DomainError::Rejected { reason, errors }) => {
        self.stager.rollback(&request.files).await;
        let errors = if errors.is_empty() {
          vec![FieldError::new("", FieldErrorCode::Rejected, reason.clone())]
        } else {
          errors
        };
        event!(Level::WARN, %reason, "Domain layer rejected the submission.");
        self.events.emit(FormEvent::ValidationFailed {
          form_type: definition.form_type.clone(),
          session_id: claimed.session_id.clone(),
          step: definition.total_steps,
          context: FailureContext::Finalization,
          errors: errors.clone(),
          raw_payload: raw_payload.clone(),
        });
        return Err(FormError::FinalizationError {
          session_id: claimed.session_id.clone(),
          reason,
          errors,
        });
      }
      Err(DomainError::Unavailable { source }) => {
        self.stager.rollback(&request.files).await;
        event!(Level::ERROR, error = %source, "Domain persistence unavailable.");
        return Err(FormError::unavailable("domain_persistence", source));
      }
    };

    let leftover = self.stager.release(&claimed.staged_files).await;
    let mut completed = claimed.clone();
    completed.current_step = definition.total_steps;
    completed.entity_ref = Some(entity_ref.clone());
    completed.close(SessionStatus::Completed, now, leftover);
    let completed = match self.store.compare_and_swap(completed).await {
      Ok(stored) => stored,
      Err(e) => {
        if let Some(current) = self.completed_elsewhere(&claimed.session_id, &entity_ref).await {
          event!(
            Level::WARN,
            %entity_ref,
            "Session was completed by an overlapping finalization of the same entity."
          );
          return Ok(current);
        }
        // The entity exists but the session could not be marked completed.
        event!(
          Level::ERROR,
          %entity_ref,
          error = %e,
          "Entity created but completing the session failed."
        );
        return Err(e.into());
      }
    };

    event!(Level::INFO, %entity_ref, "Session finalized.");
    self.events.emit(FormEvent::ResourceCreated {
      entity_ref,
      form_type: request.form_type,
      session_id: request.session_id,
      owner: request.owner,
      fields: request.fields,
      labels: request.labels,
      rows: request.rows,
      files: request.files,
    });
    Ok(completed)
  }

  /// Splits the flattened data by shape and resolves display labels for reference
  /// values. On failure the promoted files are handed back for rollback.
  async fn build_request(
    &self,
    definition: &FormTypeDefinition,
    session: &FormSession,
    flat: &FlattenedData,
    files: Vec<PromotedFile>,
  ) -> Result<CreationRequest, (FormError, Vec<PromotedFile>)> {
    let mut fields = BTreeMap::new();
    let mut labels = BTreeMap::new();
    let mut rows = BTreeMap::new();

    for (name, value) in flat {
      let kind = definition.rule_for_field(name).map(|r| &r.kind);
      match value {
        FieldValue::Scalar(v) => {
          if let Some(FieldKind::Reference { entity }) = kind {
            match self.label(entity, v).await {
              Ok(Some(label)) => {
                labels.insert(name.clone(), label);
              }
              Ok(None) => {}
              Err(e) => return Err((e, files)),
            }
          }
          fields.insert(name.clone(), v.clone());
        }
        FieldValue::Rows(values) => {
          let columns: &[ColumnRule] = match kind {
            Some(FieldKind::Rows { columns, .. }) => columns.as_slice(),
            _ => &[],
          };
          let mut labelled = Vec::with_capacity(values.len());
          for row in values {
            let mut row_labels = BTreeMap::new();
            for column in columns {
              let (FieldKind::Reference { entity }, Some(v)) = (&column.kind, row.get(&column.column)) else {
                continue;
              };
              match self.label(entity, v).await {
                Ok(Some(label)) => {
                  row_labels.insert(column.column.clone(), label);
                }
                Ok(None) => {}
                Err(e) => return Err((e, files)),
              }
            }
            labelled.push(LabelledRow {
              values: row.clone(),
              labels: row_labels,
            });
          }
          rows.insert(name.clone(), labelled);
        }
        // Carried as promoted files.
        FieldValue::Files(_) => {}
      }
    }

    Ok(CreationRequest {
      form_type: definition.form_type.clone(),
      entity_kind: definition.entity_kind.clone(),
      session_id: session.session_id.clone(),
      owner: session.owner.clone(),
      fields,
      labels,
      rows,
      files,
    })
  }

  /// Re-stamps this caller's claim. Fails with `Conflict` when the row changed
  /// since the claim was written, i.e. the lease lapsed and was taken over.
  async fn refresh_claim(&self, claimed: &FormSession) -> FormResult<FormSession> {
    let Some(claim) = claimed.finalizing.as_ref() else {
      return Err(FormError::Conflict {
        session_id: claimed.session_id.clone(),
        message: "finalization claim missing".to_string(),
      });
    };
    let mut refreshed = claimed.clone();
    refreshed.finalizing = Some(FinalizeClaim {
      token: claim.token.clone(),
      claimed_at: self.clock.now(),
    });
    self.store.compare_and_swap(refreshed).await.map_err(|e| {
      event!(Level::WARN, error = %e, "Finalization claim was taken over; backing off.");
      FormError::from(e)
    })
  }

  async fn release_claim(&self, mut claimed: FormSession) {
    claimed.finalizing = None;
    if let Err(e) = self.store.compare_and_swap(claimed).await {
      event!(
        Level::WARN,
        error = %e,
        "Could not release finalization claim; it lapses after the lease."
      );
    }
  }

  /// The stored row, if another finalization already completed it with `entity_ref`.
  async fn completed_elsewhere(&self, session_id: &SessionId, entity_ref: &EntityRef) -> Option<FormSession> {
    let current = self.store.load(session_id).await.ok()??;
    (current.status == SessionStatus::Completed && current.entity_ref.as_ref() == Some(entity_ref)).then_some(current)
  }

  async fn label(&self, entity: &str, value: &Value) -> FormResult<Option<String>> {
    let Some(id) = id_key(value) else {
      return Ok(None);
    };
    self
      .reference
      .label(entity, &id)
      .await
      .map_err(|e| FormError::unavailable("reference_data", e))
  }
}
