// formstage/src/orchestrator.rs

//! The session state machine.
//!
//! Every mutation is a read-modify-write of one session row guarded by the
//! store's compare-and-swap, so two concurrent submissions for the same step
//! cannot both advance it. Expiry is detected lazily here and eagerly by the
//! reaper.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::definition::{FieldKind, FormTypeDefinition};
use crate::error::{FormError, FormResult};
use crate::events::{EventSink, FailureContext, FormEvent};
use crate::files::{BlobStore, FileStager};
use crate::finalize::{DomainPersistence, Finalizer};
use crate::merge::{referenced_file_ids, DataMerger};
use crate::reaper::SessionReapTarget;
use crate::registry::FormRegistry;
use crate::session::{
  EntityRef, FinalizeClaim, FormSession, OwnerRef, SessionId, SessionStatus, SessionStore, StagedFile, StoreError,
};
use crate::validation::{FieldError, FieldErrorCode, ReferenceData, StepValidator, ValidationOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{event, instrument, Level};

/// The external collaborators the engine runs against.
#[derive(Clone)]
pub struct Collaborators {
  pub store: Arc<dyn SessionStore>,
  pub blobs: Arc<dyn BlobStore>,
  pub reference: Arc<dyn ReferenceData>,
  pub persistence: Arc<dyn DomainPersistence>,
  pub events: Arc<dyn EventSink>,
  pub clock: Arc<dyn Clock>,
}

/// Result of an accepted step submission.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
  /// The step was merged; the client continues with `next_step`.
  Advanced { session: FormSession, next_step: u32 },
  /// The final step was accepted and the entity created.
  Completed { entity_ref: EntityRef, session: FormSession },
}

impl StepOutcome {
  pub fn session(&self) -> &FormSession {
    match self {
      StepOutcome::Advanced { session, .. } | StepOutcome::Completed { session, .. } => session,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextStep {
  pub step: u32,
  pub label: String,
  pub description: String,
}

/// What a client needs to render the next page of a form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
  pub session_id: SessionId,
  pub form_type: String,
  pub status: SessionStatus,
  pub current_step: u32,
  pub total_steps: u32,
  pub next_step: Option<NextStep>,
  pub expires_at: Option<DateTime<Utc>>,
  pub entity_ref: Option<EntityRef>,
}

pub struct SessionOrchestrator {
  registry: Arc<FormRegistry>,
  config: EngineConfig,
  store: Arc<dyn SessionStore>,
  stager: Arc<FileStager>,
  validator: StepValidator,
  finalizer: Finalizer,
  events: Arc<dyn EventSink>,
  clock: Arc<dyn Clock>,
}

impl SessionOrchestrator {
  pub fn new(registry: Arc<FormRegistry>, config: EngineConfig, collaborators: Collaborators) -> Self {
    let Collaborators {
      store,
      blobs,
      reference,
      persistence,
      events,
      clock,
    } = collaborators;
    let stager = Arc::new(FileStager::new(blobs, config.max_staged_file_bytes));
    let finalizer = Finalizer::new(
      store.clone(),
      stager.clone(),
      persistence,
      reference.clone(),
      events.clone(),
      clock.clone(),
    );
    Self {
      registry,
      config,
      store,
      stager,
      validator: StepValidator::new(reference),
      finalizer,
      events,
      clock,
    }
  }

  pub fn registry(&self) -> &FormRegistry {
    &self.registry
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// The reap target that sweeps this engine's sessions.
  pub fn reaper_target(&self) -> SessionReapTarget {
    SessionReapTarget::new(self.store.clone(), self.stager.clone(), self.events.clone(), &self.config)
  }

  /// Starts a session with a server-issued id.
  pub async fn start(&self, form_type: &str, owner: Option<OwnerRef>) -> FormResult<FormSession> {
    self.start_with_id(form_type, owner, SessionId::generate()).await
  }

  /// Starts a session under a client-supplied id.
  #[instrument(
    name = "SessionOrchestrator::start",
    skip_all,
    fields(form_type = %form_type, session_id = %session_id),
    err(Display)
  )]
  pub async fn start_with_id(
    &self,
    form_type: &str,
    owner: Option<OwnerRef>,
    session_id: SessionId,
  ) -> FormResult<FormSession> {
    let definition = self.registry.definition(form_type)?;
    let now = self.clock.now();
    let expires_at = if self.config.bypass_expiration {
      None
    } else {
      let expires_at = now
        .checked_add_signed(definition.ttl_for(owner.as_ref()))
        .ok_or_else(|| FormError::config(form_type, "ttl overflows the expiry timestamp"))?;
      Some(expires_at)
    };

    let session = FormSession::new(session_id, form_type, owner, definition.total_steps, now, expires_at);
    let stored = self.store.insert(session).await?;

    event!(Level::INFO, guest = stored.is_guest(), ?expires_at, "Session started.");
    self.events.emit(FormEvent::SessionStarted {
      form_type: stored.form_type.clone(),
      session_id: stored.session_id.clone(),
      owner: stored.owner.clone(),
    });
    Ok(stored)
  }

  /// Validates and merges one step. The final step triggers finalization.
  #[instrument(
    name = "SessionOrchestrator::submit_step",
    skip_all,
    fields(session_id = %session_id, step = step),
    err(Display)
  )]
  pub async fn submit_step(
    &self,
    session_id: &SessionId,
    owner: Option<&OwnerRef>,
    step: u32,
    payload: Value,
  ) -> FormResult<StepOutcome> {
    let now = self.clock.now();
    let session = self.load_active(session_id, owner, now).await?;
    let definition = self.registry.definition(&session.form_type)?;
    self.check_step(&definition, &session, step, now)?;

    let normalized = match self
      .validator
      .validate(&definition, step, &payload, &session.staged_files)
      .await?
    {
      ValidationOutcome::Valid(normalized) => normalized,
      ValidationOutcome::Invalid(errors) => {
        event!(Level::DEBUG, errors = errors.len(), "Step rejected by validation.");
        self.events.emit(FormEvent::ValidationFailed {
          form_type: session.form_type.clone(),
          session_id: session.session_id.clone(),
          step,
          context: FailureContext::Step,
          errors: errors.clone(),
          raw_payload: payload,
        });
        return Err(FormError::ValidationFailure { step, errors });
      }
    };
    let merged = DataMerger::merge(&session.data, step, &normalized);

    if !definition.is_final_step(step) {
      let mut next = session;
      next.data = merged;
      next.current_step = step;
      next.updated_at = now;
      let stored = self.store.compare_and_swap(next).await.map_err(lost_race)?;

      event!(Level::INFO, current_step = stored.current_step, "Step accepted.");
      self.events.emit(FormEvent::StepAccepted {
        form_type: stored.form_type.clone(),
        session_id: stored.session_id.clone(),
        step,
      });
      return Ok(StepOutcome::Advanced {
        next_step: stored.next_step(),
        session: stored,
      });
    }

    let mut claim = session;
    claim.finalizing = Some(FinalizeClaim::new(now));
    claim.updated_at = now;
    let claimed = self.store.compare_and_swap(claim).await.map_err(lost_race)?;
    event!(Level::DEBUG, "Finalization claimed.");

    let completed = self
      .finalizer
      .finalize(&definition, claimed, &merged, &payload, now)
      .await?;
    self.events.emit(FormEvent::StepAccepted {
      form_type: completed.form_type.clone(),
      session_id: completed.session_id.clone(),
      step,
    });
    match completed.entity_ref.clone() {
      Some(entity_ref) => Ok(StepOutcome::Completed {
        entity_ref,
        session: completed,
      }),
      None => Err(completed.closed_error()),
    }
  }

  /// Stores an upload for the step currently being worked on.
  #[instrument(
    name = "SessionOrchestrator::stage_file",
    skip_all,
    fields(session_id = %session_id, step = step, field = %field),
    err(Display)
  )]
  pub async fn stage_file(
    &self,
    session_id: &SessionId,
    owner: Option<&OwnerRef>,
    step: u32,
    field: &str,
    original_name: &str,
    bytes: Vec<u8>,
  ) -> FormResult<StagedFile> {
    let now = self.clock.now();
    let mut session = self.load_active(session_id, owner, now).await?;
    let definition = self.registry.definition(&session.form_type)?;
    self.check_step(&definition, &session, step, now)?;

    let accepts_files = definition
      .step(step)
      .and_then(|s| s.rule(field))
      .map_or(false, |r| matches!(r.kind, FieldKind::Files { .. }));
    if !accepts_files {
      return Err(FormError::ValidationFailure {
        step,
        errors: vec![FieldError::new(
          field,
          FieldErrorCode::UnknownField,
          format!("step {} has no file field '{}'", step, field),
        )],
      });
    }

    let staged = self
      .stager
      .stage(&session.session_id, step, field, original_name, bytes, now)
      .await?;
    session.staged_files.push(staged.clone());
    session.updated_at = now;
    if let Err(e) = self.store.compare_and_swap(session).await {
      if let Err(cleanup) = self.stager.discard(&staged).await {
        event!(Level::WARN, error = %cleanup, "Could not delete blob of a lost upload.");
      }
      return Err(lost_race(e));
    }

    event!(Level::INFO, file_id = %staged.file_id, size_bytes = staged.size_bytes, "File staged.");
    Ok(staged)
  }

  /// Deletes a staged file that no accepted step references yet.
  #[instrument(
    name = "SessionOrchestrator::discard_file",
    skip_all,
    fields(session_id = %session_id, file_id = %file_id),
    err(Display)
  )]
  pub async fn discard_file(&self, session_id: &SessionId, owner: Option<&OwnerRef>, file_id: &str) -> FormResult<()> {
    let now = self.clock.now();
    let mut session = self.load_active(session_id, owner, now).await?;
    self.check_unclaimed(&session, now)?;

    let Some(file) = session.staged_file(file_id).cloned() else {
      return Err(FormError::ValidationFailure {
        step: session.next_step(),
        errors: vec![FieldError::new(
          file_id,
          FieldErrorCode::FileNotStaged,
          format!("file '{}' is not staged on this session", file_id),
        )],
      });
    };
    let flat = DataMerger::flatten(&session.data);
    if referenced_file_ids(&flat).contains(&file_id) {
      return Err(FormError::ValidationFailure {
        step: file.step,
        errors: vec![FieldError::new(
          &file.field,
          FieldErrorCode::InvalidDirective,
          format!("file '{}' belongs to an accepted step", file_id),
        )],
      });
    }

    // Blob first: a retry after a lost write finds the record and deletes nothing.
    self.stager.discard(&file).await?;
    session.staged_files.retain(|f| f.file_id != file_id);
    session.updated_at = now;
    self.store.compare_and_swap(session).await.map_err(lost_race)?;

    event!(Level::INFO, "Staged file discarded.");
    Ok(())
  }

  /// Client-initiated teardown: releases staged files and closes the session.
  #[instrument(
    name = "SessionOrchestrator::abandon",
    skip_all,
    fields(session_id = %session_id),
    err(Display)
  )]
  pub async fn abandon(&self, session_id: &SessionId, owner: Option<&OwnerRef>) -> FormResult<()> {
    let now = self.clock.now();
    let mut session = self.load_active(session_id, owner, now).await?;
    self.check_unclaimed(&session, now)?;

    let leftover = self.stager.release(&session.staged_files).await;
    session.close(SessionStatus::Abandoned, now, leftover);
    let stored = self.store.compare_and_swap(session).await.map_err(lost_race)?;

    event!(Level::INFO, leftover_files = stored.staged_files.len(), "Session abandoned.");
    self.events.emit(FormEvent::SessionAbandoned {
      form_type: stored.form_type,
      session_id: stored.session_id,
    });
    Ok(())
  }

  /// Read-only snapshot. Closed sessions are returned as they are; an in-progress
  /// session past its expiry is expired on the spot.
  #[instrument(name = "SessionOrchestrator::session", skip_all, fields(session_id = %session_id))]
  pub async fn session(&self, session_id: &SessionId, owner: Option<&OwnerRef>) -> FormResult<FormSession> {
    let now = self.clock.now();
    let session = self.load(session_id, owner).await?;
    if self.is_expired(&session, now) {
      return Err(self.expire(session, now).await);
    }
    Ok(session)
  }

  pub async fn progress(&self, session_id: &SessionId, owner: Option<&OwnerRef>) -> FormResult<Progress> {
    let session = self.session(session_id, owner).await?;
    let next_step = if session.status == SessionStatus::InProgress {
      self
        .registry
        .definition(&session.form_type)?
        .step(session.next_step())
        .map(|s| NextStep {
          step: s.step,
          label: s.label.clone(),
          description: s.description.clone(),
        })
    } else {
      None
    };
    Ok(Progress {
      session_id: session.session_id,
      form_type: session.form_type,
      status: session.status,
      current_step: session.current_step,
      total_steps: session.total_steps,
      next_step,
      expires_at: session.expires_at,
      entity_ref: session.entity_ref,
    })
  }

  async fn load(&self, session_id: &SessionId, owner: Option<&OwnerRef>) -> FormResult<FormSession> {
    let session = self
      .store
      .load(session_id)
      .await?
      .ok_or_else(|| FormError::SessionNotFound {
        session_id: session_id.clone(),
      })?;
    session.check_owner(owner)?;
    Ok(session)
  }

  /// Loads a session that may still be written to.
  async fn load_active(
    &self,
    session_id: &SessionId,
    owner: Option<&OwnerRef>,
    now: DateTime<Utc>,
  ) -> FormResult<FormSession> {
    let session = self.load(session_id, owner).await?;
    if session.status.is_closed() {
      return Err(session.closed_error());
    }
    if self.is_expired(&session, now) {
      return Err(self.expire(session, now).await);
    }
    Ok(session)
  }

  // A session being finalized is left to the finalizer even past its expiry.
  fn is_expired(&self, session: &FormSession, now: DateTime<Utc>) -> bool {
    !self.config.bypass_expiration
      && session.is_expired_at(now)
      && !session.has_live_claim(now, self.config.finalize_lease())
  }

  /// Lazy expiry: turns the row into an expired tombstone, then releases its staged
  /// blobs. Blobs are only touched after the tombstone write wins.
  /// Returns the error to hand to the caller.
  async fn expire(&self, mut session: FormSession, now: DateTime<Utc>) -> FormError {
    let session_id = session.session_id.clone();
    let staged = std::mem::take(&mut session.staged_files);
    session.close(SessionStatus::Expired, now, staged);
    match self.store.compare_and_swap(session).await {
      Ok(stored) => {
        event!(Level::INFO, %session_id, "Session expired.");
        self.events.emit(FormEvent::SessionExpired {
          form_type: stored.form_type.clone(),
          session_id: stored.session_id.clone(),
        });
        let leftover = self.stager.release(&stored.staged_files).await;
        if leftover.len() != stored.staged_files.len() {
          let mut tombstone = stored;
          tombstone.staged_files = leftover;
          if let Err(e) = self.store.compare_and_swap(tombstone).await {
            event!(Level::DEBUG, %session_id, error = %e, "Reaper will retry staged files of expired session.");
          }
        }
      }
      Err(e) => {
        event!(Level::DEBUG, %session_id, error = %e, "Expired session changed concurrently.");
      }
    }
    FormError::SessionExpired { session_id }
  }

  fn check_step(&self, definition: &FormTypeDefinition, session: &FormSession, step: u32, now: DateTime<Utc>) -> FormResult<()> {
    if definition.step(step).is_none() {
      return Err(FormError::UnknownStep {
        form_type: definition.form_type.clone(),
        step,
      });
    }
    if step != session.next_step() {
      return Err(FormError::OutOfOrderStep {
        session_id: session.session_id.clone(),
        expected: session.next_step(),
        submitted: step,
      });
    }
    self.check_unclaimed(session, now)
  }

  fn check_unclaimed(&self, session: &FormSession, now: DateTime<Utc>) -> FormResult<()> {
    if session.has_live_claim(now, self.config.finalize_lease()) {
      return Err(FormError::Conflict {
        session_id: session.session_id.clone(),
        message: "finalization in progress".to_string(),
      });
    }
    Ok(())
  }
}

fn lost_race(err: StoreError) -> FormError {
  if let StoreError::VersionConflict { session_id, .. } = &err {
    event!(Level::WARN, %session_id, "Session modified concurrently.");
  }
  err.into()
}
