// formstage/src/events.rs

//! Domain events emitted by the engine and the sinks that receive them.
//!
//! Events carry fully resolved data at emission time (labels included); sinks
//! never call back into the engine.

use crate::files::PromotedFile;
use crate::session::{EntityRef, OwnerRef, Row, SessionId};
use crate::validation::FieldError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{event, Level};

/// Where a validation failure was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureContext {
  Step,
  Finalization,
}

/// A submitted row together with display labels for its reference columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelledRow {
  pub values: Row,
  /// Column name to label, for reference columns whose label could be resolved.
  pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FormEvent {
  SessionStarted {
    form_type: String,
    session_id: SessionId,
    owner: Option<OwnerRef>,
  },
  StepAccepted {
    form_type: String,
    session_id: SessionId,
    step: u32,
  },
  ValidationFailed {
    form_type: String,
    session_id: SessionId,
    step: u32,
    context: FailureContext,
    errors: Vec<FieldError>,
    raw_payload: Value,
  },
  ResourceCreated {
    entity_ref: EntityRef,
    form_type: String,
    session_id: SessionId,
    owner: Option<OwnerRef>,
    /// Scalar fields across all steps.
    fields: BTreeMap<String, Value>,
    /// Labels of scalar reference fields.
    labels: BTreeMap<String, String>,
    rows: BTreeMap<String, Vec<LabelledRow>>,
    files: Vec<PromotedFile>,
  },
  SessionAbandoned {
    form_type: String,
    session_id: SessionId,
  },
  SessionExpired {
    form_type: String,
    session_id: SessionId,
  },
}

impl FormEvent {
  pub fn name(&self) -> &'static str {
    match self {
      FormEvent::SessionStarted { .. } => "session_started",
      FormEvent::StepAccepted { .. } => "step_accepted",
      FormEvent::ValidationFailed { .. } => "validation_failed",
      FormEvent::ResourceCreated { .. } => "resource_created",
      FormEvent::SessionAbandoned { .. } => "session_abandoned",
      FormEvent::SessionExpired { .. } => "session_expired",
    }
  }

  pub fn session_id(&self) -> &SessionId {
    match self {
      FormEvent::SessionStarted { session_id, .. }
      | FormEvent::StepAccepted { session_id, .. }
      | FormEvent::ValidationFailed { session_id, .. }
      | FormEvent::ResourceCreated { session_id, .. }
      | FormEvent::SessionAbandoned { session_id, .. }
      | FormEvent::SessionExpired { session_id, .. } => session_id,
    }
  }
}

/// Receives emitted events. Dispatch to subscribers is the sink's concern.
pub trait EventSink: Send + Sync {
  fn emit(&self, event: FormEvent);
}

/// Records events in memory; used by tests and the demo application.
///
/// `new()` keeps everything. `with_capacity(n)` keeps the most recent `n`, dropping
/// the oldest on overflow.
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
  events: Mutex<VecDeque<FormEvent>>,
  capacity: Option<usize>,
}

impl InMemoryEventSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      events: Mutex::new(VecDeque::with_capacity(capacity)),
      capacity: Some(capacity),
    }
  }

  pub fn capacity(&self) -> Option<usize> {
    self.capacity
  }

  /// Recorded events, oldest first.
  pub fn events(&self) -> Vec<FormEvent> {
    self.events.lock().iter().cloned().collect()
  }

  /// Events with the given `name()`.
  pub fn named(&self, name: &str) -> Vec<FormEvent> {
    self.events.lock().iter().filter(|e| e.name() == name).cloned().collect()
  }

  pub fn count(&self, name: &str) -> usize {
    self.events.lock().iter().filter(|e| e.name() == name).count()
  }

  pub fn len(&self) -> usize {
    self.events.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.events.lock().is_empty()
  }

  pub fn clear(&self) {
    self.events.lock().clear();
  }
}

impl EventSink for InMemoryEventSink {
  fn emit(&self, event: FormEvent) {
    let mut events = self.events.lock();
    if let Some(capacity) = self.capacity {
      if capacity == 0 {
        return;
      }
      while events.len() >= capacity {
        events.pop_front();
      }
    }
    events.push_back(event);
  }
}

/// Logs every event as a structured tracing record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
  fn emit(&self, form_event: FormEvent) {
    let payload = serde_json::to_string(&form_event).unwrap_or_default();
    match &form_event {
      FormEvent::ValidationFailed { .. } => event!(
        Level::WARN,
        event = form_event.name(),
        session_id = %form_event.session_id(),
        %payload,
        "Form event."
      ),
      _ => event!(
        Level::INFO,
        event = form_event.name(),
        session_id = %form_event.session_id(),
        %payload,
        "Form event."
      ),
    }
  }
}

/// Forwards each event to every inner sink, in order.
#[derive(Default, Clone)]
pub struct FanoutEventSink {
  sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
    self.sinks.push(sink);
    self
  }
}

impl EventSink for FanoutEventSink {
  fn emit(&self, event: FormEvent) {
    for sink in &self.sinks {
      sink.emit(event.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fanout_reaches_every_sink() {
    let a = Arc::new(InMemoryEventSink::new());
    let b = Arc::new(InMemoryEventSink::new());
    let fanout = FanoutEventSink::new()
      .with(a.clone())
      .with(b.clone())
      .with(Arc::new(TracingEventSink));

    fanout.emit(FormEvent::SessionAbandoned {
      form_type: "listing".into(),
      session_id: SessionId::generate(),
    });
    assert_eq!(a.count("session_abandoned"), 1);
    assert_eq!(b.events().len(), 1);
  }

  #[test]
  fn bounded_sink_keeps_the_most_recent_events() {
    let sink = InMemoryEventSink::with_capacity(2);
    for step in 1..=3 {
      sink.emit(FormEvent::StepAccepted {
        form_type: "listing".into(),
        session_id: SessionId::generate(),
        step,
      });
    }
    let steps: Vec<u32> = sink
      .events()
      .into_iter()
      .filter_map(|e| match e {
        FormEvent::StepAccepted { step, .. } => Some(step),
        _ => None,
      })
      .collect();
    assert_eq!(steps, vec![2, 3]);
    assert_eq!(sink.len(), 2);

    let unbounded = InMemoryEventSink::new();
    assert_eq!(unbounded.capacity(), None);
  }

  #[test]
  fn events_serialize_with_a_tag() {
    let value = serde_json::to_value(FormEvent::StepAccepted {
      form_type: "listing".into(),
      session_id: SessionId::parse("session-0001").unwrap(),
      step: 2,
    })
    .unwrap();
    assert_eq!(value["event"], "step_accepted");
    assert_eq!(value["session_id"], "session-0001");
  }
}
