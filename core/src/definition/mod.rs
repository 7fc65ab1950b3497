// formstage/src/definition/mod.rs

//! Form-type and step definitions. These are loaded once at startup and are
//! immutable afterwards.

pub mod rules;

pub use rules::{ColumnRule, FieldKind, FieldRule, MergePolicy};

use crate::clock::{seconds, MAX_DURATION_SECS};
use crate::error::{FormError, FormResult};
use crate::session::OwnerRef;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One ordered unit of a form type with its own validation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
  pub step: u32,
  pub label: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub fields: Vec<FieldRule>,
}

impl StepDefinition {
  pub fn new(step: u32, label: impl Into<String>) -> Self {
    Self {
      step,
      label: label.into(),
      description: String::new(),
      fields: Vec::new(),
    }
  }

  pub fn describe(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn field(mut self, rule: FieldRule) -> Self {
    self.fields.push(rule);
    self
  }

  pub fn rule(&self, field: &str) -> Option<&FieldRule> {
    self.fields.iter().find(|r| r.field == field)
  }
}

/// A named multi-step submission schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormTypeDefinition {
  pub form_type: String,
  pub total_steps: u32,
  pub ttl_secs: u64,
  /// Shorter lifetime for sessions without an owner. Falls back to `ttl_secs`.
  #[serde(default)]
  pub guest_ttl_secs: Option<u64>,
  /// The entity kind the finalized submission creates (e.g. "product").
  #[serde(default)]
  pub entity_kind: Option<String>,
  pub steps: Vec<StepDefinition>,
}

impl FormTypeDefinition {
  pub fn new(form_type: impl Into<String>, ttl_secs: u64, steps: Vec<StepDefinition>) -> Self {
    Self {
      form_type: form_type.into(),
      total_steps: steps.len() as u32,
      ttl_secs,
      guest_ttl_secs: None,
      entity_kind: None,
      steps,
    }
  }

  pub fn with_guest_ttl(mut self, secs: u64) -> Self {
    self.guest_ttl_secs = Some(secs);
    self
  }

  pub fn step(&self, step: u32) -> Option<&StepDefinition> {
    self.steps.iter().find(|s| s.step == step)
  }

  pub fn is_final_step(&self, step: u32) -> bool {
    step == self.total_steps
  }

  pub fn ttl_for(&self, owner: Option<&OwnerRef>) -> Duration {
    let secs = match owner {
      Some(_) => self.ttl_secs,
      None => self.guest_ttl_secs.unwrap_or(self.ttl_secs),
    };
    seconds(secs)
  }

  /// The rule governing `field` in the flattened (cross-step) view: the last step
  /// that declares the field wins.
  pub fn rule_for_field(&self, field: &str) -> Option<&FieldRule> {
    self.steps.iter().rev().find_map(|s| s.rule(field))
  }

  /// Sorts steps and checks the definition is internally consistent.
  pub(crate) fn check(&mut self) -> FormResult<()> {
    let form_type = self.form_type.clone();
    if form_type.trim().is_empty() {
      return Err(FormError::config(form_type, "form type id must not be empty"));
    }
    if self.total_steps < 1 {
      return Err(FormError::config(form_type, "total_steps must be at least 1"));
    }
    if self.ttl_secs == 0 {
      return Err(FormError::config(form_type, "ttl_secs must be greater than zero"));
    }
    if self.guest_ttl_secs == Some(0) {
      return Err(FormError::config(form_type, "guest_ttl_secs must be greater than zero"));
    }
    for (name, value) in [("ttl_secs", Some(self.ttl_secs)), ("guest_ttl_secs", self.guest_ttl_secs)] {
      if let Some(value) = value.filter(|v| *v > MAX_DURATION_SECS) {
        return Err(FormError::config(
          form_type,
          format!("{} must be at most {}, found {}", name, MAX_DURATION_SECS, value),
        ));
      }
    }

    self.steps.sort_by_key(|s| s.step);
    let numbers: Vec<u32> = self.steps.iter().map(|s| s.step).collect();
    let expected: Vec<u32> = (1..=self.total_steps).collect();
    if numbers != expected {
      return Err(FormError::config(
        form_type,
        format!(
          "steps must be numbered contiguously 1..={}, found {:?}",
          self.total_steps, numbers
        ),
      ));
    }

    for step in &self.steps {
      let mut seen = HashSet::new();
      for rule in &step.fields {
        if !seen.insert(rule.field.as_str()) {
          return Err(FormError::config(
            &form_type,
            format!("step {} declares field '{}' twice", step.step, rule.field),
          ));
        }
        check_field_rule(&form_type, step.step, rule)?;
      }
    }
    Ok(())
  }
}

fn check_field_rule(form_type: &str, step: u32, rule: &FieldRule) -> FormResult<()> {
  let at = |msg: String| FormError::config(form_type, format!("step {} field '{}': {}", step, rule.field, msg));

  if let FieldKind::Rows { key, columns, .. } = &rule.kind {
    if !columns.iter().any(|c| &c.column == key) {
      return Err(at(format!("row key '{}' is not a declared column", key)));
    }
    if let Some(bad) = columns.iter().find(|c| !c.kind.is_scalar()) {
      return Err(at(format!("column '{}' must be scalar, found {}", bad.column, bad.kind.name())));
    }
  }

  match (&rule.merge, &rule.kind) {
    (Some(MergePolicy::UpsertByKey { key }), FieldKind::Rows { columns, .. }) => {
      if !columns.iter().any(|c| &c.column == key) {
        return Err(at(format!("merge key '{}' is not a declared column", key)));
      }
    }
    (Some(MergePolicy::UpsertByKey { .. }), kind) => {
      return Err(at(format!("upsert_by_key only applies to rows, found {}", kind.name())));
    }
    (Some(MergePolicy::AppendOnly), kind) if !matches!(kind, FieldKind::Files { .. }) => {
      return Err(at(format!("append_only only applies to files, found {}", kind.name())));
    }
    _ => {}
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn two_step() -> FormTypeDefinition {
    FormTypeDefinition::new(
      "listing",
      600,
      vec![
        StepDefinition::new(2, "Attributes"),
        StepDefinition::new(1, "Details").field(FieldRule::new("name", FieldKind::string()).required()),
      ],
    )
  }

  #[test]
  fn check_sorts_steps() {
    let mut def = two_step();
    def.check().unwrap();
    assert_eq!(def.steps[0].step, 1);
    assert_eq!(def.step(2).unwrap().label, "Attributes");
  }

  #[test]
  fn check_rejects_gaps() {
    let mut def = two_step();
    def.steps[0].step = 3;
    let err = def.check().unwrap_err();
    assert!(matches!(err, FormError::Configuration { .. }));
  }

  #[test]
  fn check_rejects_row_key_without_column() {
    let mut def = FormTypeDefinition::new(
      "listing",
      600,
      vec![StepDefinition::new(1, "Attributes").field(FieldRule::new(
        "attributes",
        FieldKind::rows("attribute_id", vec![ColumnRule::new("value_id", FieldKind::integer())]),
      ))],
    );
    assert!(def.check().is_err());
  }

  #[test]
  fn guest_sessions_use_guest_ttl() {
    let def = two_step().with_guest_ttl(60);
    assert_eq!(def.ttl_for(None), Duration::seconds(60));
    assert_eq!(def.ttl_for(Some(&OwnerRef::new("seller-1"))), Duration::seconds(600));
  }
}
