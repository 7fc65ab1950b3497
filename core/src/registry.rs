// formstage/src/registry.rs

//! Defines `FormRegistry`, the form-type keyed registry of step definitions.
//! Built once at process start; shared read-only behind an `Arc` afterwards.

use crate::definition::FormTypeDefinition;
use crate::error::{FormError, FormResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

#[derive(Debug, Default)]
pub struct FormRegistry {
  forms: HashMap<String, Arc<FormTypeDefinition>>,
}

impl FormRegistry {
  /// Creates a new, empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Checks and registers a form-type definition. A form type can only be registered once;
  /// there is a single authoritative step layout per form type.
  pub fn register(&mut self, mut definition: FormTypeDefinition) -> FormResult<()> {
    definition.check()?;
    if self.forms.contains_key(&definition.form_type) {
      return Err(FormError::config(
        definition.form_type,
        "form type registered more than once",
      ));
    }
    event!(
      Level::DEBUG,
      form_type = %definition.form_type,
      total_steps = definition.total_steps,
      ttl_secs = definition.ttl_secs,
      "Registering form type."
    );
    self
      .forms
      .insert(definition.form_type.clone(), Arc::new(definition));
    Ok(())
  }

  /// Builds a registry from a list of definitions, failing on the first invalid one.
  pub fn from_definitions(definitions: impl IntoIterator<Item = FormTypeDefinition>) -> FormResult<Self> {
    let mut registry = Self::new();
    for definition in definitions {
      registry.register(definition)?;
    }
    Ok(registry)
  }

  /// Looks up the definition for `form_type`.
  pub fn definition(&self, form_type: &str) -> FormResult<Arc<FormTypeDefinition>> {
    self.forms.get(form_type).cloned().ok_or_else(|| {
      event!(Level::WARN, %form_type, "No form type registered.");
      FormError::UnknownFormType {
        form_type: form_type.to_string(),
      }
    })
  }

  pub fn form_types(&self) -> impl Iterator<Item = &str> {
    self.forms.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.forms.len()
  }

  pub fn is_empty(&self) -> bool {
    self.forms.is_empty()
  }
}
