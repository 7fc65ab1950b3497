// formstage/src/validation/validator.rs

//! Validates one step's raw payload against the step's field rules and
//! normalizes it into typed field values.
//!
//! All violations are collected; validation never stops at the first one.
//! Infrastructure failures of the reference-data collaborator are returned as
//! `FormError::Unavailable`, never reported as field errors.

use crate::definition::{ColumnRule, FieldKind, FieldRule, FormTypeDefinition};
use crate::error::{FormError, FormResult};
use crate::merge::DataMerger;
use crate::session::{FieldValue, Row, StagedFile, StagedFileRef, StepField, StepFields};
use crate::validation::reference::{id_key, ReferenceData};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorCode {
  Required,
  Type,
  Min,
  Max,
  MinLength,
  MaxLength,
  NotFound,
  UnknownField,
  FileNotStaged,
  FileTooLarge,
  FileExtension,
  MinItems,
  MaxItems,
  InvalidDirective,
  /// Rejected by the domain layer at finalization.
  Rejected,
}

impl fmt::Display for FieldErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      FieldErrorCode::Required => "required",
      FieldErrorCode::Type => "type",
      FieldErrorCode::Min => "min",
      FieldErrorCode::Max => "max",
      FieldErrorCode::MinLength => "min_length",
      FieldErrorCode::MaxLength => "max_length",
      FieldErrorCode::NotFound => "not_found",
      FieldErrorCode::UnknownField => "unknown_field",
      FieldErrorCode::FileNotStaged => "file_not_staged",
      FieldErrorCode::FileTooLarge => "file_too_large",
      FieldErrorCode::FileExtension => "file_extension",
      FieldErrorCode::MinItems => "min_items",
      FieldErrorCode::MaxItems => "max_items",
      FieldErrorCode::InvalidDirective => "invalid_directive",
      FieldErrorCode::Rejected => "rejected",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
  /// Field path, e.g. `price` or `attributes[1].value_id`.
  pub field: String,
  pub code: FieldErrorCode,
  pub message: String,
}

impl FieldError {
  pub fn new(field: impl Into<String>, code: FieldErrorCode, message: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      code,
      message: message.into(),
    }
  }
}

impl fmt::Display for FieldError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({}): {}", self.field, self.code, self.message)
  }
}

/// A payload that passed validation, with every field typed and tagged with its merge policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedPayload {
  pub fields: StepFields,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
  Valid(NormalizedPayload),
  Invalid(Vec<FieldError>),
}

fn is_blank(value: &Value) -> bool {
  match value {
    Value::Null => true,
    Value::String(s) => s.trim().is_empty(),
    Value::Array(items) => items.is_empty(),
    _ => false,
  }
}

pub struct StepValidator {
  reference: Arc<dyn ReferenceData>,
}

impl StepValidator {
  pub fn new(reference: Arc<dyn ReferenceData>) -> Self {
    Self { reference }
  }

  /// Validates `raw` against the rules of `step`. `staged` are the files already
  /// staged for the session; file fields may only reference those.
  #[instrument(
    name = "StepValidator::validate",
    skip_all,
    fields(form_type = %definition.form_type, step = step)
  )]
  pub async fn validate(
    &self,
    definition: &FormTypeDefinition,
    step: u32,
    raw: &Value,
    staged: &[StagedFile],
  ) -> FormResult<ValidationOutcome> {
    let step_def = definition.step(step).ok_or_else(|| FormError::UnknownStep {
      form_type: definition.form_type.clone(),
      step,
    })?;

    let Some(object) = raw.as_object() else {
      return Ok(ValidationOutcome::Invalid(vec![FieldError::new(
        "",
        FieldErrorCode::Type,
        "payload must be a JSON object",
      )]));
    };

    let mut errors = Vec::new();
    let mut fields = StepFields::new();

    for rule in &step_def.fields {
      let value = match object.get(&rule.field) {
        Some(v) if !is_blank(v) => v,
        _ => {
          if rule.required {
            errors.push(FieldError::new(
              &rule.field,
              FieldErrorCode::Required,
              format!("{} is required", rule.field),
            ));
          }
          continue;
        }
      };

      let accepted = match &rule.kind {
        FieldKind::Rows { .. } => self
          .check_rows(rule, value, &mut errors)
          .await?
          .map(|rows| (FieldValue::Rows(rows), false)),
        FieldKind::Files { .. } => {
          check_files(step, rule, value, staged, &mut errors).map(|(refs, replace)| (FieldValue::Files(refs), replace))
        }
        kind => self
          .check_scalar(&rule.field, kind, value, &mut errors)
          .await?
          .map(|v| (FieldValue::Scalar(v), false)),
      };

      if let Some((value, replace)) = accepted {
        fields.insert(
          rule.field.clone(),
          StepField {
            policy: rule.merge_policy(),
            value,
            replace,
          },
        );
      }
    }

    for key in object.keys() {
      if step_def.rule(key).is_none() {
        errors.push(FieldError::new(
          key,
          FieldErrorCode::UnknownField,
          format!("step {} does not accept field '{}'", step, key),
        ));
      }
    }

    if errors.is_empty() {
      event!(Level::DEBUG, fields = fields.len(), "Step payload valid.");
      Ok(ValidationOutcome::Valid(NormalizedPayload { fields }))
    } else {
      event!(Level::DEBUG, errors = errors.len(), "Step payload invalid.");
      Ok(ValidationOutcome::Invalid(errors))
    }
  }

  async fn check_scalar(
    &self,
    path: &str,
    kind: &FieldKind,
    value: &Value,
    errors: &mut Vec<FieldError>,
  ) -> FormResult<Option<Value>> {
    let type_error = |expected: &str| FieldError::new(path, FieldErrorCode::Type, format!("expected {}", expected));

    let normalized = match kind {
      FieldKind::String { min_len, max_len } => {
        let Some(s) = value.as_str() else {
          errors.push(type_error("a string"));
          return Ok(None);
        };
        let s = s.trim();
        let len = s.chars().count();
        if let Some(min) = min_len.filter(|min| len < *min) {
          errors.push(FieldError::new(
            path,
            FieldErrorCode::MinLength,
            format!("must be at least {} characters", min),
          ));
          return Ok(None);
        }
        if let Some(max) = max_len.filter(|max| len > *max) {
          errors.push(FieldError::new(
            path,
            FieldErrorCode::MaxLength,
            format!("must be at most {} characters", max),
          ));
          return Ok(None);
        }
        Value::String(s.to_string())
      }
      FieldKind::Integer { min, max } => {
        let parsed = match value {
          Value::Number(n) => n.as_i64(),
          Value::String(s) => s.trim().parse::<i64>().ok(),
          _ => None,
        };
        let Some(n) = parsed else {
          errors.push(type_error("an integer"));
          return Ok(None);
        };
        if !check_bounds(path, n, *min, *max, errors) {
          return Ok(None);
        }
        Value::from(n)
      }
      FieldKind::Decimal { min, max } => {
        let parsed = match value {
          Value::Number(n) => n.as_f64(),
          Value::String(s) => s.trim().parse::<f64>().ok(),
          _ => None,
        };
        let Some(number) = parsed.and_then(Number::from_f64) else {
          errors.push(type_error("a decimal number"));
          return Ok(None);
        };
        let x = number.as_f64().unwrap_or_default();
        if !check_bounds(path, x, *min, *max, errors) {
          return Ok(None);
        }
        Value::Number(number)
      }
      FieldKind::Boolean => {
        let parsed = match value {
          Value::Bool(b) => Some(*b),
          Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
          },
          Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" | "yes" => Some(true),
            "false" | "0" | "off" | "no" => Some(false),
            _ => None,
          },
          _ => None,
        };
        let Some(b) = parsed else {
          errors.push(type_error("a boolean"));
          return Ok(None);
        };
        Value::Bool(b)
      }
      FieldKind::Reference { entity } => {
        let Some(id) = id_key(value) else {
          errors.push(type_error("an integer or string id"));
          return Ok(None);
        };
        let exists = self
          .reference
          .exists(entity, &id)
          .await
          .map_err(|e| FormError::unavailable("reference_data", e))?;
        if !exists {
          errors.push(FieldError::new(
            path,
            FieldErrorCode::NotFound,
            format!("{} '{}' does not exist", entity, id),
          ));
          return Ok(None);
        }
        value.clone()
      }
      FieldKind::Rows { .. } | FieldKind::Files { .. } => {
        errors.push(type_error("a scalar value"));
        return Ok(None);
      }
    };
    Ok(Some(normalized))
  }

  async fn check_rows(&self, rule: &FieldRule, value: &Value, errors: &mut Vec<FieldError>) -> FormResult<Option<Vec<Row>>> {
    let FieldKind::Rows {
      key,
      columns,
      min_rows,
      max_rows,
    } = &rule.kind
    else {
      return Ok(None);
    };
    let field = rule.field.as_str();
    let Some(items) = value.as_array() else {
      errors.push(FieldError::new(field, FieldErrorCode::Type, "expected a list of rows"));
      return Ok(None);
    };

    let errors_before = errors.len();
    let mut rows = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
      let row_path = format!("{}[{}]", field, idx);
      let Some(object) = item.as_object() else {
        errors.push(FieldError::new(&row_path, FieldErrorCode::Type, "expected an object"));
        continue;
      };
      if let Some(row) = self.check_row(&row_path, key, columns, object, errors).await? {
        rows.push(row);
      }
    }
    if errors.len() > errors_before {
      return Ok(None);
    }

    // Repeated keys within one payload collapse to the last occurrence.
    let mut merged = Vec::with_capacity(rows.len());
    DataMerger::upsert_rows(&mut merged, &rows, key);

    if let Some(min) = min_rows.filter(|min| merged.len() < *min) {
      errors.push(FieldError::new(
        field,
        FieldErrorCode::MinItems,
        format!("at least {} row(s) required", min),
      ));
      return Ok(None);
    }
    if let Some(max) = max_rows.filter(|max| merged.len() > *max) {
      errors.push(FieldError::new(
        field,
        FieldErrorCode::MaxItems,
        format!("at most {} row(s) allowed", max),
      ));
      return Ok(None);
    }
    Ok(Some(merged))
  }

  async fn check_row(
    &self,
    row_path: &str,
    key: &str,
    columns: &[ColumnRule],
    object: &Row,
    errors: &mut Vec<FieldError>,
  ) -> FormResult<Option<Row>> {
    let errors_before = errors.len();
    let mut row = Row::new();
    for column in columns {
      let path = format!("{}.{}", row_path, column.column);
      match object.get(&column.column) {
        Some(v) if !is_blank(v) => {
          if let Some(normalized) = self.check_scalar(&path, &column.kind, v, errors).await? {
            row.insert(column.column.clone(), normalized);
          }
        }
        _ if column.required || column.column == key => {
          errors.push(FieldError::new(
            &path,
            FieldErrorCode::Required,
            format!("{} is required", column.column),
          ));
        }
        _ => {}
      }
    }
    for name in object.keys() {
      if !columns.iter().any(|c| &c.column == name) {
        errors.push(FieldError::new(
          format!("{}.{}", row_path, name),
          FieldErrorCode::UnknownField,
          format!("unknown column '{}'", name),
        ));
      }
    }
    Ok((errors.len() == errors_before).then_some(row))
  }
}

fn check_bounds<T: PartialOrd + fmt::Display + Copy>(
  path: &str,
  value: T,
  min: Option<T>,
  max: Option<T>,
  errors: &mut Vec<FieldError>,
) -> bool {
  if let Some(min) = min.filter(|min| value < *min) {
    errors.push(FieldError::new(path, FieldErrorCode::Min, format!("must be at least {}", min)));
    return false;
  }
  if let Some(max) = max.filter(|max| value > *max) {
    errors.push(FieldError::new(path, FieldErrorCode::Max, format!("must be at most {}", max)));
    return false;
  }
  true
}

/// Accepts either a list of staged file ids, or `{"replace": bool, "files": [ids]}`.
fn parse_file_directive<'a>(
  field: &str,
  value: &'a Value,
  errors: &mut Vec<FieldError>,
) -> Option<(&'a Vec<Value>, bool)> {
  match value {
    Value::Array(ids) => Some((ids, false)),
    Value::Object(directive) => {
      if let Some(unknown) = directive.keys().find(|k| *k != "files" && *k != "replace") {
        errors.push(FieldError::new(
          field,
          FieldErrorCode::InvalidDirective,
          format!("unknown directive key '{}'", unknown),
        ));
        return None;
      }
      let replace = match directive.get("replace") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
          errors.push(FieldError::new(field, FieldErrorCode::InvalidDirective, "replace must be a boolean"));
          return None;
        }
      };
      match directive.get("files") {
        Some(Value::Array(ids)) => Some((ids, replace)),
        _ => {
          errors.push(FieldError::new(
            field,
            FieldErrorCode::InvalidDirective,
            "files must be a list of staged file ids",
          ));
          None
        }
      }
    }
    _ => {
      errors.push(FieldError::new(field, FieldErrorCode::Type, "expected a list of staged file ids"));
      None
    }
  }
}

fn check_files(
  step: u32,
  rule: &FieldRule,
  value: &Value,
  staged: &[StagedFile],
  errors: &mut Vec<FieldError>,
) -> Option<(Vec<StagedFileRef>, bool)> {
  let FieldKind::Files {
    min_files,
    max_files,
    max_size_bytes,
    allowed_extensions,
  } = &rule.kind
  else {
    return None;
  };
  let field = rule.field.as_str();
  let (ids, replace) = parse_file_directive(field, value, errors)?;

  let errors_before = errors.len();
  let mut refs: Vec<StagedFileRef> = Vec::with_capacity(ids.len());
  for (idx, id) in ids.iter().enumerate() {
    let path = format!("{}[{}]", field, idx);
    let Some(id) = id.as_str() else {
      errors.push(FieldError::new(&path, FieldErrorCode::Type, "expected a staged file id"));
      continue;
    };
    let Some(file) = staged
      .iter()
      .find(|f| f.file_id == id && f.step == step && f.field == field)
    else {
      errors.push(FieldError::new(
        &path,
        FieldErrorCode::FileNotStaged,
        format!("file '{}' was not staged for this step", id),
      ));
      continue;
    };
    if let Some(limit) = max_size_bytes.filter(|limit| file.size_bytes > *limit) {
      errors.push(FieldError::new(
        &path,
        FieldErrorCode::FileTooLarge,
        format!("'{}' exceeds {} bytes", file.original_name, limit),
      ));
      continue;
    }
    if !allowed_extensions.is_empty() {
      let allowed = file
        .extension()
        .map_or(false, |ext| allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)));
      if !allowed {
        errors.push(FieldError::new(
          &path,
          FieldErrorCode::FileExtension,
          format!("'{}' must be one of: {}", file.original_name, allowed_extensions.join(", ")),
        ));
        continue;
      }
    }
    if !refs.iter().any(|r| r.file_id == file.file_id) {
      refs.push(file.to_ref());
    }
  }
  if errors.len() > errors_before {
    return None;
  }

  if let Some(min) = min_files.filter(|min| refs.len() < *min) {
    errors.push(FieldError::new(
      field,
      FieldErrorCode::MinItems,
      format!("at least {} file(s) required", min),
    ));
    return None;
  }
  if let Some(max) = max_files.filter(|max| refs.len() > *max) {
    errors.push(FieldError::new(
      field,
      FieldErrorCode::MaxItems,
      format!("at most {} file(s) allowed", max),
    ));
    return None;
  }
  Some((refs, replace))
}
