// formstage/src/definition/rules.rs

//! Field rule expressions attached to a step: presence, type, bounds,
//! referential existence and how the accepted value merges into session data.

use serde::{Deserialize, Serialize};

/// How an accepted field value combines with a value already held for the same field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum MergePolicy {
  /// Last write for the field path wins.
  Overwrite,
  /// Repeated rows are merged by `key`; a row with a known key replaces the prior
  /// row in place, new keys are appended.
  UpsertByKey { key: String },
  /// File references accumulate unless the payload carries a replace directive.
  AppendOnly,
}

/// The shape and constraints of a field (or of a column inside a row field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
  String {
    #[serde(default)]
    min_len: Option<usize>,
    #[serde(default)]
    max_len: Option<usize>,
  },
  Integer {
    #[serde(default)]
    min: Option<i64>,
    #[serde(default)]
    max: Option<i64>,
  },
  Decimal {
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
  },
  Boolean,
  /// An id (integer or string) that must exist in the reference data for `entity`.
  Reference { entity: String },
  Rows {
    key: String,
    columns: Vec<ColumnRule>,
    #[serde(default)]
    min_rows: Option<usize>,
    #[serde(default)]
    max_rows: Option<usize>,
  },
  /// Ids of files staged for this session and step.
  Files {
    #[serde(default)]
    min_files: Option<usize>,
    #[serde(default)]
    max_files: Option<usize>,
    #[serde(default)]
    max_size_bytes: Option<u64>,
    #[serde(default)]
    allowed_extensions: Vec<String>,
  },
}

impl FieldKind {
  pub fn string() -> Self {
    FieldKind::String {
      min_len: None,
      max_len: None,
    }
  }

  pub fn integer() -> Self {
    FieldKind::Integer { min: None, max: None }
  }

  pub fn decimal() -> Self {
    FieldKind::Decimal { min: None, max: None }
  }

  pub fn reference(entity: impl Into<String>) -> Self {
    FieldKind::Reference { entity: entity.into() }
  }

  pub fn rows(key: impl Into<String>, columns: Vec<ColumnRule>) -> Self {
    FieldKind::Rows {
      key: key.into(),
      columns,
      min_rows: None,
      max_rows: None,
    }
  }

  pub fn files() -> Self {
    FieldKind::Files {
      min_files: None,
      max_files: None,
      max_size_bytes: None,
      allowed_extensions: Vec::new(),
    }
  }

  pub fn is_scalar(&self) -> bool {
    !matches!(self, FieldKind::Rows { .. } | FieldKind::Files { .. })
  }

  pub fn name(&self) -> &'static str {
    match self {
      FieldKind::String { .. } => "string",
      FieldKind::Integer { .. } => "integer",
      FieldKind::Decimal { .. } => "decimal",
      FieldKind::Boolean => "boolean",
      FieldKind::Reference { .. } => "reference",
      FieldKind::Rows { .. } => "rows",
      FieldKind::Files { .. } => "files",
    }
  }

  /// The merge policy a field of this kind gets when its rule does not declare one.
  pub fn default_merge_policy(&self) -> MergePolicy {
    match self {
      FieldKind::Rows { key, .. } => MergePolicy::UpsertByKey { key: key.clone() },
      FieldKind::Files { .. } => MergePolicy::AppendOnly,
      _ => MergePolicy::Overwrite,
    }
  }
}

/// A rule for one top-level field of a step payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
  pub field: String,
  #[serde(default)]
  pub required: bool,
  #[serde(flatten)]
  pub kind: FieldKind,
  #[serde(default)]
  pub merge: Option<MergePolicy>,
}

impl FieldRule {
  pub fn new(field: impl Into<String>, kind: FieldKind) -> Self {
    Self {
      field: field.into(),
      required: false,
      kind,
      merge: None,
    }
  }

  pub fn required(mut self) -> Self {
    self.required = true;
    self
  }

  pub fn with_merge(mut self, policy: MergePolicy) -> Self {
    self.merge = Some(policy);
    self
  }

  pub fn merge_policy(&self) -> MergePolicy {
    self.merge.clone().unwrap_or_else(|| self.kind.default_merge_policy())
  }
}

/// A rule for one column inside a repeated-row field. Columns are always scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRule {
  pub column: String,
  #[serde(default)]
  pub required: bool,
  #[serde(flatten)]
  pub kind: FieldKind,
}

impl ColumnRule {
  pub fn new(column: impl Into<String>, kind: FieldKind) -> Self {
    Self {
      column: column.into(),
      required: false,
      kind,
    }
  }

  pub fn required(mut self) -> Self {
    self.required = true;
    self
  }
}
