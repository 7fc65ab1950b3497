// formstage/src/merge.rs

//! Folds validated step payloads into a session's accumulated data.
//!
//! Merging is pure and total. Every shape mismatch has already been rejected by
//! the validator, so when an existing value does not have the shape its policy
//! expects, the incoming value simply takes its place.

use crate::definition::MergePolicy;
use crate::session::{FieldValue, Row, SessionData, StagedFileRef, StepField};
use crate::validation::{id_key, NormalizedPayload};
use serde_json::Value;
use std::collections::BTreeMap;

/// Field name to merged value, across all steps.
pub type FlattenedData = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Copy, Default)]
pub struct DataMerger;

impl DataMerger {
  /// Merges `payload` into the entry for `step`, leaving other steps untouched.
  pub fn merge(existing: &SessionData, step: u32, payload: &NormalizedPayload) -> SessionData {
    let mut merged = existing.clone();
    let fields = merged.entry(step).or_default();
    for (name, incoming) in &payload.fields {
      let value = Self::combine(fields.get(name).map(|f| &f.value), incoming);
      fields.insert(
        name.clone(),
        StepField {
          policy: incoming.policy.clone(),
          value,
          replace: incoming.replace,
        },
      );
    }
    merged
  }

  /// The cross-step view: steps are folded in ascending order, each field
  /// combining with what earlier steps held for the same name.
  pub fn flatten(data: &SessionData) -> FlattenedData {
    let mut flat = FlattenedData::new();
    for fields in data.values() {
      for (name, field) in fields {
        let value = Self::combine(flat.get(name), field);
        flat.insert(name.clone(), value);
      }
    }
    flat
  }

  fn combine(prior: Option<&FieldValue>, incoming: &StepField) -> FieldValue {
    match (&incoming.policy, prior, &incoming.value) {
      (MergePolicy::UpsertByKey { key }, Some(FieldValue::Rows(existing)), FieldValue::Rows(rows)) => {
        let mut merged = existing.clone();
        Self::upsert_rows(&mut merged, rows, key);
        FieldValue::Rows(merged)
      }
      (MergePolicy::AppendOnly, Some(FieldValue::Files(existing)), FieldValue::Files(files)) if !incoming.replace => {
        let mut merged = existing.clone();
        Self::append_files(&mut merged, files);
        FieldValue::Files(merged)
      }
      _ => incoming.value.clone(),
    }
  }

  /// Upserts `incoming` into `target` by the `key` column. A row whose key is
  /// already present replaces that row in place; new keys are appended, so the
  /// order of first appearance is preserved.
  pub fn upsert_rows(target: &mut Vec<Row>, incoming: &[Row], key: &str) {
    for row in incoming {
      let row_key = row.get(key).map(canonical_key);
      let position = row_key
        .as_ref()
        .and_then(|k| target.iter().position(|r| r.get(key).map(canonical_key).as_ref() == Some(k)));
      match position {
        Some(idx) => target[idx] = row.clone(),
        None => target.push(row.clone()),
      }
    }
  }

  fn append_files(target: &mut Vec<StagedFileRef>, incoming: &[StagedFileRef]) {
    for file in incoming {
      if !target.iter().any(|f| f.file_id == file.file_id) {
        target.push(file.clone());
      }
    }
  }
}

// `5` and `"5"` identify the same row.
fn canonical_key(value: &Value) -> String {
  id_key(value).unwrap_or_else(|| value.to_string())
}

/// File ids referenced anywhere in the flattened data, in order.
pub fn referenced_file_ids(flat: &FlattenedData) -> Vec<&str> {
  flat
    .values()
    .filter_map(|v| match v {
      FieldValue::Files(files) => Some(files),
      _ => None,
    })
    .flatten()
    .map(|f| f.file_id.as_str())
    .collect()
}
