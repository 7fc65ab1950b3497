// tests/submission_flow_tests.rs
mod common;

use common::*;
use formstage::{FieldErrorCode, FieldValue, FormError, FormEvent, OwnerRef, SessionStatus, StepOutcome};
use serde_json::json;

#[tokio::test]
async fn test_full_submission_creates_exactly_one_resource() {
  let h = Harness::new();
  let owner = seller();
  let session_id = h.session_at_final_step(Some(owner.clone())).await;
  let front = h.stage_image(&session_id, Some(&owner), "front.png").await;
  let back = h.stage_image(&session_id, Some(&owner), "back.JPG").await;

  let outcome = h
    .submit(&session_id, Some(&owner), 3, images_payload(&[&front, &back]))
    .await
    .expect("final step accepted");

  let StepOutcome::Completed { entity_ref, session } = outcome else {
    panic!("expected completion, got {:?}", outcome);
  };
  assert_eq!(entity_ref.to_string(), "product:prod-1");
  assert_eq!(session.status, SessionStatus::Completed);
  assert_eq!(session.current_step, 3);
  assert!(session.data.is_empty());
  assert_eq!(session.entity_ref.as_ref(), Some(&entity_ref));

  assert_eq!(h.events.count("resource_created"), 1);
  assert_eq!(h.persistence.created_count(), 1);

  // Staged copies are gone, permanent copies exist.
  assert!(!h.blobs.contains_staged(&front.storage_ref));
  assert!(!h.blobs.contains_staged(&back.storage_ref));
  assert_eq!(h.blobs.permanent_count(), 2);
}

#[tokio::test]
async fn test_resource_created_carries_resolved_labels() {
  let h = Harness::new();
  let session_id = h.session_at_final_step(None).await;
  let image = h.stage_image(&session_id, None, "front.png").await;
  h.submit(&session_id, None, 3, images_payload(&[&image])).await.unwrap();

  let created = h.events.named("resource_created");
  let FormEvent::ResourceCreated {
    fields,
    labels,
    rows,
    files,
    owner,
    ..
  } = &created[0]
  else {
    panic!("expected ResourceCreated");
  };
  assert_eq!(fields["name"], json!("Trail Runner"));
  assert_eq!(fields["price"], json!(89.9));
  assert_eq!(labels["category_id"], "Footwear");
  assert!(owner.is_none());

  let attributes = &rows["attributes"];
  assert_eq!(attributes.len(), 2);
  assert_eq!(attributes[0].labels["attribute_id"], "Color");
  assert_eq!(attributes[1].labels["attribute_id"], "Size");
  assert_eq!(files.len(), 1);
  assert_eq!(files[0].original_name, "front.png");
  assert!(h.blobs.contains_permanent(&files[0].permanent_ref));
}

#[tokio::test]
async fn test_step_two_before_step_one_is_out_of_order() {
  let h = Harness::new();
  let session_id = h.start(None).await;

  let err = h.submit(&session_id, None, 2, attributes_payload()).await.unwrap_err();
  assert!(matches!(
    err,
    FormError::OutOfOrderStep {
      expected: 1,
      submitted: 2,
      ..
    }
  ));
  assert!(err.is_retryable());
  assert_eq!(h.store.snapshot(&session_id).unwrap().current_step, 0);
}

#[tokio::test]
async fn test_completed_step_cannot_be_resubmitted() {
  let h = Harness::new();
  let session_id = h.start(None).await;
  h.submit(&session_id, None, 1, details_payload()).await.unwrap();

  let err = h
    .submit(&session_id, None, 1, json!({ "name": "Other", "price": 1, "category_id": 2 }))
    .await
    .unwrap_err();
  assert!(matches!(err, FormError::OutOfOrderStep { expected: 2, .. }));

  let stored = h.store.snapshot(&session_id).unwrap();
  assert_eq!(stored.current_step, 1);
  assert_eq!(
    stored.data[&1]["name"].value,
    FieldValue::Scalar(json!("Trail Runner")),
    "the first accepted values are kept"
  );
}

#[tokio::test]
async fn test_unknown_step_number() {
  let h = Harness::new();
  let session_id = h.start(None).await;
  let err = h.submit(&session_id, None, 4, json!({})).await.unwrap_err();
  assert!(matches!(err, FormError::UnknownStep { step: 4, .. }));
}

#[tokio::test]
async fn test_invalid_step_leaves_session_unchanged_and_reports_every_error() {
  let h = Harness::new();
  let session_id = h.start(None).await;
  let raw = json!({ "name": "X", "price": "cheap", "category_id": 404, "colour": "red" });

  let err = h.submit(&session_id, None, 1, raw.clone()).await.unwrap_err();
  let codes: Vec<FieldErrorCode> = err.field_errors().iter().map(|e| e.code).collect();
  assert_eq!(
    codes,
    vec![
      FieldErrorCode::MinLength,
      FieldErrorCode::Type,
      FieldErrorCode::NotFound,
      FieldErrorCode::UnknownField
    ]
  );

  let stored = h.store.snapshot(&session_id).unwrap();
  assert_eq!(stored.current_step, 0);
  assert!(stored.data.is_empty());
  assert_eq!(stored.version, 1, "a rejected step writes nothing");

  let failed = h.events.named("validation_failed");
  assert_eq!(failed.len(), 1);
  match &failed[0] {
    FormEvent::ValidationFailed {
      step,
      raw_payload,
      errors,
      ..
    } => {
      assert_eq!(*step, 1);
      assert_eq!(raw_payload, &raw);
      assert_eq!(errors.len(), 4);
    }
    other => panic!("unexpected event {:?}", other),
  }

  // The same step can be retried.
  let outcome = h.submit(&session_id, None, 1, details_payload()).await.unwrap();
  assert!(matches!(outcome, StepOutcome::Advanced { next_step: 2, .. }));
}

#[tokio::test]
async fn test_duplicate_attribute_rows_collapse_to_last_selection() {
  let h = Harness::new();
  let session_id = h.start(None).await;
  h.submit(&session_id, None, 1, details_payload()).await.unwrap();
  h.submit(
    &session_id,
    None,
    2,
    json!({ "attributes": [
      { "attribute_id": 5, "value_id": 1 },
      { "attribute_id": 5, "value_id": 2 }
    ]}),
  )
  .await
  .unwrap();

  let stored = h.store.snapshot(&session_id).unwrap();
  let FieldValue::Rows(rows) = &stored.data[&2]["attributes"].value else {
    panic!("expected rows");
  };
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0]["value_id"], json!(2));
}

#[tokio::test]
async fn test_current_step_is_monotonic_and_bounded() {
  let h = Harness::new();
  let session_id = h.start(None).await;
  let mut seen = vec![h.store.snapshot(&session_id).unwrap().current_step];

  h.submit(&session_id, None, 1, details_payload()).await.unwrap();
  seen.push(h.store.snapshot(&session_id).unwrap().current_step);
  let _ = h.submit(&session_id, None, 3, json!({})).await;
  seen.push(h.store.snapshot(&session_id).unwrap().current_step);
  h.submit(&session_id, None, 2, attributes_payload()).await.unwrap();
  seen.push(h.store.snapshot(&session_id).unwrap().current_step);
  let image = h.stage_image(&session_id, None, "a.png").await;
  h.submit(&session_id, None, 3, images_payload(&[&image])).await.unwrap();
  seen.push(h.store.snapshot(&session_id).unwrap().current_step);

  assert_eq!(seen, vec![0, 1, 1, 2, 3]);
}

#[tokio::test]
async fn test_closed_session_answers_with_entity_ref() {
  let h = Harness::new();
  let session_id = h.session_at_final_step(None).await;
  let image = h.stage_image(&session_id, None, "a.png").await;
  let payload = images_payload(&[&image]);
  h.submit(&session_id, None, 3, payload.clone()).await.unwrap();

  let err = h.submit(&session_id, None, 3, payload).await.unwrap_err();
  match err {
    FormError::SessionClosed {
      status, entity_ref, ..
    } => {
      assert_eq!(status, SessionStatus::Completed);
      assert_eq!(entity_ref.unwrap().id, "prod-1");
    }
    other => panic!("expected SessionClosed, got {:?}", other),
  }
  assert_eq!(h.events.count("resource_created"), 1);
}

#[tokio::test]
async fn test_owned_session_rejects_other_callers() {
  let h = Harness::new();
  let owner = seller();
  let session_id = h.start(Some(owner.clone())).await;

  let intruder = OwnerRef::new("seller-2");
  let err = h.submit(&session_id, Some(&intruder), 1, details_payload()).await.unwrap_err();
  assert!(matches!(err, FormError::NotOwner { .. }));
  let err = h.submit(&session_id, None, 1, details_payload()).await.unwrap_err();
  assert!(matches!(err, FormError::NotOwner { .. }));

  h.submit(&session_id, Some(&owner), 1, details_payload()).await.unwrap();
}

#[tokio::test]
async fn test_abandon_releases_staged_files_and_closes_session() {
  let h = Harness::new();
  let session_id = h.session_at_final_step(None).await;
  let image = h.stage_image(&session_id, None, "a.png").await;

  h.orchestrator.abandon(&session_id, None).await.unwrap();

  assert!(!h.blobs.contains_staged(&image.storage_ref));
  let stored = h.store.snapshot(&session_id).unwrap();
  assert_eq!(stored.status, SessionStatus::Abandoned);
  assert!(stored.staged_files.is_empty());
  assert_eq!(h.events.count("session_abandoned"), 1);

  let err = h.submit(&session_id, None, 3, images_payload(&[&image])).await.unwrap_err();
  assert!(matches!(
    err,
    FormError::SessionClosed {
      status: SessionStatus::Abandoned,
      ..
    }
  ));
  assert!(err.requires_new_session());
}

#[tokio::test]
async fn test_images_can_be_uploaded_incrementally() {
  let h = Harness::new();
  let session_id = h.session_at_final_step(None).await;
  let a = h.stage_image(&session_id, None, "a.png").await;
  let b = h.stage_image(&session_id, None, "b.png").await;
  let c = h.stage_image(&session_id, None, "c.png").await;

  h.orchestrator.discard_file(&session_id, None, &c.file_id).await.unwrap();
  assert!(!h.blobs.contains_staged(&c.storage_ref));

  let err = h.submit(&session_id, None, 3, images_payload(&[&a, &c])).await.unwrap_err();
  assert_eq!(err.field_errors()[0].code, FieldErrorCode::FileNotStaged);

  h.submit(&session_id, None, 3, images_payload(&[&a, &b])).await.unwrap();
  assert_eq!(h.blobs.permanent_count(), 2);
}

#[tokio::test]
async fn test_uploads_only_go_to_the_current_step_file_fields() {
  let h = Harness::new();
  let session_id = h.start(None).await;

  let err = h
    .orchestrator
    .stage_file(&session_id, None, 3, "images", "a.png", vec![1])
    .await
    .unwrap_err();
  assert!(matches!(err, FormError::OutOfOrderStep { .. }));

  let err = h
    .orchestrator
    .stage_file(&session_id, None, 1, "name", "a.png", vec![1])
    .await
    .unwrap_err();
  assert_eq!(err.field_errors()[0].code, FieldErrorCode::UnknownField);
  assert_eq!(h.blobs.staged_count(), 0);
}

#[tokio::test]
async fn test_progress_describes_the_next_page() {
  let h = Harness::new();
  let session_id = h.start(None).await;
  h.submit(&session_id, None, 1, details_payload()).await.unwrap();

  let progress = h.orchestrator.progress(&session_id, None).await.unwrap();
  assert_eq!(progress.current_step, 1);
  assert_eq!(progress.total_steps, 3);
  let next = progress.next_step.unwrap();
  assert_eq!(next.step, 2);
  assert_eq!(next.label, "Attributes");
  assert!(progress.expires_at.is_some());
}

#[tokio::test]
async fn test_client_supplied_session_id() {
  let h = Harness::new();
  let id = formstage::SessionId::parse("listing-draft-0001").unwrap();
  let session = h.orchestrator.start_with_id(LISTING, None, id.clone()).await.unwrap();
  assert_eq!(session.session_id, id);

  let err = h.orchestrator.start_with_id(LISTING, None, id).await.unwrap_err();
  assert!(matches!(err, FormError::Conflict { .. }));
}
