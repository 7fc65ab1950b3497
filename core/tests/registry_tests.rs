// tests/registry_tests.rs
mod common;

use common::*;
use formstage::{
  EngineConfig, FieldKind, FieldRule, FormCatalog, FormError, FormRegistry, FormTypeDefinition, MergePolicy,
  StepDefinition, MAX_DURATION_SECS,
};

#[tokio::test]
async fn test_registry_resolves_registered_form_types() {
  setup_tracing();
  let mut registry = FormRegistry::new();
  registry.register(product_listing()).unwrap();
  registry
    .register(FormTypeDefinition::new(
      "seller_signup",
      900,
      vec![StepDefinition::new(1, "Profile").field(FieldRule::new("shop_name", FieldKind::string()).required())],
    ))
    .unwrap();

  assert_eq!(registry.len(), 2);
  let mut names: Vec<&str> = registry.form_types().collect();
  names.sort_unstable();
  assert_eq!(names, vec!["product_listing", "seller_signup"]);
  assert_eq!(registry.definition(LISTING).unwrap().total_steps, 3);
}

#[tokio::test]
async fn test_one_authoritative_definition_per_form_type() {
  setup_tracing();
  let mut registry = FormRegistry::new();
  registry.register(product_listing()).unwrap();

  let two_step_variant = FormTypeDefinition::new(
    LISTING,
    3600,
    vec![StepDefinition::new(1, "Details"), StepDefinition::new(2, "Images")],
  );
  let err = registry.register(two_step_variant).unwrap_err();
  assert!(matches!(err, FormError::Configuration { .. }));
  assert_eq!(registry.definition(LISTING).unwrap().total_steps, 3);
}

#[tokio::test]
async fn test_start_with_unknown_form_type() {
  let h = Harness::new();
  let err = h.orchestrator.start("gift_card", None).await.unwrap_err();
  assert!(matches!(err, FormError::UnknownFormType { ref form_type } if form_type == "gift_card"));
  assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_inconsistent_definitions_are_rejected_at_load() {
  setup_tracing();
  let bad_merge = FormTypeDefinition::new(
    "bad_merge",
    60,
    vec![StepDefinition::new(1, "Only").field(
      FieldRule::new("name", FieldKind::string()).with_merge(MergePolicy::AppendOnly),
    )],
  );
  assert!(FormRegistry::from_definitions(vec![bad_merge]).is_err());

  let zero_ttl = FormTypeDefinition::new("zero_ttl", 0, vec![StepDefinition::new(1, "Only")]);
  assert!(FormRegistry::from_definitions(vec![zero_ttl]).is_err());

  let mut wrong_total = FormTypeDefinition::new("wrong_total", 60, vec![StepDefinition::new(1, "Only")]);
  wrong_total.total_steps = 2;
  assert!(FormRegistry::from_definitions(vec![wrong_total]).is_err());
}

#[tokio::test]
async fn test_unrepresentable_durations_are_rejected_at_load() {
  setup_tracing();
  let huge_ttl = FormTypeDefinition::new("huge_ttl", u64::MAX, vec![StepDefinition::new(1, "Only")]);
  let err = FormRegistry::from_definitions(vec![huge_ttl]).unwrap_err();
  assert!(matches!(err, FormError::Configuration { ref form_type, .. } if form_type == "huge_ttl"));

  let mut huge_guest = FormTypeDefinition::new("huge_guest", 60, vec![StepDefinition::new(1, "Only")]);
  huge_guest.guest_ttl_secs = Some(MAX_DURATION_SECS + 1);
  assert!(FormRegistry::from_definitions(vec![huge_guest]).is_err());

  let at_limit = FormTypeDefinition::new("at_limit", MAX_DURATION_SECS, vec![StepDefinition::new(1, "Only")]);
  assert!(FormRegistry::from_definitions(vec![at_limit]).is_ok());

  for engine in [
    EngineConfig {
      finalize_lease_secs: u64::MAX,
      ..EngineConfig::default()
    },
    EngineConfig {
      finalize_lease_secs: 0,
      ..EngineConfig::default()
    },
    EngineConfig {
      completed_retention_secs: MAX_DURATION_SECS + 1,
      ..EngineConfig::default()
    },
  ] {
    let catalog = FormCatalog {
      engine,
      forms: vec![product_listing()],
    };
    let err = catalog.into_parts().unwrap_err();
    assert!(matches!(err, FormError::Configuration { ref form_type, .. } if form_type == "<engine>"));
  }
}

#[tokio::test]
async fn test_catalog_file_round_trip_into_engine() {
  setup_tracing();
  let catalog = FormCatalog {
    engine: EngineConfig {
      completed_retention_secs: 60,
      ..EngineConfig::default()
    },
    forms: vec![product_listing()],
  };
  let path = std::env::temp_dir().join(format!("formstage-catalog-{}.json", std::process::id()));
  std::fs::write(&path, serde_json::to_string_pretty(&catalog).unwrap()).unwrap();

  let (engine, registry) = FormCatalog::from_path(&path).unwrap().into_parts().unwrap();
  std::fs::remove_file(&path).ok();

  assert_eq!(engine.completed_retention_secs, 60);
  let definition = registry.definition(LISTING).unwrap();
  assert_eq!(definition.guest_ttl_secs, Some(600));
  assert_eq!(definition.step(2).unwrap().label, "Attributes");
}
