// demos/marketplace/src/services/mod.rs

pub mod catalog_mock;
pub mod reference_seed;
