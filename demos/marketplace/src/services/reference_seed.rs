// demos/marketplace/src/services/reference_seed.rs

use formstage::StaticReferenceData;

/// Categories, attributes and countries the demo forms reference.
pub fn seed_reference_data() -> StaticReferenceData {
  StaticReferenceData::new()
    .with("category", 1, "Footwear")
    .with("category", 2, "Outdoor")
    .with("category", 3, "Home & Kitchen")
    .with("attribute", 5, "Color")
    .with("attribute", 6, "Size")
    .with("attribute", 7, "Material")
    .with("attribute_value", 101, "Red")
    .with("attribute_value", 102, "Black")
    .with("attribute_value", 201, "EU 42")
    .with("attribute_value", 202, "EU 43")
    .with("attribute_value", 301, "Leather")
    .with("country", "DE", "Germany")
    .with("country", "NL", "Netherlands")
    .with("country", "US", "United States")
}
