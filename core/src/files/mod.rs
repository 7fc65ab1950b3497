// formstage/src/files/mod.rs

//! Staging of uploaded assets ahead of finalization.

pub mod blob;
pub mod stager;

pub use blob::{BlobMetadata, BlobStore, InMemoryBlobStore, PermanentRef, StorageError, StorageRef};
pub use stager::{content_hash, FileStager, PromotedFile};
