//! Key model, persistence and lifecycle.

pub mod service;
pub mod store;
pub mod types;

pub use service::KeyService;
pub use store::{FileKeyStore, InMemoryKeyStore, KeyStore};
pub use types::{
    CallerContext, KeyAlgorithm, KeyId, KeyMaterial, KeyMetadata, KeyOperation, KeyRecord, KeyState,
    SealedMaterial,
};
