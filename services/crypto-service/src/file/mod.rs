//! Envelope file encryption.

pub mod header;
pub mod service;

pub use header::FileEncryptionHeader;
pub use service::{FileEncryptionService, ProgressCallback};
