//! Crypto service core.
//!
//! Key lifecycle management and streaming envelope file encryption:
//! keys are generated, cached, rotated and retired by [`KeyService`], and
//! [`FileEncryptionService`] encrypts arbitrarily large streams under a fresh
//! data key wrapped by a managed key. [`EncryptionService`] and
//! [`SignatureService`] use managed keys directly for small payloads.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod config;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod factory;
pub mod file;
pub mod keys;
pub mod metrics;
pub mod signature;

// Re-exports for convenience
pub use audit::{
    AuditEntry, AuditLogger, AuditOperation, InMemoryAuditLogger, LoggingServiceAuditLogger,
    TracingAuditLogger,
};
pub use config::{ConfigValidationError, CryptoServiceConfig};
pub use encryption::{EncryptedData, EncryptionService};
pub use error::{CryptoError, ErrorKind};
pub use factory::{CryptoCore, CryptoCoreFactory};
pub use file::{FileEncryptionHeader, FileEncryptionService, ProgressCallback};
pub use keys::{
    CallerContext, FileKeyStore, InMemoryKeyStore, KeyAlgorithm, KeyId, KeyMaterial, KeyMetadata,
    KeyOperation, KeyRecord, KeyService, KeyState, KeyStore, SealedMaterial,
};
pub use signature::{SignatureResult, SignatureScheme, SignatureService};
