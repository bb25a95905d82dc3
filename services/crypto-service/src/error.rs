//! Error types for key management and file encryption.

use rust_common::PlatformError;
use thiserror::Error;

/// Coarse error classification shared with callers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied something unusable
    InvalidInput,
    /// Key does not exist
    NotFound,
    /// Key exists but its lifecycle state forbids the operation
    InvalidState,
    /// Authentication tag or signature check failed
    Integrity,
    /// Encrypted file header could not be parsed
    CorruptHeader,
    /// A dependency is unreachable
    Unavailable,
    /// Anything else
    Internal,
}

/// Errors from crypto service operations.
///
/// Display strings never include key material or plaintext; integrity failures
/// stay deliberately vague.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Malformed or out-of-range input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Input larger than the operation allows
    #[error("Size limit exceeded: {what} is {actual} bytes, limit is {limit}")]
    SizeLimitExceeded {
        /// What was measured
        what: &'static str,
        /// Observed size
        actual: u64,
        /// Allowed maximum
        limit: u64,
    },

    /// Unknown or unsuitable algorithm
    #[error("Invalid algorithm: {0}")]
    InvalidAlgorithm(String),

    /// Key does not exist
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Key has been deleted and rejects material access
    #[error("Key deleted: {0}")]
    KeyDeleted(String),

    /// Key state forbids the operation
    #[error("Invalid key state: {0}")]
    InvalidState(String),

    /// Authentication failed
    #[error("decryption operation failed")]
    IntegrityError,

    /// Encrypted file header is malformed
    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    /// A dependency is unavailable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Stream or filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CryptoError {
    /// Stable error code for audit records and metrics.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::SizeLimitExceeded { .. } => "SIZE_LIMIT_EXCEEDED",
            Self::InvalidAlgorithm(_) => "INVALID_ALGORITHM",
            Self::KeyNotFound(_) => "KEY_NOT_FOUND",
            Self::KeyDeleted(_) => "KEY_DELETED",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::IntegrityError => "INTEGRITY_ERROR",
            Self::CorruptHeader(_) => "CORRUPT_HEADER",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Coarse classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::SizeLimitExceeded { .. } | Self::InvalidAlgorithm(_) => {
                ErrorKind::InvalidInput
            }
            Self::KeyNotFound(_) => ErrorKind::NotFound,
            Self::KeyDeleted(_) | Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::IntegrityError => ErrorKind::Integrity,
            Self::CorruptHeader(_) => ErrorKind::CorruptHeader,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if the error is transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unavailable)
    }

    /// Create an invalid input error.
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a size limit error.
    #[must_use]
    pub const fn size_limit(what: &'static str, actual: u64, limit: u64) -> Self {
        Self::SizeLimitExceeded {
            what,
            actual,
            limit,
        }
    }

    /// Create a key not found error.
    #[must_use]
    pub fn key_not_found(key: impl ToString) -> Self {
        Self::KeyNotFound(key.to_string())
    }

    /// Create an invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a corrupt header error.
    #[must_use]
    pub fn corrupt_header(msg: impl Into<String>) -> Self {
        Self::CorruptHeader(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<PlatformError> for CryptoError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::NotFound(key) => Self::KeyNotFound(key),
            PlatformError::InvalidInput(msg) => Self::InvalidInput(msg),
            e if e.is_retryable() => Self::Unavailable(e.to_string()),
            e => Self::Internal(e.to_string()),
        }
    }
}
