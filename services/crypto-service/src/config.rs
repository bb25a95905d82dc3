//! Service configuration.

use crate::keys::KeyAlgorithm;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use zeroize::Zeroizing;

/// Smallest accepted body chunk.
pub const MIN_CHUNK_SIZE: usize = 1024;
/// Largest accepted body chunk.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Configuration for the crypto core.
#[derive(Clone)]
pub struct CryptoServiceConfig {
    /// Cache namespace for key isolation
    pub cache_namespace: String,
    /// Local cache tier capacity
    pub cache_local_size: usize,
    /// Default cache entry TTL
    pub cache_default_ttl: Duration,
    /// TTL for cached key material
    pub key_cache_ttl: Duration,
    /// TTL for cached key metadata
    pub metadata_cache_ttl: Duration,
    /// Serve from the local tier when the remote cache is down
    pub cache_local_fallback: bool,
    /// Bound on a single remote cache call
    pub cache_remote_timeout: Duration,
    /// Algorithm for new key-encryption keys
    pub default_kek_algorithm: KeyAlgorithm,
    /// Largest file accepted for encryption
    pub max_file_size: u64,
    /// Body chunk size for new encrypted files
    pub chunk_size: usize,
    /// Validity period of new keys
    pub key_validity: chrono::Duration,
    /// Key sealing stored key material
    pub master_key: Option<Zeroizing<[u8; 32]>>,
    /// Directory for the file-backed key store; in-memory when unset
    pub key_store_path: Option<PathBuf>,
}

impl fmt::Debug for CryptoServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoServiceConfig")
            .field("cache_namespace", &self.cache_namespace)
            .field("cache_local_size", &self.cache_local_size)
            .field("cache_default_ttl", &self.cache_default_ttl)
            .field("key_cache_ttl", &self.key_cache_ttl)
            .field("metadata_cache_ttl", &self.metadata_cache_ttl)
            .field("cache_local_fallback", &self.cache_local_fallback)
            .field("cache_remote_timeout", &self.cache_remote_timeout)
            .field("default_kek_algorithm", &self.default_kek_algorithm)
            .field("max_file_size", &self.max_file_size)
            .field("chunk_size", &self.chunk_size)
            .field("key_validity", &self.key_validity)
            .field("master_key", &self.master_key.as_ref().map(|_| "[REDACTED]"))
            .field("key_store_path", &self.key_store_path)
            .finish()
    }
}

impl Default for CryptoServiceConfig {
    fn default() -> Self {
        Self {
            cache_namespace: "crypto".to_string(),
            cache_local_size: 1000,
            cache_default_ttl: Duration::from_secs(300),
            key_cache_ttl: Duration::from_secs(300),
            metadata_cache_ttl: Duration::from_secs(30),
            cache_local_fallback: true,
            cache_remote_timeout: Duration::from_millis(500),
            default_kek_algorithm: KeyAlgorithm::Aes256Gcm,
            max_file_size: 1024 * 1024 * 1024,
            chunk_size: 64 * 1024,
            key_validity: chrono::Duration::days(365),
            master_key: None,
            key_store_path: None,
        }
    }
}

fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigValidationError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigValidationError::InvalidValue { var, value }),
        Err(_) => Ok(None),
    }
}

impl CryptoServiceConfig {
    /// Create config from environment variables, after loading `.env` if present.
    ///
    /// # Errors
    ///
    /// Returns an error for values that do not parse; call [`Self::validate`]
    /// for the semantic checks.
    pub fn from_env() -> Result<Self, ConfigValidationError> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(ns) = std::env::var("CRYPTO_CACHE_NAMESPACE") {
            config.cache_namespace = ns;
        }
        if let Some(size) = env_parse("CRYPTO_CACHE_LOCAL_SIZE")? {
            config.cache_local_size = size;
        }
        if let Some(secs) = env_parse("CRYPTO_CACHE_DEFAULT_TTL_SECS")? {
            config.cache_default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("CRYPTO_KEY_CACHE_TTL_SECS")? {
            config.key_cache_ttl = Duration::from_secs(secs);
        }
        if let Some(enabled) = env_parse("CRYPTO_CACHE_LOCAL_FALLBACK")? {
            config.cache_local_fallback = enabled;
        }
        if let Some(ms) = env_parse("CRYPTO_CACHE_REMOTE_TIMEOUT_MS")? {
            config.cache_remote_timeout = Duration::from_millis(ms);
        }
        if let Ok(name) = std::env::var("CRYPTO_DEFAULT_KEK_ALGORITHM") {
            config.default_kek_algorithm = name.parse().map_err(|_| {
                ConfigValidationError::InvalidValue {
                    var: "CRYPTO_DEFAULT_KEK_ALGORITHM",
                    value: name,
                }
            })?;
        }
        if let Some(size) = env_parse("CRYPTO_MAX_FILE_SIZE")? {
            config.max_file_size = size;
        }
        if let Some(size) = env_parse("CRYPTO_CHUNK_SIZE")? {
            config.chunk_size = size;
        }
        if let Some(days) = env_parse("CRYPTO_KEY_VALIDITY_DAYS")? {
            config.key_validity = chrono::Duration::days(days);
        }
        if let Ok(encoded) = std::env::var("CRYPTO_MASTER_KEY") {
            config.master_key = STANDARD
                .decode(encoded.trim())
                .ok()
                .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
                .map(Zeroizing::new);
        }
        if let Ok(path) = std::env::var("CRYPTO_KEY_STORE_PATH") {
            if !path.is_empty() {
                config.key_store_path = Some(PathBuf::from(path));
            }
        }

        Ok(config)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns the first rule the configuration breaks.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.cache_namespace.is_empty() {
            return Err(ConfigValidationError::MissingNamespace);
        }
        if self.cache_namespace.contains(rust_common::NAMESPACE_DELIMITER) {
            return Err(ConfigValidationError::InvalidNamespace(self.cache_namespace.clone()));
        }
        if self.cache_local_fallback && self.cache_local_size == 0 {
            return Err(ConfigValidationError::InvalidLocalCacheSize);
        }
        for (name, ttl) in [
            ("CRYPTO_CACHE_DEFAULT_TTL_SECS", self.cache_default_ttl),
            ("CRYPTO_KEY_CACHE_TTL_SECS", self.key_cache_ttl),
            ("metadata cache TTL", self.metadata_cache_ttl),
            ("CRYPTO_CACHE_REMOTE_TIMEOUT_MS", self.cache_remote_timeout),
        ] {
            if ttl.is_zero() {
                return Err(ConfigValidationError::ZeroDuration(name));
            }
        }
        if !self.default_kek_algorithm.is_gcm() {
            return Err(ConfigValidationError::InvalidKekAlgorithm(
                self.default_kek_algorithm,
            ));
        }
        if self.max_file_size == 0 {
            return Err(ConfigValidationError::InvalidMaxFileSize);
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ConfigValidationError::InvalidChunkSize(self.chunk_size));
        }
        if self.key_validity <= chrono::Duration::zero() {
            return Err(ConfigValidationError::InvalidKeyValidity);
        }
        if self.master_key.is_none() {
            return Err(ConfigValidationError::MissingMasterKey);
        }
        Ok(())
    }

    /// Set cache namespace.
    #[must_use]
    pub fn with_cache_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.cache_namespace = namespace.into();
        self
    }

    /// Set local cache capacity.
    #[must_use]
    pub const fn with_cache_local_size(mut self, size: usize) -> Self {
        self.cache_local_size = size;
        self
    }

    /// Set local fallback.
    #[must_use]
    pub const fn with_cache_local_fallback(mut self, enabled: bool) -> Self {
        self.cache_local_fallback = enabled;
        self
    }

    /// Set metadata cache TTL.
    #[must_use]
    pub const fn with_metadata_cache_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_cache_ttl = ttl;
        self
    }

    /// Set default KEK algorithm.
    #[must_use]
    pub const fn with_default_kek_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.default_kek_algorithm = algorithm;
        self
    }

    /// Set maximum file size.
    #[must_use]
    pub const fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Set chunk size.
    #[must_use]
    pub const fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set key validity period.
    #[must_use]
    pub const fn with_key_validity(mut self, validity: chrono::Duration) -> Self {
        self.key_validity = validity;
        self
    }

    /// Set master key.
    #[must_use]
    pub fn with_master_key(mut self, key: [u8; 32]) -> Self {
        self.master_key = Some(Zeroizing::new(key));
        self
    }

    /// Use a file-backed key store under `path`.
    #[must_use]
    pub fn with_key_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_store_path = Some(path.into());
        self
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    /// Empty namespace
    #[error("CRYPTO_CACHE_NAMESPACE is required")]
    MissingNamespace,

    /// Namespace containing the cache key delimiter
    #[error("CRYPTO_CACHE_NAMESPACE must not contain ':', got {0}")]
    InvalidNamespace(String),

    /// Fallback without a local tier
    #[error("CRYPTO_CACHE_LOCAL_SIZE must be greater than 0 when local fallback is enabled")]
    InvalidLocalCacheSize,

    /// A TTL or timeout of zero
    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),

    /// KEKs must be AES-GCM
    #[error("CRYPTO_DEFAULT_KEK_ALGORITHM must be AES_128_GCM or AES_256_GCM, got {0}")]
    InvalidKekAlgorithm(KeyAlgorithm),

    /// Zero maximum file size
    #[error("CRYPTO_MAX_FILE_SIZE must be greater than 0")]
    InvalidMaxFileSize,

    /// Chunk size out of range
    #[error("CRYPTO_CHUNK_SIZE must be between 1024 and 16777216 bytes, got {0}")]
    InvalidChunkSize(usize),

    /// Non-positive key validity
    #[error("CRYPTO_KEY_VALIDITY_DAYS must be greater than 0")]
    InvalidKeyValidity,

    /// Master key absent or not 32 bytes
    #[error("CRYPTO_MASTER_KEY must be a base64-encoded 32-byte key")]
    MissingMasterKey,

    /// Unparsable environment value
    #[error("{var} has an invalid value: {value}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },
}
