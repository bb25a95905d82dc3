//! Two-tier namespaced cache client.
//!
//! Reads and writes go to the shared remote tier first. When the remote
//! errors, times out or sits behind an open circuit, the client serves from a
//! bounded in-process LRU tier instead, provided local fallback is enabled.
//! Values can be sealed with AES-256-GCM before they leave the client.

use crate::metrics::CacheMetrics;
use crate::remote_cache::RemoteCache;
use crate::{CircuitBreaker, CircuitBreakerConfig, PlatformError};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

const NONCE_LEN: usize = 12;

/// Separates the namespace from the key in a physical key. Namespaces may not contain it.
pub const NAMESPACE_DELIMITER: char = ':';

/// Cache client configuration.
#[derive(Clone)]
pub struct CacheClientConfig {
    /// Namespace for key isolation
    pub namespace: String,
    /// Default TTL for cache entries
    pub default_ttl: Duration,
    /// Maximum local tier entries
    pub local_cache_size: usize,
    /// Serve from the local tier when the remote is unhealthy
    pub local_fallback_enabled: bool,
    /// Upper bound for a single remote call
    pub remote_timeout: Duration,
    /// Encryption key (32 bytes for AES-256)
    pub encryption_key: Option<[u8; 32]>,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
}

impl fmt::Debug for CacheClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClientConfig")
            .field("namespace", &self.namespace)
            .field("default_ttl", &self.default_ttl)
            .field("local_cache_size", &self.local_cache_size)
            .field("local_fallback_enabled", &self.local_fallback_enabled)
            .field("remote_timeout", &self.remote_timeout)
            .field(
                "encryption_key",
                &self.encryption_key.map(|_| "[REDACTED]"),
            )
            .field("circuit_breaker", &self.circuit_breaker)
            .finish()
    }
}

impl Default for CacheClientConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            default_ttl: Duration::from_secs(300),
            local_cache_size: 1000,
            local_fallback_enabled: true,
            remote_timeout: Duration::from_millis(500),
            encryption_key: None,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl CacheClientConfig {
    /// Create config with custom namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Create config with custom TTL.
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Create config with a custom local tier capacity.
    #[must_use]
    pub const fn with_local_cache_size(mut self, size: usize) -> Self {
        self.local_cache_size = size;
        self
    }

    /// Enable or disable the local fallback tier.
    #[must_use]
    pub const fn with_local_fallback(mut self, enabled: bool) -> Self {
        self.local_fallback_enabled = enabled;
        self
    }

    /// Create config with a custom remote call timeout.
    #[must_use]
    pub const fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Create config with encryption enabled.
    #[must_use]
    pub const fn with_encryption_key(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Create config with a custom circuit breaker.
    #[must_use]
    pub const fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }
}

struct LocalEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Bounded, TTL-aware local tier.
struct LocalTier {
    entries: Mutex<LruCache<String, LocalEntry>>,
}

impl LocalTier {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Live value and its remaining lifetime.
    fn get(&self, key: &str) -> Option<(Vec<u8>, Duration)> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                return Some((entry.value.clone(), entry.expires_at - now))
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    fn put(&self, key: String, value: Vec<u8>, ttl: Duration) -> usize {
        let mut entries = self.entries.lock();
        entries.put(
            key,
            LocalEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        entries.len()
    }

    fn remove(&self, key: &str) -> usize {
        let mut entries = self.entries.lock();
        entries.pop(key);
        entries.len()
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Outcome of a remote call after timeout and breaker handling.
enum RemoteOutcome<T> {
    Done(T),
    NoRemote,
    Failed(PlatformError),
}

/// Cache client with remote tier, local fallback and value encryption.
pub struct CacheClient {
    config: CacheClientConfig,
    remote: Option<Arc<dyn RemoteCache>>,
    circuit_breaker: CircuitBreaker,
    local: Option<LocalTier>,
    cipher: Option<Aes256Gcm>,
    metrics: CacheMetrics,
}

impl fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClient")
            .field("config", &self.config)
            .field("has_remote", &self.remote.is_some())
            .field("circuit_state", &self.circuit_breaker.state())
            .finish_non_exhaustive()
    }
}

impl CacheClient {
    /// Create a client backed only by the local tier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an empty namespace, a namespace containing
    /// [`NAMESPACE_DELIMITER`], or a zero local capacity.
    pub fn new(config: CacheClientConfig) -> Result<Self, PlatformError> {
        Self::build(config, None)
    }

    /// Create a client in front of a remote tier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an empty or delimiter-bearing namespace, or a
    /// zero local capacity while local fallback is enabled.
    pub fn with_remote(
        config: CacheClientConfig,
        remote: Arc<dyn RemoteCache>,
    ) -> Result<Self, PlatformError> {
        Self::build(config, Some(remote))
    }

    fn build(
        config: CacheClientConfig,
        remote: Option<Arc<dyn RemoteCache>>,
    ) -> Result<Self, PlatformError> {
        Self::check_namespace(&config.namespace)?;

        let needs_local = remote.is_none() || config.local_fallback_enabled;
        let local = if needs_local {
            let capacity = NonZeroUsize::new(config.local_cache_size).ok_or_else(|| {
                PlatformError::invalid_input("local cache size must be greater than zero")
            })?;
            Some(LocalTier::new(capacity))
        } else {
            None
        };

        let cipher = config.encryption_key.map(|key| Aes256Gcm::new(&key.into()));

        Ok(Self {
            circuit_breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            metrics: CacheMetrics::new(&config.namespace),
            remote,
            local,
            cipher,
            config,
        })
    }

    /// Get a value from the client's namespace.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` on a miss, `Unavailable` when the remote is down and
    /// no fallback is possible.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, PlatformError> {
        self.get_in(&self.config.namespace, key).await
    }

    /// Get a value from an explicit namespace.
    ///
    /// # Errors
    ///
    /// Same as [`CacheClient::get`].
    #[instrument(name = "cache.get", skip(self), level = "debug")]
    pub async fn get_in(&self, namespace: &str, key: &str) -> Result<Vec<u8>, PlatformError> {
        let physical = Self::physical_key(namespace, key)?;
        match self.fetch(&physical).await? {
            Some((sealed, _)) => self.decrypt(&sealed),
            None => Err(PlatformError::not_found(physical)),
        }
    }

    /// Store a value in the client's namespace.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` when the remote rejects the write and no fallback
    /// is possible.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), PlatformError> {
        self.set_in(&self.config.namespace, key, value, ttl).await
    }

    /// Store a value in an explicit namespace.
    ///
    /// # Errors
    ///
    /// Same as [`CacheClient::set`].
    #[instrument(name = "cache.set", skip(self, value), fields(len = value.len()), level = "debug")]
    pub async fn set_in(
        &self,
        namespace: &str,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), PlatformError> {
        let physical = Self::physical_key(namespace, key)?;
        let sealed = self.encrypt(value)?;
        self.store(physical, sealed, ttl.unwrap_or(self.config.default_ttl))
            .await
    }

    /// Delete a value from the client's namespace. Deleting an absent key succeeds.
    ///
    /// The local copy is always dropped. A delete the remote tier did not
    /// confirm is an error even with local fallback enabled, since the remote
    /// copy would otherwise reappear once the tier recovers.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable`, `Timeout` or `CircuitOpen` when the remote tier
    /// did not apply the delete.
    pub async fn delete(&self, key: &str) -> Result<(), PlatformError> {
        self.delete_in(&self.config.namespace, key).await
    }

    /// Delete a value from an explicit namespace.
    ///
    /// # Errors
    ///
    /// Same as [`CacheClient::delete`].
    #[instrument(name = "cache.delete", skip(self), level = "debug")]
    pub async fn delete_in(&self, namespace: &str, key: &str) -> Result<(), PlatformError> {
        let physical = Self::physical_key(namespace, key)?;
        self.remove(&physical).await
    }

    /// Check if a key exists in the client's namespace.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` when neither tier can answer.
    pub async fn exists(&self, key: &str) -> Result<bool, PlatformError> {
        self.exists_in(&self.config.namespace, key).await
    }

    /// Check if a key exists in an explicit namespace.
    ///
    /// # Errors
    ///
    /// Same as [`CacheClient::exists`].
    pub async fn exists_in(&self, namespace: &str, key: &str) -> Result<bool, PlatformError> {
        let physical = Self::physical_key(namespace, key)?;
        Ok(self.fetch(&physical).await?.is_some())
    }

    /// Fetch several keys at once. Only present keys appear in the result.
    ///
    /// # Errors
    ///
    /// Propagates tier failures; misses are never errors.
    pub async fn batch_get(&self, keys: &[&str]) -> Result<HashMap<String, Vec<u8>>, PlatformError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            match self.get(key).await {
                Ok(value) => {
                    found.insert((*key).to_string(), value);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Store several entries; either all become visible or none do.
    ///
    /// On a partial failure the entries written so far are restored to their
    /// previous values (or removed if they had none).
    ///
    /// # Errors
    ///
    /// Returns the first failure after rolling back.
    pub async fn batch_set(
        &self,
        entries: &[(&str, &[u8])],
        ttl: Option<Duration>,
    ) -> Result<(), PlatformError> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);

        // Validate and seal everything before touching either tier
        let mut sealed = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let physical = Self::physical_key(&self.config.namespace, key)?;
            sealed.push((physical, self.encrypt(value)?));
        }

        let mut written: Vec<(String, Option<(Vec<u8>, Duration)>)> = Vec::with_capacity(sealed.len());
        for (physical, value) in sealed {
            let previous = match self.fetch(&physical).await {
                Ok(previous) => previous,
                Err(e) => {
                    self.rollback(written).await;
                    return Err(e);
                }
            };
            if let Err(e) = self.store(physical.clone(), value, ttl).await {
                self.rollback(written).await;
                return Err(e);
            }
            written.push((physical, previous));
        }
        Ok(())
    }

    /// Drop every local tier entry and reset its hit/miss counters.
    pub fn clear_local_cache(&self) {
        if let Some(local) = &self.local {
            local.clear();
        }
        self.metrics.reset_local();
        debug!(namespace = %self.config.namespace, "Local cache cleared");
    }

    /// Get the namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Number of entries in the local tier.
    #[must_use]
    pub fn local_cache_size(&self) -> usize {
        self.local.as_ref().map_or(0, LocalTier::len)
    }

    /// Local hit/miss and remote failure accounting.
    #[must_use]
    pub const fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Circuit breaker guarding the remote tier.
    #[must_use]
    pub const fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    fn check_namespace(namespace: &str) -> Result<(), PlatformError> {
        if namespace.is_empty() {
            return Err(PlatformError::invalid_input("cache namespace must not be empty"));
        }
        if namespace.contains(NAMESPACE_DELIMITER) {
            return Err(PlatformError::invalid_input(format!(
                "cache namespace must not contain '{NAMESPACE_DELIMITER}'"
            )));
        }
        Ok(())
    }

    fn physical_key(namespace: &str, key: &str) -> Result<String, PlatformError> {
        Self::check_namespace(namespace)?;
        if key.is_empty() {
            return Err(PlatformError::invalid_input("cache key must not be empty"));
        }
        Ok(format!("{namespace}{NAMESPACE_DELIMITER}{key}"))
    }

    /// Sealed value and remaining lifetime.
    async fn fetch(&self, physical: &str) -> Result<Option<(Vec<u8>, Duration)>, PlatformError> {
        let outcome = match &self.remote {
            Some(remote) => self.call_remote(remote.get(physical)).await,
            None => RemoteOutcome::NoRemote,
        };

        match outcome {
            RemoteOutcome::Done(Some((value, remaining))) => {
                // the local copy never outlives the remote entry
                if let Some(local) = &self.local {
                    let size = local.put(physical.to_string(), value.clone(), remaining);
                    self.metrics.local_size.set(size as u64);
                }
                Ok(Some((value, remaining)))
            }
            RemoteOutcome::Done(None) => Ok(None),
            RemoteOutcome::NoRemote => Ok(self.local_get(physical)),
            RemoteOutcome::Failed(e) => {
                if self.config.local_fallback_enabled && self.local.is_some() {
                    Ok(self.local_get(physical))
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn store(&self, physical: String, sealed: Vec<u8>, ttl: Duration) -> Result<(), PlatformError> {
        let outcome = match &self.remote {
            Some(remote) => self.call_remote(remote.set(&physical, sealed.clone(), ttl)).await,
            None => RemoteOutcome::NoRemote,
        };

        if let RemoteOutcome::Failed(e) = outcome {
            if !self.config.local_fallback_enabled {
                return Err(e);
            }
        }

        if let Some(local) = &self.local {
            let size = local.put(physical, sealed, ttl);
            self.metrics.local_size.set(size as u64);
        }
        Ok(())
    }

    async fn remove(&self, physical: &str) -> Result<(), PlatformError> {
        if let Some(local) = &self.local {
            let size = local.remove(physical);
            self.metrics.local_size.set(size as u64);
        }

        let outcome = match &self.remote {
            Some(remote) => self.call_remote(remote.delete(physical)).await,
            None => RemoteOutcome::NoRemote,
        };

        match outcome {
            RemoteOutcome::Failed(e) => Err(e),
            RemoteOutcome::Done(()) | RemoteOutcome::NoRemote => Ok(()),
        }
    }

    async fn rollback(&self, written: Vec<(String, Option<(Vec<u8>, Duration)>)>) {
        for (physical, previous) in written.into_iter().rev() {
            let restored = match previous {
                Some((value, remaining)) => self.store(physical.clone(), value, remaining).await,
                None => self.remove(&physical).await,
            };
            if let Err(e) = restored {
                warn!(key = %physical, error = %e, "Batch rollback could not restore entry");
            }
        }
    }

    async fn call_remote<T, F>(&self, call: F) -> RemoteOutcome<T>
    where
        F: std::future::Future<Output = Result<T, PlatformError>>,
    {
        if !self.circuit_breaker.allow_request() {
            self.metrics.remote_failures.inc();
            return RemoteOutcome::Failed(PlatformError::circuit_open("cache-service"));
        }

        let result = match tokio::time::timeout(self.config.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout("remote cache call".to_string())),
        };

        match result {
            Ok(value) => {
                self.circuit_breaker.record_success();
                RemoteOutcome::Done(value)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                self.metrics.remote_failures.inc();
                warn!(error = %e, fallback = self.config.local_fallback_enabled, "Remote cache call failed");
                RemoteOutcome::Failed(e)
            }
        }
    }

    fn local_get(&self, physical: &str) -> Option<(Vec<u8>, Duration)> {
        let local = self.local.as_ref()?;
        let value = local.get(physical);
        if value.is_some() {
            self.metrics.local_hits.inc();
        } else {
            self.metrics.local_misses.inc();
        }
        value
    }

    /// Encrypt data using AES-GCM.
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, PlatformError> {
        let Some(cipher) = &self.cipher else {
            return Ok(data.to_vec());
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), data)
            .map_err(|e| PlatformError::encryption(e.to_string()))?;

        // nonce || ciphertext || tag
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    /// Decrypt data using AES-GCM.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, PlatformError> {
        let Some(cipher) = &self.cipher else {
            return Ok(data.to_vec());
        };

        if data.len() < NONCE_LEN {
            return Err(PlatformError::encryption("Data too short for decryption"));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| PlatformError::encryption(e.to_string()))
    }
}

/// Key-material and key-metadata caching on top of a [`CacheClient`].
#[derive(Debug, Clone)]
pub struct KeyCacheHelper {
    client: Arc<CacheClient>,
    ttl: Duration,
}

impl KeyCacheHelper {
    const KEY_PREFIX: &'static str = "key:";
    const META_PREFIX: &'static str = "meta:";

    /// Wrap a client; entries are written with `ttl`.
    #[must_use]
    pub const fn new(client: Arc<CacheClient>, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    /// Underlying client.
    #[must_use]
    pub fn client(&self) -> &CacheClient {
        &self.client
    }

    /// Cache key material under `key:{key_id}`.
    ///
    /// # Errors
    ///
    /// Propagates cache failures.
    pub async fn cache_key(&self, key_id: &str, material: &[u8]) -> Result<(), PlatformError> {
        self.client
            .set(&format!("{}{key_id}", Self::KEY_PREFIX), material, Some(self.ttl))
            .await
    }

    /// Cached key material, `None` on a miss.
    ///
    /// # Errors
    ///
    /// Propagates cache failures other than a miss.
    pub async fn get_key(&self, key_id: &str) -> Result<Option<Vec<u8>>, PlatformError> {
        Self::miss_as_none(
            self.client
                .get(&format!("{}{key_id}", Self::KEY_PREFIX))
                .await,
        )
    }

    /// Drop cached key material.
    ///
    /// # Errors
    ///
    /// Propagates cache failures.
    pub async fn invalidate_key(&self, key_id: &str) -> Result<(), PlatformError> {
        self.client
            .delete(&format!("{}{key_id}", Self::KEY_PREFIX))
            .await
    }

    /// Cache serialized metadata under `meta:{key_id}` for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the value cannot be encoded, or a cache failure.
    pub async fn cache_metadata<T: Serialize + Sync>(
        &self,
        key_id: &str,
        metadata: &T,
        ttl: Duration,
    ) -> Result<(), PlatformError> {
        let bytes = serde_json::to_vec(metadata)?;
        self.client
            .set(&format!("{}{key_id}", Self::META_PREFIX), &bytes, Some(ttl))
            .await
    }

    /// Cached metadata, `None` on a miss.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` for an undecodable entry, or a cache failure.
    pub async fn get_metadata<T: DeserializeOwned>(&self, key_id: &str) -> Result<Option<T>, PlatformError> {
        let bytes = Self::miss_as_none(
            self.client
                .get(&format!("{}{key_id}", Self::META_PREFIX))
                .await,
        )?;
        bytes
            .map(|b| serde_json::from_slice(&b).map_err(PlatformError::from))
            .transpose()
    }

    /// Drop cached metadata.
    ///
    /// # Errors
    ///
    /// Propagates cache failures.
    pub async fn invalidate_metadata(&self, key_id: &str) -> Result<(), PlatformError> {
        self.client
            .delete(&format!("{}{key_id}", Self::META_PREFIX))
            .await
    }

    fn miss_as_none(result: Result<Vec<u8>, PlatformError>) -> Result<Option<Vec<u8>>, PlatformError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
