//! Remote tier of the cache client.
//!
//! The production tier is the platform cache service reached over the network;
//! `InMemoryRemoteCache` stands in for it in tests and single-process setups and
//! can be switched off to exercise the local fallback path.

use crate::PlatformError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared remote cache tier.
///
/// Keys are already namespaced by the caller. `get` returns `Ok(None)` for a
/// miss; errors are reserved for the tier itself being unhealthy.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Fetch a value together with its remaining TTL.
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, Duration)>, PlatformError>;

    /// Store a value with a TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), PlatformError>;

    /// Remove a value. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), PlatformError>;
}

struct RemoteEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process remote tier.
///
/// Clones share storage and the availability switch, so several clients can
/// talk to "the same" cache service.
#[derive(Clone)]
pub struct InMemoryRemoteCache {
    entries: Arc<RwLock<HashMap<String, RemoteEntry>>>,
    available: Arc<AtomicBool>,
    latency: Option<Duration>,
}

impl Default for InMemoryRemoteCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteCache {
    /// Create an empty, available remote tier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            latency: None,
        }
    }

    /// Delay every call by `latency` before answering.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Mark the tier reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Whether the tier currently answers.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Number of live entries, ignoring availability.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Whether no live entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn check(&self) -> Result<(), PlatformError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.is_available() {
            Ok(())
        } else {
            Err(PlatformError::unavailable("remote cache unreachable"))
        }
    }
}

#[async_trait]
impl RemoteCache for InMemoryRemoteCache {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, Duration)>, PlatformError> {
        self.check().await?;
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                Ok(Some((entry.value.clone(), entry.expires_at - now)))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), PlatformError> {
        self.check().await?;
        self.entries.write().insert(
            key.to_string(),
            RemoteEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PlatformError> {
        self.check().await?;
        self.entries.write().remove(key);
        Ok(())
    }
}
