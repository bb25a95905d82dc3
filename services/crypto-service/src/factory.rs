//! Wires a validated configuration into ready services.

use crate::audit::{AuditLogger, TracingAuditLogger};
use crate::config::CryptoServiceConfig;
use crate::encryption::EncryptionService;
use crate::error::CryptoError;
use crate::file::FileEncryptionService;
use crate::keys::{FileKeyStore, InMemoryKeyStore, KeyService, KeyStore};
use crate::signature::SignatureService;
use rust_common::{CacheClient, CacheClientConfig, KeyCacheHelper, RemoteCache};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

/// Assembled services sharing one cache and one audit sink.
#[derive(Debug, Clone)]
pub struct CryptoCore {
    /// Key lifecycle
    pub key_service: Arc<KeyService>,
    /// Envelope file encryption
    pub file_service: Arc<FileEncryptionService>,
    /// Data encryption by key id
    pub encryption_service: Arc<EncryptionService>,
    /// Signing and verification by key id
    pub signature_service: Arc<SignatureService>,
    /// Shared cache client
    pub cache: Arc<CacheClient>,
}

/// Builds [`CryptoCore`] instances.
#[derive(Default)]
pub struct CryptoCoreFactory {
    remote_cache: Option<Arc<dyn RemoteCache>>,
    audit: Option<Arc<dyn AuditLogger>>,
}

impl std::fmt::Debug for CryptoCoreFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoCoreFactory")
            .field("remote_cache", &self.remote_cache.is_some())
            .field("audit", &self.audit.is_some())
            .finish()
    }
}

impl CryptoCoreFactory {
    /// Factory with a local-only cache and a tracing audit sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a remote cache tier.
    #[must_use]
    pub fn with_remote_cache(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.remote_cache = Some(remote);
        self
    }

    /// Use a specific audit sink.
    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Validate `config` and build the services.
    ///
    /// Uses a [`FileKeyStore`] when `key_store_path` is set, otherwise an
    /// [`InMemoryKeyStore`].
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an invalid configuration, `Io` if the key store
    /// directory cannot be created.
    pub async fn create(self, config: &CryptoServiceConfig) -> Result<CryptoCore, CryptoError> {
        config
            .validate()
            .map_err(|e| CryptoError::invalid_input(format!("invalid configuration: {e}")))?;
        let master_key = config
            .master_key
            .as_deref()
            .copied()
            .ok_or_else(|| CryptoError::invalid_input("master key is not configured"))?;

        let store: Arc<dyn KeyStore> = match &config.key_store_path {
            Some(path) => Arc::new(FileKeyStore::open(path).await?),
            None => Arc::new(InMemoryKeyStore::new()),
        };

        let cache_config = CacheClientConfig::default()
            .with_namespace(config.cache_namespace.clone())
            .with_default_ttl(config.cache_default_ttl)
            .with_local_cache_size(config.cache_local_size)
            .with_local_fallback(config.cache_local_fallback)
            .with_remote_timeout(config.cache_remote_timeout)
            .with_encryption_key(cache_encryption_key(&master_key));
        let cache = Arc::new(match self.remote_cache {
            Some(remote) => CacheClient::with_remote(cache_config, remote)?,
            None => CacheClient::new(cache_config)?,
        });

        let audit: Arc<dyn AuditLogger> = match self.audit {
            Some(audit) => audit,
            None => Arc::new(TracingAuditLogger),
        };
        let key_service = Arc::new(
            KeyService::new(
                store,
                KeyCacheHelper::new(Arc::clone(&cache), config.key_cache_ttl),
                Arc::clone(&audit),
                master_key,
            )
            .with_key_validity(config.key_validity)
            .with_metadata_cache_ttl(config.metadata_cache_ttl),
        );
        let encryption_service = Arc::new(EncryptionService::new(Arc::clone(&key_service), Arc::clone(&audit)));
        let signature_service = Arc::new(SignatureService::new(Arc::clone(&key_service), Arc::clone(&audit)));
        let file_service = Arc::new(FileEncryptionService::new(
            Arc::clone(&key_service),
            audit,
            config,
        ));

        info!(
            namespace = %config.cache_namespace,
            persistent = config.key_store_path.is_some(),
            "Crypto core initialized"
        );
        Ok(CryptoCore {
            key_service,
            file_service,
            encryption_service,
            signature_service,
            cache,
        })
    }
}

/// Cached values are sealed under a key derived from, not equal to, the master key.
fn cache_encryption_key(master_key: &[u8; 32]) -> [u8; 32] {
    Sha256::new()
        .chain_update(b"crypto-service/cache")
        .chain_update(master_key)
        .finalize()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLogger;
    use crate::keys::{CallerContext, KeyAlgorithm};
    use rust_common::InMemoryRemoteCache;

    fn config() -> CryptoServiceConfig {
        CryptoServiceConfig::default().with_master_key([3u8; 32])
    }

    #[tokio::test]
    async fn test_create_in_memory() {
        let audit = Arc::new(InMemoryAuditLogger::new());
        let core = CryptoCoreFactory::new()
            .with_audit_logger(audit.clone())
            .create(&config())
            .await
            .unwrap();

        let ctx = CallerContext::new("tester", "unit-tests");
        let id = core
            .key_service
            .generate_key("payments", KeyAlgorithm::Aes256Gcm, "billing", None, &ctx)
            .await
            .unwrap();
        assert!(core.key_service.can_encrypt(&id).await.unwrap());
        assert_eq!(core.cache.namespace(), "crypto");
        assert_eq!(audit.entries().len(), 1);

        let sealed = core.encryption_service.encrypt(b"wired", &id, None, &ctx).await.unwrap();
        assert_eq!(core.encryption_service.decrypt(&sealed, None, &ctx).await.unwrap(), b"wired");
        assert_eq!(audit.entries().len(), 3);
    }

    #[tokio::test]
    async fn test_create_requires_master_key() {
        let result = CryptoCoreFactory::new().create(&CryptoServiceConfig::default()).await;
        assert!(matches!(result, Err(CryptoError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_create_with_file_store_and_remote() {
        let dir = tempfile::tempdir().unwrap();
        let remote = InMemoryRemoteCache::new();
        let cfg = config().with_key_store_path(dir.path());

        let ctx = CallerContext::new("tester", "unit-tests");
        let id = {
            let core = CryptoCoreFactory::new()
                .with_remote_cache(Arc::new(remote.clone()))
                .create(&cfg)
                .await
                .unwrap();
            core.key_service
                .generate_key("payments", KeyAlgorithm::Aes128Gcm, "billing", None, &ctx)
                .await
                .unwrap()
        };
        assert!(!remote.is_empty());

        // A second core over the same directory sees the persisted key
        let core = CryptoCoreFactory::new().create(&cfg).await.unwrap();
        let material = core.key_service.get_key_material(&id).await.unwrap();
        assert_eq!(material.len(), 16);
    }

    #[test]
    fn test_cache_key_differs_from_master() {
        let master = [3u8; 32];
        assert_ne!(cache_encryption_key(&master), master);
    }
}
