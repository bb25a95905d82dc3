//! Key lifecycle: generation, lookup, rotation and deletion.
//!
//! State only moves forward: `Active -> Deprecated -> Deleted`. Material is
//! sealed under the master key before it reaches the store and is cached
//! through [`KeyCacheHelper`] on the way out.

use super::store::KeyStore;
use super::types::{
    CallerContext, KeyAlgorithm, KeyId, KeyMaterial, KeyMetadata, KeyOperation, KeyRecord,
    KeyState, SealedMaterial,
};
use crate::audit::{AuditEntry, AuditLogger, AuditOperation};
use crate::engine;
use crate::error::CryptoError;
use crate::metrics::OperationTimer;
use chrono::Utc;
use parking_lot::Mutex;
use rust_common::KeyCacheHelper;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

/// Per-key lock registry. Locks for distinct ids never contend.
///
/// An entry lives only while some call holds or waits for it, so lookups of
/// unknown or retired ids leave nothing behind.
#[derive(Debug, Default)]
struct KeyLocks {
    locks: Mutex<HashMap<KeyId, Arc<RwLock<()>>>>,
}

impl KeyLocks {
    fn entry(&self, id: &KeyId) -> Arc<RwLock<()>> {
        Arc::clone(self.locks.lock().entry(id.clone()).or_default())
    }

    async fn read(&self, id: &KeyId) -> KeyLockGuard<'_, OwnedRwLockReadGuard<()>> {
        let guard = self.entry(id).read_owned().await;
        KeyLockGuard {
            registry: self,
            id: id.clone(),
            guard: Some(guard),
        }
    }

    async fn write(&self, id: &KeyId) -> KeyLockGuard<'_, OwnedRwLockWriteGuard<()>> {
        let guard = self.entry(id).write_owned().await;
        KeyLockGuard {
            registry: self,
            id: id.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// A held per-key lock. Dropping it prunes the registry entry once idle.
struct KeyLockGuard<'a, G> {
    registry: &'a KeyLocks,
    id: KeyId,
    guard: Option<G>,
}

impl<G> Drop for KeyLockGuard<'_, G> {
    fn drop(&mut self) {
        let mut locks = self.registry.locks.lock();
        // release under the map mutex so the count below sees every holder
        self.guard = None;
        if locks.get(&self.id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.id);
        }
    }
}

/// Key lifecycle service.
pub struct KeyService {
    store: Arc<dyn KeyStore>,
    cache: KeyCacheHelper,
    audit: Arc<dyn AuditLogger>,
    master_key: Zeroizing<[u8; 32]>,
    key_validity: chrono::Duration,
    metadata_cache_ttl: Duration,
    locks: KeyLocks,
}

impl std::fmt::Debug for KeyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyService")
            .field("key_validity", &self.key_validity)
            .field("metadata_cache_ttl", &self.metadata_cache_ttl)
            .finish_non_exhaustive()
    }
}

impl KeyService {
    /// Create a key service sealing material under `master_key`.
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyStore>,
        cache: KeyCacheHelper,
        audit: Arc<dyn AuditLogger>,
        master_key: [u8; 32],
    ) -> Self {
        Self {
            store,
            cache,
            audit,
            master_key: Zeroizing::new(master_key),
            key_validity: chrono::Duration::days(365),
            metadata_cache_ttl: Duration::from_secs(30),
            locks: KeyLocks::default(),
        }
    }

    /// Set the validity period of new keys.
    #[must_use]
    pub const fn with_key_validity(mut self, validity: chrono::Duration) -> Self {
        self.key_validity = validity;
        self
    }

    /// Set the metadata cache TTL used by [`Self::can_encrypt`] and [`Self::can_decrypt`].
    #[must_use]
    pub const fn with_metadata_cache_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_cache_ttl = ttl;
        self
    }

    /// Generate a new active key and return only its id.
    ///
    /// `allowed_operations` defaults to the algorithm's operations.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a bad namespace or an empty operation list.
    #[instrument(name = "key.generate", skip(self, allowed_operations, ctx), fields(algorithm = %algorithm))]
    pub async fn generate_key(
        &self,
        namespace: &str,
        algorithm: KeyAlgorithm,
        owner_service: &str,
        allowed_operations: Option<Vec<KeyOperation>>,
        ctx: &CallerContext,
    ) -> Result<KeyId, CryptoError> {
        let timer = OperationTimer::start("key.generate");
        let result = self
            .generate_inner(namespace, algorithm, owner_service, allowed_operations)
            .await;
        timer.finish(&result);

        let entry = AuditEntry::new(AuditOperation::KeyGenerate, result.as_ref().ok(), ctx, &result)
            .with_metadata("namespace", namespace)
            .with_metadata("algorithm", algorithm);
        self.audit.log_operation(entry).await;
        result
    }

    /// Generate a key from an algorithm name such as `AES_256_GCM`.
    ///
    /// # Errors
    ///
    /// `InvalidAlgorithm` for an unknown name, otherwise as [`Self::generate_key`].
    pub async fn generate_key_named(
        &self,
        namespace: &str,
        algorithm: &str,
        owner_service: &str,
        allowed_operations: Option<Vec<KeyOperation>>,
        ctx: &CallerContext,
    ) -> Result<KeyId, CryptoError> {
        match algorithm.parse::<KeyAlgorithm>() {
            Ok(algorithm) => {
                self.generate_key(namespace, algorithm, owner_service, allowed_operations, ctx)
                    .await
            }
            Err(e) => {
                let result: Result<KeyId, CryptoError> = Err(e);
                let entry = AuditEntry::new(AuditOperation::KeyGenerate, None, ctx, &result)
                    .with_metadata("namespace", namespace)
                    .with_metadata("algorithm", algorithm);
                self.audit.log_operation(entry).await;
                result
            }
        }
    }

    async fn generate_inner(
        &self,
        namespace: &str,
        algorithm: KeyAlgorithm,
        owner_service: &str,
        allowed_operations: Option<Vec<KeyOperation>>,
    ) -> Result<KeyId, CryptoError> {
        let operations = match allowed_operations {
            Some(ops) if ops.is_empty() => {
                return Err(CryptoError::invalid_input("allowed operations must not be empty"))
            }
            Some(ops) => ops,
            None => algorithm.default_operations(),
        };
        let id = KeyId::generate(namespace)?;
        let material = generate_material(algorithm).await?;

        let metadata = KeyMetadata::new(id.clone(), algorithm, owner_service, operations, self.key_validity)?;
        let record = KeyRecord {
            metadata,
            material: Some(self.seal(&id, &material)?),
        };
        self.store.insert(record).await?;
        self.cache_material(&id, &material).await;

        info!(key_id = %id, algorithm = %algorithm, "Key generated");
        Ok(id)
    }

    /// Raw material of a key that has not been deleted.
    ///
    /// The store record is checked on every call, so a cached copy is never
    /// served for a deleted key.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` or `KeyDeleted`.
    #[instrument(name = "key.material", skip(self), fields(key_id = %id))]
    pub async fn get_key_material(&self, id: &KeyId) -> Result<KeyMaterial, CryptoError> {
        let timer = OperationTimer::start("key.material");
        let result = self.material_inner(id).await;
        timer.finish(&result);
        result
    }

    async fn material_inner(&self, id: &KeyId) -> Result<KeyMaterial, CryptoError> {
        let _lock = self.locks.read(id).await;

        let record = self.store.get(id).await?;
        let sealed = match (&record.metadata.state, &record.material) {
            (KeyState::Deleted, _) | (_, None) => return Err(CryptoError::KeyDeleted(id.to_string())),
            (_, Some(sealed)) => sealed,
        };

        match self.cache.get_key(&id.to_string()).await {
            Ok(Some(bytes)) => {
                debug!(key_id = %id, "Key material served from cache");
                return Ok(KeyMaterial::new(bytes));
            }
            Ok(None) => {}
            Err(e) => warn!(key_id = %id, error = %e, "Key cache read failed, unsealing from store"),
        }

        let material = self.unseal(id, sealed)?;
        self.cache_material(id, &material).await;
        Ok(material)
    }

    /// Metadata straight from the store.
    ///
    /// # Errors
    ///
    /// `KeyNotFound`.
    #[instrument(name = "key.metadata", skip(self), fields(key_id = %id))]
    pub async fn get_key_metadata(&self, id: &KeyId) -> Result<KeyMetadata, CryptoError> {
        let timer = OperationTimer::start("key.metadata");
        let result = async {
            let _lock = self.locks.read(id).await;
            Ok(self.store.get(id).await?.metadata)
        }
        .await;
        timer.finish(&result);
        result
    }

    /// Replace an active key with a new version and deprecate the old one.
    ///
    /// # Errors
    ///
    /// `KeyNotFound`, or `InvalidState` if the key is not active.
    #[instrument(name = "key.rotate", skip(self, ctx), fields(key_id = %old_id))]
    pub async fn rotate_key(&self, old_id: &KeyId, ctx: &CallerContext) -> Result<KeyId, CryptoError> {
        let timer = OperationTimer::start("key.rotate");
        let result = self.rotate_inner(old_id).await;
        timer.finish(&result);

        let mut entry = AuditEntry::new(AuditOperation::KeyRotate, Some(old_id), ctx, &result);
        if let Ok(new_id) = &result {
            entry = entry.with_metadata("new_key_id", new_id);
        }
        self.audit.log_operation(entry).await;
        result
    }

    async fn rotate_inner(&self, old_id: &KeyId) -> Result<KeyId, CryptoError> {
        let _lock = self.locks.write(old_id).await;

        let mut old = self.store.get(old_id).await?;
        if old.metadata.state != KeyState::Active {
            return Err(CryptoError::invalid_state(format!(
                "key {old_id} is {}, only ACTIVE keys can be rotated",
                old.metadata.state.as_str()
            )));
        }

        let algorithm = old.metadata.algorithm;
        let new_id = old_id.rotated()?;
        let material = generate_material(algorithm).await?;

        let mut metadata = KeyMetadata::new(
            new_id.clone(),
            algorithm,
            old.metadata.owner_service.clone(),
            old.metadata.allowed_operations.clone(),
            old.metadata.validity(),
        )?;
        metadata.rotated_at = Some(Utc::now());
        metadata.previous_version = Some(old_id.clone());

        self.store
            .insert(KeyRecord {
                metadata,
                material: Some(self.seal(&new_id, &material)?),
            })
            .await?;

        old.metadata.state = KeyState::Deprecated;
        if let Err(e) = self.store.put(old).await {
            if let Err(rollback) = self.store.delete(&new_id).await {
                warn!(key_id = %new_id, error = %rollback, "Rotation rollback failed");
            }
            return Err(e);
        }

        if let Err(e) = self.cache.invalidate_metadata(&old_id.to_string()).await {
            warn!(key_id = %old_id, error = %e, "Metadata cache invalidation failed");
        }
        self.cache_material(&new_id, &material).await;

        info!(old_key_id = %old_id, new_key_id = %new_id, "Key rotated");
        Ok(new_id)
    }

    /// Delete a key: tombstone it, purge caches, then purge the record.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` for an unknown or already purged key. `Unavailable` when
    /// the cache purge is not confirmed; the key then stays tombstoned and
    /// calling again finishes the purge.
    #[instrument(name = "key.delete", skip(self, ctx), fields(key_id = %id))]
    pub async fn delete_key(&self, id: &KeyId, ctx: &CallerContext) -> Result<(), CryptoError> {
        let timer = OperationTimer::start("key.delete");
        let result = self.delete_inner(id).await;
        timer.finish(&result);

        let entry = AuditEntry::new(AuditOperation::KeyDelete, Some(id), ctx, &result);
        self.audit.log_operation(entry).await;
        result
    }

    async fn delete_inner(&self, id: &KeyId) -> Result<(), CryptoError> {
        let _lock = self.locks.write(id).await;

        let mut record = self.store.get(id).await?;
        if record.metadata.state != KeyState::Deleted {
            record.metadata.state = KeyState::Deleted;
            record.material = None;
            self.store.put(record).await?;
        }

        let cache_key = id.to_string();
        if let Err(e) = self.cache.invalidate_key(&cache_key).await {
            warn!(key_id = %id, error = %e, "Key cache purge failed, key left tombstoned");
            return Err(e.into());
        }
        if let Err(e) = self.cache.invalidate_metadata(&cache_key).await {
            warn!(key_id = %id, error = %e, "Metadata cache purge failed, key left tombstoned");
            return Err(e.into());
        }

        self.store.delete(id).await?;

        info!(key_id = %id, "Key deleted");
        Ok(())
    }

    /// Whether the key may start new encryptions.
    ///
    /// # Errors
    ///
    /// `KeyNotFound`.
    pub async fn can_encrypt(&self, id: &KeyId) -> Result<bool, CryptoError> {
        Ok(self.cached_metadata(id).await?.can_encrypt())
    }

    /// Whether the key may decrypt.
    ///
    /// # Errors
    ///
    /// `KeyNotFound`.
    pub async fn can_decrypt(&self, id: &KeyId) -> Result<bool, CryptoError> {
        Ok(self.cached_metadata(id).await?.can_decrypt())
    }

    /// Metadata and material of a key that may perform `operation` now.
    ///
    /// Encrypt, sign and wrap need an ACTIVE key; decrypt, verify and unwrap
    /// also accept a DEPRECATED one. State comes from the store, not the
    /// metadata cache.
    ///
    /// # Errors
    ///
    /// `KeyNotFound`, `KeyDeleted`, `InvalidState` when the key's state rules
    /// out `operation`, `InvalidInput` when `operation` is not allowed for it.
    pub async fn key_for_operation(
        &self,
        id: &KeyId,
        operation: KeyOperation,
    ) -> Result<(KeyMetadata, KeyMaterial), CryptoError> {
        let metadata = self.get_key_metadata(id).await?;
        if metadata.state == KeyState::Deleted {
            return Err(CryptoError::KeyDeleted(id.to_string()));
        }
        let usable = if operation.requires_active() {
            metadata.can_encrypt()
        } else {
            metadata.can_decrypt()
        };
        if !usable {
            return Err(CryptoError::invalid_state(format!(
                "key {id} is {}, {operation} needs an ACTIVE key",
                metadata.state.as_str()
            )));
        }
        if !metadata.permits(operation) {
            return Err(CryptoError::invalid_input(format!(
                "key {id} does not permit {operation}"
            )));
        }

        let material = self.get_key_material(id).await?;
        Ok((metadata, material))
    }

    /// Ids in `namespace`; empty lists every key.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_keys(&self, namespace: &str) -> Result<Vec<KeyId>, CryptoError> {
        self.store.list_by_namespace(namespace).await
    }

    async fn cached_metadata(&self, id: &KeyId) -> Result<KeyMetadata, CryptoError> {
        let cache_key = id.to_string();
        match self.cache.get_metadata::<KeyMetadata>(&cache_key).await {
            Ok(Some(metadata)) => return Ok(metadata),
            Ok(None) => {}
            Err(e) => warn!(key_id = %id, error = %e, "Metadata cache read failed, using store"),
        }

        let metadata = self.get_key_metadata(id).await?;
        if let Err(e) = self
            .cache
            .cache_metadata(&cache_key, &metadata, self.metadata_cache_ttl)
            .await
        {
            warn!(key_id = %id, error = %e, "Metadata cache write failed");
        }
        Ok(metadata)
    }

    async fn cache_material(&self, id: &KeyId, material: &KeyMaterial) {
        if let Err(e) = self.cache.cache_key(&id.to_string(), material.expose()).await {
            warn!(key_id = %id, error = %e, "Key cache write failed");
        }
    }

    fn seal(&self, id: &KeyId, material: &KeyMaterial) -> Result<SealedMaterial, CryptoError> {
        let aad = id.to_string();
        let sealed = engine::aes::encrypt_gcm(self.master_key.as_slice(), material.expose(), Some(aad.as_bytes()))?;
        Ok(SealedMaterial {
            ciphertext: sealed.ciphertext,
            iv: sealed.iv,
            tag: sealed.tag,
        })
    }

    fn unseal(&self, id: &KeyId, sealed: &SealedMaterial) -> Result<KeyMaterial, CryptoError> {
        let aad = id.to_string();
        engine::aes::decrypt_gcm(
            self.master_key.as_slice(),
            &sealed.ciphertext,
            &sealed.iv,
            &sealed.tag,
            Some(aad.as_bytes()),
        )
        .map(KeyMaterial::new)
    }
}

/// Key generation can be slow (RSA), so it runs off the async workers.
async fn generate_material(algorithm: KeyAlgorithm) -> Result<KeyMaterial, CryptoError> {
    tokio::task::spawn_blocking(move || engine::generate_material(algorithm))
        .await
        .map_err(|e| CryptoError::internal(format!("key generation task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLogger;
    use crate::keys::store::InMemoryKeyStore;
    use rust_common::{CacheClient, CacheClientConfig, InMemoryRemoteCache};

    struct Fixture {
        service: KeyService,
        store: Arc<InMemoryKeyStore>,
        audit: Arc<InMemoryAuditLogger>,
        cache: Arc<CacheClient>,
    }

    fn fixture() -> Fixture {
        let cache = CacheClient::new(CacheClientConfig::default().with_namespace("crypto")).unwrap();
        fixture_with_cache(cache)
    }

    fn fixture_with_remote(remote: &InMemoryRemoteCache) -> Fixture {
        let config = CacheClientConfig::default().with_namespace("crypto");
        fixture_with_cache(CacheClient::with_remote(config, Arc::new(remote.clone())).unwrap())
    }

    fn fixture_with_cache(cache: CacheClient) -> Fixture {
        let store = Arc::new(InMemoryKeyStore::new());
        let audit = Arc::new(InMemoryAuditLogger::new());
        let cache = Arc::new(cache);
        let helper = KeyCacheHelper::new(Arc::clone(&cache), Duration::from_secs(60));
        let service = KeyService::new(store.clone(), helper, audit.clone(), [9u8; 32]);
        Fixture {
            service,
            store,
            audit,
            cache,
        }
    }

    fn ctx() -> CallerContext {
        CallerContext::new("tester", "unit-tests")
    }

    #[tokio::test]
    async fn test_generate_and_fetch() {
        let f = fixture();
        let id = f
            .service
            .generate_key("payments", KeyAlgorithm::Aes256Gcm, "billing", None, &ctx())
            .await
            .unwrap();

        assert_eq!(id.namespace(), "payments");
        assert_eq!(id.version(), 1);

        let material = f.service.get_key_material(&id).await.unwrap();
        assert_eq!(material.len(), 32);

        let meta = f.service.get_key_metadata(&id).await.unwrap();
        assert_eq!(meta.state, KeyState::Active);
        assert_eq!(meta.owner_service, "billing");
        assert!(meta.permits(KeyOperation::WrapKey));

        let audits = f.audit.entries_for(AuditOperation::KeyGenerate);
        assert_eq!(audits.len(), 1);
        assert!(audits[0].success);
    }

    #[tokio::test]
    async fn test_stored_material_is_sealed() {
        let f = fixture();
        let id = f
            .service
            .generate_key("payments", KeyAlgorithm::Aes256Gcm, "billing", None, &ctx())
            .await
            .unwrap();
        let material = f.service.get_key_material(&id).await.unwrap();

        let record = f.store.get(&id).await.unwrap();
        let sealed = record.material.unwrap();
        assert_ne!(sealed.ciphertext, material.expose());
        assert_eq!(sealed.iv.len(), 12);
        assert_eq!(sealed.tag.len(), 16);
    }

    #[tokio::test]
    async fn test_material_read_through_after_cache_clear() {
        let f = fixture();
        let id = f
            .service
            .generate_key("payments", KeyAlgorithm::Aes128Gcm, "billing", None, &ctx())
            .await
            .unwrap();
        let first = f.service.get_key_material(&id).await.unwrap();

        f.cache.clear_local_cache();
        let second = f.service.get_key_material(&id).await.unwrap();
        assert_eq!(first.expose(), second.expose());
        assert!(f.cache.exists(&format!("key:{id}")).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_algorithm_name() {
        let f = fixture();
        let err = f
            .service
            .generate_key_named("payments", "AES_512_GCM", "billing", None, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, CryptoError::InvalidAlgorithm(_)));

        let audits = f.audit.entries_for(AuditOperation::KeyGenerate);
        assert_eq!(audits[0].error_code.as_deref(), Some("INVALID_ALGORITHM"));
    }

    #[tokio::test]
    async fn test_invalid_namespace_and_operations() {
        let f = fixture();
        let err = f
            .service
            .generate_key("bad:ns", KeyAlgorithm::Aes256Gcm, "billing", None, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, CryptoError::InvalidInput(_)));

        let err = f
            .service
            .generate_key("payments", KeyAlgorithm::Aes256Gcm, "billing", Some(vec![]), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, CryptoError::InvalidInput(_)));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_rotate_deprecates_old_key() {
        let f = fixture();
        let old = f
            .service
            .generate_key(
                "payments",
                KeyAlgorithm::Aes256Gcm,
                "billing",
                Some(vec![KeyOperation::Encrypt, KeyOperation::Decrypt]),
                &ctx(),
            )
            .await
            .unwrap();
        let old_meta = f.service.get_key_metadata(&old).await.unwrap();

        let new = f.service.rotate_key(&old, &ctx()).await.unwrap();
        assert_ne!(new, old);
        assert_eq!(new.version(), 2);
        assert_eq!(new.namespace(), "payments");

        let old_after = f.service.get_key_metadata(&old).await.unwrap();
        assert_eq!(old_after.state, KeyState::Deprecated);

        let new_meta = f.service.get_key_metadata(&new).await.unwrap();
        assert_eq!(new_meta.state, KeyState::Active);
        assert_eq!(new_meta.previous_version.as_ref(), Some(&old));
        assert!(new_meta.rotated_at.is_some());
        assert_eq!(new_meta.allowed_operations, old_meta.allowed_operations);
        assert_eq!(new_meta.owner_service, "billing");
        assert_eq!(new_meta.validity(), old_meta.validity());

        // Deprecated material stays readable for decryption
        assert!(f.service.get_key_material(&old).await.is_ok());

        let err = f.service.rotate_key(&old, &ctx()).await.unwrap_err();
        assert!(matches!(err, CryptoError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_rotate_invalidates_cached_metadata() {
        let f = fixture();
        let id = f
            .service
            .generate_key("payments", KeyAlgorithm::Aes256Gcm, "billing", None, &ctx())
            .await
            .unwrap();
        assert!(f.service.can_encrypt(&id).await.unwrap());

        f.service.rotate_key(&id, &ctx()).await.unwrap();
        assert!(!f.service.can_encrypt(&id).await.unwrap());
        assert!(f.service.can_decrypt(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_rotations_single_winner() {
        let f = Arc::new(fixture());
        let id = f
            .service
            .generate_key("payments", KeyAlgorithm::Aes256Gcm, "billing", None, &ctx())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let f = Arc::clone(&f);
            let id = id.clone();
            handles.push(tokio::spawn(async move { f.service.rotate_key(&id, &ctx()).await }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, CryptoError::InvalidState(_))),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(f.service.list_keys("payments").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let f = fixture();
        let id = f
            .service
            .generate_key("payments", KeyAlgorithm::Aes256Gcm, "billing", None, &ctx())
            .await
            .unwrap();
        f.service.get_key_material(&id).await.unwrap();

        f.service.delete_key(&id, &ctx()).await.unwrap();

        assert!(matches!(
            f.service.get_key_metadata(&id).await,
            Err(CryptoError::KeyNotFound(_))
        ));
        assert!(matches!(
            f.service.get_key_material(&id).await,
            Err(CryptoError::KeyNotFound(_))
        ));
        assert!(!f.cache.exists(&format!("key:{id}")).await.unwrap());
        assert!(matches!(
            f.service.delete_key(&id, &ctx()).await,
            Err(CryptoError::KeyNotFound(_))
        ));

        let deletes = f.audit.entries_for(AuditOperation::KeyDelete);
        assert_eq!(deletes.len(), 2);
        assert!(deletes[0].success);
        assert_eq!(deletes[1].error_code.as_deref(), Some("KEY_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_tombstone_rejects_material() {
        let f = fixture();
        let id = f
            .service
            .generate_key("payments", KeyAlgorithm::Aes256Gcm, "billing", None, &ctx())
            .await
            .unwrap();
        f.cache.clear_local_cache();

        let mut record = f.store.get(&id).await.unwrap();
        record.metadata.state = KeyState::Deleted;
        record.material = None;
        f.store.put(record).await.unwrap();

        assert!(matches!(
            f.service.get_key_material(&id).await,
            Err(CryptoError::KeyDeleted(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_with_remote_cache_down() {
        let remote = InMemoryRemoteCache::new();
        let f = fixture_with_remote(&remote);
        let id = f
            .service
            .generate_key("payments", KeyAlgorithm::Aes256Gcm, "billing", None, &ctx())
            .await
            .unwrap();
        f.service.get_key_material(&id).await.unwrap();

        remote.set_available(false);
        let err = f.service.delete_key(&id, &ctx()).await.unwrap_err();
        assert!(matches!(err, CryptoError::Unavailable(_)));
        assert!(!f.audit.entries_for(AuditOperation::KeyDelete)[0].success);

        // The remote copy survived, yet the tombstone keeps it unreachable
        remote.set_available(true);
        assert!(!remote.is_empty());
        assert!(matches!(
            f.service.get_key_material(&id).await,
            Err(CryptoError::KeyDeleted(_))
        ));
        assert_eq!(
            f.service.get_key_metadata(&id).await.unwrap().state,
            KeyState::Deleted
        );

        f.service.delete_key(&id, &ctx()).await.unwrap();
        assert!(remote.is_empty());
        assert!(matches!(
            f.service.get_key_material(&id).await,
            Err(CryptoError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_registry_does_not_grow() {
        let f = fixture();
        for _ in 0..50 {
            let ghost = KeyId::generate("ghost").unwrap();
            assert!(f.service.get_key_metadata(&ghost).await.is_err());
            assert!(f.service.get_key_material(&ghost).await.is_err());
            assert!(f.service.can_encrypt(&ghost).await.is_err());
            assert!(f.service.rotate_key(&ghost, &ctx()).await.is_err());
        }
        assert_eq!(f.service.locks.len(), 0);

        let id = f
            .service
            .generate_key("payments", KeyAlgorithm::Aes256Gcm, "billing", None, &ctx())
            .await
            .unwrap();
        let next = f.service.rotate_key(&id, &ctx()).await.unwrap();
        f.service.get_key_material(&id).await.unwrap();
        f.service.get_key_material(&next).await.unwrap();
        f.service.delete_key(&id, &ctx()).await.unwrap();
        assert_eq!(f.service.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_key_for_operation_policy() {
        let f = fixture();
        let id = f
            .service
            .generate_key(
                "payments",
                KeyAlgorithm::Aes256Gcm,
                "billing",
                Some(vec![KeyOperation::Encrypt, KeyOperation::Decrypt]),
                &ctx(),
            )
            .await
            .unwrap();

        let (meta, material) = f
            .service
            .key_for_operation(&id, KeyOperation::Encrypt)
            .await
            .unwrap();
        assert_eq!(meta.id, id);
        assert_eq!(material.len(), 32);
        assert!(matches!(
            f.service.key_for_operation(&id, KeyOperation::WrapKey).await,
            Err(CryptoError::InvalidInput(_))
        ));

        f.service.rotate_key(&id, &ctx()).await.unwrap();
        assert!(matches!(
            f.service.key_for_operation(&id, KeyOperation::Encrypt).await,
            Err(CryptoError::InvalidState(_))
        ));
        assert!(f.service.key_for_operation(&id, KeyOperation::Decrypt).await.is_ok());

        f.service.delete_key(&id, &ctx()).await.unwrap();
        assert!(matches!(
            f.service.key_for_operation(&id, KeyOperation::Decrypt).await,
            Err(CryptoError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rotate_unknown_key() {
        let f = fixture();
        let id = KeyId::generate("payments").unwrap();
        assert!(matches!(
            f.service.rotate_key(&id, &ctx()).await,
            Err(CryptoError::KeyNotFound(_))
        ));
        let audits = f.audit.entries_for(AuditOperation::KeyRotate);
        assert_eq!(audits.len(), 1);
        assert!(!audits[0].success);
    }

    #[tokio::test]
    async fn test_ecdsa_key_generation() {
        let f = fixture();
        let id = f
            .service
            .generate_key("signing", KeyAlgorithm::EcdsaP256, "tokens", None, &ctx())
            .await
            .unwrap();
        let material = f.service.get_key_material(&id).await.unwrap();
        let signature = engine::ecdsa::sign(material.expose(), b"claims").unwrap();
        let public = engine::public_key(KeyAlgorithm::EcdsaP256, &material).unwrap().unwrap();
        assert!(engine::ecdsa::verify(&public, b"claims", &signature).unwrap());
    }
}
