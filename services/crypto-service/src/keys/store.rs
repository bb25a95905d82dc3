//! Key record persistence.
//!
//! Stores hold sealed records and enforce no lifecycle rules; those belong to
//! the key service.

use super::types::{KeyId, KeyRecord};
use crate::error::CryptoError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Persistence for key records.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Insert or replace a record.
    async fn put(&self, record: KeyRecord) -> Result<(), CryptoError>;

    /// Insert a record whose id must not exist yet.
    async fn insert(&self, record: KeyRecord) -> Result<(), CryptoError>;

    /// Fetch a record.
    async fn get(&self, id: &KeyId) -> Result<KeyRecord, CryptoError>;

    /// Remove a record.
    async fn delete(&self, id: &KeyId) -> Result<(), CryptoError>;

    /// Ids in `namespace`, sorted; an empty namespace lists every id.
    async fn list_by_namespace(&self, namespace: &str) -> Result<Vec<KeyId>, CryptoError>;
}

fn already_exists(id: &KeyId) -> CryptoError {
    CryptoError::invalid_state(format!("key already exists: {id}"))
}

fn in_namespace(id: &KeyId, namespace: &str) -> bool {
    namespace.is_empty() || id.namespace() == namespace
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    records: RwLock<HashMap<KeyId, KeyRecord>>,
}

impl InMemoryKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn put(&self, record: KeyRecord) -> Result<(), CryptoError> {
        self.records.write().insert(record.id().clone(), record);
        Ok(())
    }

    async fn insert(&self, record: KeyRecord) -> Result<(), CryptoError> {
        let mut records = self.records.write();
        if records.contains_key(record.id()) {
            return Err(already_exists(record.id()));
        }
        records.insert(record.id().clone(), record);
        Ok(())
    }

    async fn get(&self, id: &KeyId) -> Result<KeyRecord, CryptoError> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CryptoError::key_not_found(id))
    }

    async fn delete(&self, id: &KeyId) -> Result<(), CryptoError> {
        self.records
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CryptoError::key_not_found(id))
    }

    async fn list_by_namespace(&self, namespace: &str) -> Result<Vec<KeyId>, CryptoError> {
        let mut ids: Vec<KeyId> = self
            .records
            .read()
            .keys()
            .filter(|id| in_namespace(id, namespace))
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// One JSON file per key under a directory.
///
/// File names are the key id with `:` replaced by `_`. Writes go to a
/// temporary file first and are renamed into place.
#[derive(Debug)]
pub struct FileKeyStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKeyStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// `Io` if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CryptoError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!(path = %root.display(), "Opened file key store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Store directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &KeyId) -> PathBuf {
        self.root
            .join(format!("{}.json", id.to_string().replace(':', "_")))
    }

    async fn write_atomic(&self, id: &KeyId, record: &KeyRecord) -> Result<(), CryptoError> {
        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn put(&self, record: KeyRecord) -> Result<(), CryptoError> {
        let _guard = self.write_lock.lock().await;
        self.write_atomic(record.id(), &record).await
    }

    async fn insert(&self, record: KeyRecord) -> Result<(), CryptoError> {
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(self.path_for(record.id())).await? {
            return Err(already_exists(record.id()));
        }
        self.write_atomic(record.id(), &record).await
    }

    async fn get(&self, id: &KeyId) -> Result<KeyRecord, CryptoError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == IoErrorKind::NotFound => Err(CryptoError::key_not_found(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &KeyId) -> Result<(), CryptoError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Err(CryptoError::key_not_found(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_by_namespace(&self, namespace: &str) -> Result<Vec<KeyId>, CryptoError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Ids are read from the record; `_` in file names is ambiguous
            let bytes = tokio::fs::read(&path).await?;
            let record: KeyRecord = serde_json::from_slice(&bytes)?;
            if in_namespace(record.id(), namespace) {
                ids.push(record.metadata.id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::types::{KeyAlgorithm, KeyMetadata, SealedMaterial};
    use chrono::Duration;

    fn record(namespace: &str) -> KeyRecord {
        let id = KeyId::generate(namespace).unwrap();
        KeyRecord {
            metadata: KeyMetadata::new(
                id,
                KeyAlgorithm::Aes256Gcm,
                "svc",
                KeyAlgorithm::Aes256Gcm.default_operations(),
                Duration::days(30),
            )
            .unwrap(),
            material: Some(SealedMaterial {
                ciphertext: vec![1; 32],
                iv: vec![2; 12],
                tag: vec![3; 16],
            }),
        }
    }

    async fn exercise(store: &dyn KeyStore) {
        let a = record("payments");
        let b = record("payments");
        let c = record("orders");

        store.insert(a.clone()).await.unwrap();
        store.insert(b.clone()).await.unwrap();
        store.insert(c.clone()).await.unwrap();

        assert!(matches!(store.insert(a.clone()).await, Err(CryptoError::InvalidState(_))));
        assert_eq!(store.get(a.id()).await.unwrap(), a);

        let mut updated = a.clone();
        updated.material = None;
        store.put(updated.clone()).await.unwrap();
        assert_eq!(store.get(a.id()).await.unwrap(), updated);

        let payments = store.list_by_namespace("payments").await.unwrap();
        let mut expected = vec![a.id().clone(), b.id().clone()];
        expected.sort();
        assert_eq!(payments, expected);
        assert_eq!(store.list_by_namespace("").await.unwrap().len(), 3);
        assert!(store.list_by_namespace("pay").await.unwrap().is_empty());

        store.delete(a.id()).await.unwrap();
        assert!(matches!(store.get(a.id()).await, Err(CryptoError::KeyNotFound(_))));
        assert!(matches!(store.delete(a.id()).await, Err(CryptoError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryKeyStore::new();
        exercise(&store).await;
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(dir.path().join("keys")).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_names_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record("payments");
        {
            let store = FileKeyStore::open(dir.path()).await.unwrap();
            store.insert(rec.clone()).await.unwrap();
        }

        let expected = dir
            .path()
            .join(format!("{}.json", rec.id().to_string().replace(':', "_")));
        assert!(expected.exists());

        let reopened = FileKeyStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get(rec.id()).await.unwrap(), rec);
    }
}
