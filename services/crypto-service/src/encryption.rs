//! Data encryption under managed keys.
//!
//! Callers name a key instead of handling material. Each call checks the
//! key's state and allowed operations through the key service, runs the AES
//! primitive and records one audit entry.

use crate::audit::{AuditEntry, AuditLogger, AuditOperation};
use crate::engine::aes;
use crate::error::CryptoError;
use crate::keys::{CallerContext, KeyAlgorithm, KeyId, KeyOperation, KeyService};
use crate::metrics::OperationTimer;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Ciphertext produced under a managed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    /// Ciphertext
    pub ciphertext: Vec<u8>,
    /// GCM nonce or CBC IV
    pub iv: Vec<u8>,
    /// GCM tag; empty for CBC
    pub tag: Vec<u8>,
    /// Key that produced the ciphertext
    pub key_id: KeyId,
    /// Algorithm of that key
    pub algorithm: KeyAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Gcm,
    Cbc,
}

impl Mode {
    const fn accepts(self, algorithm: KeyAlgorithm) -> bool {
        match self {
            Self::Gcm => algorithm.is_gcm(),
            Self::Cbc => algorithm.is_symmetric() && !algorithm.is_gcm(),
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Gcm => "GCM",
            Self::Cbc => "CBC",
        }
    }
}

/// Encrypts and decrypts data by key id.
pub struct EncryptionService {
    keys: Arc<KeyService>,
    audit: Arc<dyn AuditLogger>,
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService").finish_non_exhaustive()
    }
}

impl EncryptionService {
    /// Create a service over `keys`, auditing to `audit`.
    #[must_use]
    pub fn new(keys: Arc<KeyService>, audit: Arc<dyn AuditLogger>) -> Self {
        Self { keys, audit }
    }

    /// AES-GCM encrypt `plaintext` under `key_id`, binding the optional `aad`.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` / `KeyDeleted`, `InvalidState` for a key that is not
    /// active, `InvalidInput` when the key does not permit `ENCRYPT`,
    /// `InvalidAlgorithm` for a key that is not AES-GCM, `SizeLimitExceeded`
    /// from the primitive.
    #[instrument(name = "data.encrypt", skip_all, fields(key_id = %key_id, size = plaintext.len()))]
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        key_id: &KeyId,
        aad: Option<&[u8]>,
        ctx: &CallerContext,
    ) -> Result<EncryptedData, CryptoError> {
        self.audited(
            AuditOperation::Encrypt,
            Mode::Gcm,
            key_id,
            ctx,
            self.encrypt_inner(plaintext, key_id, aad, Mode::Gcm),
        )
        .await
    }

    /// Decrypt the output of [`Self::encrypt`]. Deprecated keys still decrypt.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` / `KeyDeleted`, `InvalidInput` when the key does not
    /// permit `DECRYPT`, `InvalidAlgorithm` for a key that is not AES-GCM,
    /// `IntegrityError` for a tampered ciphertext, IV, tag or AAD.
    #[instrument(name = "data.decrypt", skip_all, fields(key_id = %sealed.key_id))]
    pub async fn decrypt(
        &self,
        sealed: &EncryptedData,
        aad: Option<&[u8]>,
        ctx: &CallerContext,
    ) -> Result<Vec<u8>, CryptoError> {
        self.audited(
            AuditOperation::Decrypt,
            Mode::Gcm,
            &sealed.key_id,
            ctx,
            self.decrypt_inner(sealed, aad, Mode::Gcm),
        )
        .await
    }

    /// AES-CBC encrypt `plaintext` under `key_id`.
    ///
    /// # Errors
    ///
    /// As [`Self::encrypt`], with `InvalidAlgorithm` for a key that is not AES-CBC.
    #[instrument(name = "data.encrypt", skip_all, fields(key_id = %key_id, size = plaintext.len()))]
    pub async fn encrypt_cbc(
        &self,
        plaintext: &[u8],
        key_id: &KeyId,
        ctx: &CallerContext,
    ) -> Result<EncryptedData, CryptoError> {
        self.audited(
            AuditOperation::Encrypt,
            Mode::Cbc,
            key_id,
            ctx,
            self.encrypt_inner(plaintext, key_id, None, Mode::Cbc),
        )
        .await
    }

    /// Decrypt the output of [`Self::encrypt_cbc`].
    ///
    /// # Errors
    ///
    /// As [`Self::decrypt`]; bad padding also reports `IntegrityError`.
    #[instrument(name = "data.decrypt", skip_all, fields(key_id = %sealed.key_id))]
    pub async fn decrypt_cbc(
        &self,
        sealed: &EncryptedData,
        ctx: &CallerContext,
    ) -> Result<Vec<u8>, CryptoError> {
        self.audited(
            AuditOperation::Decrypt,
            Mode::Cbc,
            &sealed.key_id,
            ctx,
            self.decrypt_inner(sealed, None, Mode::Cbc),
        )
        .await
    }

    /// Generate a fresh AES-256-GCM key in `namespace` and encrypt under it.
    ///
    /// # Errors
    ///
    /// As [`KeyService::generate_key`] and [`Self::encrypt`].
    pub async fn encrypt_with_new_key(
        &self,
        plaintext: &[u8],
        namespace: &str,
        owner_service: &str,
        ctx: &CallerContext,
    ) -> Result<EncryptedData, CryptoError> {
        let key_id = self
            .keys
            .generate_key(namespace, KeyAlgorithm::Aes256Gcm, owner_service, None, ctx)
            .await?;
        self.encrypt(plaintext, &key_id, None, ctx).await
    }

    async fn encrypt_inner(
        &self,
        plaintext: &[u8],
        key_id: &KeyId,
        aad: Option<&[u8]>,
        mode: Mode,
    ) -> Result<EncryptedData, CryptoError> {
        let (metadata, material) = self.keys.key_for_operation(key_id, KeyOperation::Encrypt).await?;
        check_mode(key_id, metadata.algorithm, mode)?;

        let (ciphertext, iv, tag) = match mode {
            Mode::Gcm => {
                let sealed = aes::encrypt_gcm(material.expose(), plaintext, aad)?;
                (sealed.ciphertext, sealed.iv, sealed.tag)
            }
            Mode::Cbc => {
                let sealed = aes::encrypt_cbc(material.expose(), plaintext)?;
                (sealed.ciphertext, sealed.iv, Vec::new())
            }
        };
        debug!(key_id = %key_id, mode = mode.as_str(), "Data encrypted");
        Ok(EncryptedData {
            ciphertext,
            iv,
            tag,
            key_id: key_id.clone(),
            algorithm: metadata.algorithm,
        })
    }

    async fn decrypt_inner(
        &self,
        sealed: &EncryptedData,
        aad: Option<&[u8]>,
        mode: Mode,
    ) -> Result<Vec<u8>, CryptoError> {
        let (metadata, material) = self
            .keys
            .key_for_operation(&sealed.key_id, KeyOperation::Decrypt)
            .await?;
        check_mode(&sealed.key_id, metadata.algorithm, mode)?;

        match mode {
            Mode::Gcm => aes::decrypt_gcm(material.expose(), &sealed.ciphertext, &sealed.iv, &sealed.tag, aad),
            Mode::Cbc => aes::decrypt_cbc(material.expose(), &sealed.ciphertext, &sealed.iv),
        }
    }

    async fn audited<T, F>(
        &self,
        operation: AuditOperation,
        mode: Mode,
        key_id: &KeyId,
        ctx: &CallerContext,
        call: F,
    ) -> Result<T, CryptoError>
    where
        F: Future<Output = Result<T, CryptoError>>,
    {
        let timer = OperationTimer::start(match operation {
            AuditOperation::Decrypt => "data.decrypt",
            _ => "data.encrypt",
        });
        let result = call.await;
        timer.finish(&result);

        let entry = AuditEntry::new(operation, Some(key_id), ctx, &result).with_metadata("mode", mode.as_str());
        self.audit.log_operation(entry).await;
        result
    }
}

fn check_mode(key_id: &KeyId, algorithm: KeyAlgorithm, mode: Mode) -> Result<(), CryptoError> {
    if mode.accepts(algorithm) {
        Ok(())
    } else {
        Err(CryptoError::InvalidAlgorithm(format!(
            "key {key_id} is {algorithm}, AES-{} required",
            mode.as_str()
        )))
    }
}
