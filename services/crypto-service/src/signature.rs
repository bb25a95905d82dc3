//! Digital signatures under managed keys.
//!
//! RSA keys sign with PSS over SHA-256 and P-256 keys with ECDSA. Signing
//! needs an active key; verification also accepts a deprecated one.

use crate::audit::{AuditEntry, AuditLogger, AuditOperation};
use crate::engine::{ecdsa, rsa};
use crate::error::CryptoError;
use crate::keys::{CallerContext, KeyAlgorithm, KeyId, KeyMaterial, KeyOperation, KeyService};
use crate::metrics::OperationTimer;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Signature scheme of a managed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureScheme {
    /// RSA-PSS with SHA-256
    RsaPss,
    /// ECDSA P-256 with SHA-256, DER encoded
    Ecdsa,
}

impl SignatureScheme {
    /// Scheme used by keys of `algorithm`, if it can sign.
    #[must_use]
    pub const fn for_algorithm(algorithm: KeyAlgorithm) -> Option<Self> {
        match algorithm {
            KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa3072 | KeyAlgorithm::Rsa4096 => Some(Self::RsaPss),
            KeyAlgorithm::EcdsaP256 => Some(Self::Ecdsa),
            _ => None,
        }
    }

    /// Canonical name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RsaPss => "RSA-PSS-SHA256",
            Self::Ecdsa => "ECDSA-P256-SHA256",
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signature and the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureResult {
    /// Signature bytes
    pub signature: Vec<u8>,
    /// Signing key
    pub key_id: KeyId,
    /// Scheme used
    pub scheme: SignatureScheme,
}

/// Signs and verifies data by key id.
pub struct SignatureService {
    keys: Arc<KeyService>,
    audit: Arc<dyn AuditLogger>,
}

impl fmt::Debug for SignatureService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureService").finish_non_exhaustive()
    }
}

impl SignatureService {
    /// Create a service over `keys`, auditing to `audit`.
    #[must_use]
    pub fn new(keys: Arc<KeyService>, audit: Arc<dyn AuditLogger>) -> Self {
        Self { keys, audit }
    }

    /// Sign `data` with the scheme of `key_id`'s algorithm.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` / `KeyDeleted`, `InvalidState` for a key that is not
    /// active, `InvalidInput` when the key does not permit `SIGN`,
    /// `InvalidAlgorithm` for a symmetric key, `SizeLimitExceeded` for
    /// oversized input.
    #[instrument(name = "data.sign", skip_all, fields(key_id = %key_id, size = data.len()))]
    pub async fn sign(&self, data: &[u8], key_id: &KeyId, ctx: &CallerContext) -> Result<SignatureResult, CryptoError> {
        self.sign_audited(data, key_id, None, ctx).await
    }

    /// Sign with RSA-PSS; the key must be RSA.
    ///
    /// # Errors
    ///
    /// As [`Self::sign`].
    pub async fn sign_rsa(&self, data: &[u8], key_id: &KeyId, ctx: &CallerContext) -> Result<SignatureResult, CryptoError> {
        self.sign_audited(data, key_id, Some(SignatureScheme::RsaPss), ctx).await
    }

    /// Sign with ECDSA; the key must be P-256.
    ///
    /// # Errors
    ///
    /// As [`Self::sign`].
    pub async fn sign_ecdsa(&self, data: &[u8], key_id: &KeyId, ctx: &CallerContext) -> Result<SignatureResult, CryptoError> {
        self.sign_audited(data, key_id, Some(SignatureScheme::Ecdsa), ctx).await
    }

    /// Check `signature` over `data`. A signature that does not match, or
    /// does not parse, is `Ok(false)`.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` / `KeyDeleted`, `InvalidInput` when the key does not
    /// permit `VERIFY`, `InvalidAlgorithm` for a symmetric key.
    #[instrument(name = "data.verify", skip_all, fields(key_id = %key_id, size = data.len()))]
    pub async fn verify(
        &self,
        data: &[u8],
        signature: &[u8],
        key_id: &KeyId,
        ctx: &CallerContext,
    ) -> Result<bool, CryptoError> {
        self.verify_audited(data, signature, key_id, None, ctx).await
    }

    /// Verify an RSA-PSS signature; the key must be RSA.
    ///
    /// # Errors
    ///
    /// As [`Self::verify`].
    pub async fn verify_rsa(
        &self,
        data: &[u8],
        signature: &[u8],
        key_id: &KeyId,
        ctx: &CallerContext,
    ) -> Result<bool, CryptoError> {
        self.verify_audited(data, signature, key_id, Some(SignatureScheme::RsaPss), ctx)
            .await
    }

    /// Verify an ECDSA signature; the key must be P-256.
    ///
    /// # Errors
    ///
    /// As [`Self::verify`].
    pub async fn verify_ecdsa(
        &self,
        data: &[u8],
        signature: &[u8],
        key_id: &KeyId,
        ctx: &CallerContext,
    ) -> Result<bool, CryptoError> {
        self.verify_audited(data, signature, key_id, Some(SignatureScheme::Ecdsa), ctx)
            .await
    }

    async fn sign_audited(
        &self,
        data: &[u8],
        key_id: &KeyId,
        expected: Option<SignatureScheme>,
        ctx: &CallerContext,
    ) -> Result<SignatureResult, CryptoError> {
        let timer = OperationTimer::start("data.sign");
        let result = self.sign_inner(data, key_id, expected).await;
        timer.finish(&result);

        let mut entry = AuditEntry::new(AuditOperation::Sign, Some(key_id), ctx, &result);
        if let Ok(signed) = &result {
            entry = entry.with_metadata("scheme", signed.scheme);
        }
        self.audit.log_operation(entry).await;
        result
    }

    async fn sign_inner(
        &self,
        data: &[u8],
        key_id: &KeyId,
        expected: Option<SignatureScheme>,
    ) -> Result<SignatureResult, CryptoError> {
        let (scheme, material) = self.resolve(key_id, KeyOperation::Sign, expected).await?;
        let signature = match scheme {
            SignatureScheme::RsaPss => rsa::sign_pss(&rsa::import_private_key(material.expose())?, data)?,
            SignatureScheme::Ecdsa => ecdsa::sign(material.expose(), data)?,
        };
        debug!(key_id = %key_id, scheme = %scheme, "Data signed");
        Ok(SignatureResult {
            signature,
            key_id: key_id.clone(),
            scheme,
        })
    }

    async fn verify_audited(
        &self,
        data: &[u8],
        signature: &[u8],
        key_id: &KeyId,
        expected: Option<SignatureScheme>,
        ctx: &CallerContext,
    ) -> Result<bool, CryptoError> {
        let timer = OperationTimer::start("data.verify");
        let result = self.verify_inner(data, signature, key_id, expected).await;
        timer.finish(&result);

        let mut entry = AuditEntry::new(AuditOperation::Verify, Some(key_id), ctx, &result);
        if let Ok(valid) = &result {
            entry = entry.with_metadata("valid", valid);
        }
        self.audit.log_operation(entry).await;
        result
    }

    async fn verify_inner(
        &self,
        data: &[u8],
        signature: &[u8],
        key_id: &KeyId,
        expected: Option<SignatureScheme>,
    ) -> Result<bool, CryptoError> {
        let (scheme, material) = self.resolve(key_id, KeyOperation::Verify, expected).await?;
        match scheme {
            SignatureScheme::RsaPss => {
                let public = rsa::import_public_key(&rsa::public_key_der(material.expose())?)?;
                rsa::verify_pss(&public, data, signature)
            }
            SignatureScheme::Ecdsa => ecdsa::verify(&ecdsa::public_key(material.expose())?, data, signature),
        }
    }

    async fn resolve(
        &self,
        key_id: &KeyId,
        operation: KeyOperation,
        expected: Option<SignatureScheme>,
    ) -> Result<(SignatureScheme, KeyMaterial), CryptoError> {
        let (metadata, material) = self.keys.key_for_operation(key_id, operation).await?;
        let scheme = SignatureScheme::for_algorithm(metadata.algorithm).ok_or_else(|| {
            CryptoError::InvalidAlgorithm(format!("key {key_id} is {}, which cannot sign", metadata.algorithm))
        })?;
        match expected {
            Some(wanted) if wanted != scheme => Err(CryptoError::InvalidAlgorithm(format!(
                "key {key_id} uses {scheme}, not {wanted}"
            ))),
            _ => Ok((scheme, material)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLogger;
    use crate::keys::InMemoryKeyStore;
    use rust_common::{CacheClient, CacheClientConfig, KeyCacheHelper};
    use std::time::Duration;

    struct Fixture {
        keys: Arc<KeyService>,
        signer: SignatureService,
        audit: Arc<InMemoryAuditLogger>,
    }

    fn fixture() -> Fixture {
        let audit = Arc::new(InMemoryAuditLogger::new());
        let cache = Arc::new(CacheClient::new(CacheClientConfig::default().with_namespace("crypto")).unwrap());
        let keys = Arc::new(KeyService::new(
            Arc::new(InMemoryKeyStore::new()),
            KeyCacheHelper::new(cache, Duration::from_secs(60)),
            audit.clone(),
            [8u8; 32],
        ));
        let signer = SignatureService::new(Arc::clone(&keys), audit.clone());
        Fixture { keys, signer, audit }
    }

    fn ctx() -> CallerContext {
        CallerContext::new("tester", "unit-tests")
    }

    async fn key(f: &Fixture, algorithm: KeyAlgorithm) -> KeyId {
        f.keys
            .generate_key("documents", algorithm, "signer", None, &ctx())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ecdsa_sign_and_verify() {
        let f = fixture();
        let id = key(&f, KeyAlgorithm::EcdsaP256).await;

        let signed = f.signer.sign(b"invoice 42", &id, &ctx()).await.unwrap();
        assert_eq!(signed.scheme, SignatureScheme::Ecdsa);
        assert_eq!(signed.key_id, id);

        assert!(f.signer.verify(b"invoice 42", &signed.signature, &id, &ctx()).await.unwrap());
        assert!(!f.signer.verify(b"invoice 43", &signed.signature, &id, &ctx()).await.unwrap());
        assert!(!f.signer.verify_ecdsa(b"invoice 42", b"garbage", &id, &ctx()).await.unwrap());

        assert_eq!(f.audit.entries_for(AuditOperation::Sign).len(), 1);
        let verifies = f.audit.entries_for(AuditOperation::Verify);
        assert_eq!(verifies.len(), 3);
        assert!(verifies.iter().all(|e| e.success));
        assert_eq!(verifies[1].metadata.get("valid").map(String::as_str), Some("false"));
    }

    #[tokio::test]
    async fn test_rsa_sign_and_verify() {
        let f = fixture();
        let id = key(&f, KeyAlgorithm::Rsa2048).await;

        let signed = f.signer.sign_rsa(b"release manifest", &id, &ctx()).await.unwrap();
        assert_eq!(signed.scheme, SignatureScheme::RsaPss);
        assert_eq!(signed.signature.len(), 256);
        assert!(f.signer.verify_rsa(b"release manifest", &signed.signature, &id, &ctx()).await.unwrap());

        let err = f.signer.sign_ecdsa(b"release manifest", &id, &ctx()).await.unwrap_err();
        assert!(matches!(err, CryptoError::InvalidAlgorithm(_)));
    }

    #[tokio::test]
    async fn test_deprecated_key_verifies_only() {
        let f = fixture();
        let id = key(&f, KeyAlgorithm::EcdsaP256).await;
        let signed = f.signer.sign(b"contract", &id, &ctx()).await.unwrap();

        let next = f.keys.rotate_key(&id, &ctx()).await.unwrap();
        assert!(matches!(
            f.signer.sign(b"contract v2", &id, &ctx()).await,
            Err(CryptoError::InvalidState(_))
        ));
        assert!(f.signer.verify(b"contract", &signed.signature, &id, &ctx()).await.unwrap());

        let fresh = f.signer.sign(b"contract v2", &next, &ctx()).await.unwrap();
        assert!(f.signer.verify(b"contract v2", &fresh.signature, &next, &ctx()).await.unwrap());
        // different key pair
        assert!(!f.signer.verify(b"contract", &signed.signature, &next, &ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_key_rejects_sign_and_verify() {
        let f = fixture();
        let id = key(&f, KeyAlgorithm::EcdsaP256).await;
        let signed = f.signer.sign(b"receipt", &id, &ctx()).await.unwrap();

        f.keys.delete_key(&id, &ctx()).await.unwrap();
        assert!(matches!(
            f.signer.sign(b"receipt", &id, &ctx()).await,
            Err(CryptoError::KeyNotFound(_))
        ));
        assert!(matches!(
            f.signer.verify(b"receipt", &signed.signature, &id, &ctx()).await,
            Err(CryptoError::KeyNotFound(_))
        ));

        let verifies = f.audit.entries_for(AuditOperation::Verify);
        assert_eq!(verifies.len(), 1);
        assert_eq!(verifies[0].error_code.as_deref(), Some("KEY_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_symmetric_key_cannot_sign() {
        let f = fixture();
        let aes = f
            .keys
            .generate_key("documents", KeyAlgorithm::Aes256Gcm, "signer", Some(vec![KeyOperation::Sign]), &ctx())
            .await
            .unwrap();
        let err = f.signer.sign(b"x", &aes, &ctx()).await.unwrap_err();
        assert!(matches!(err, CryptoError::InvalidAlgorithm(_)));

        // default AES operations do not include SIGN
        let plain_aes = key(&f, KeyAlgorithm::Aes256Gcm).await;
        assert!(matches!(
            f.signer.sign(b"x", &plain_aes, &ctx()).await,
            Err(CryptoError::InvalidInput(_))
        ));
        assert_eq!(f.audit.entries_for(AuditOperation::Sign).len(), 2);
    }
}
