//! Key identifiers, algorithms, lifecycle state and metadata.

use crate::error::CryptoError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Key identifier: `(namespace, unique_id, version)`.
///
/// Rendered as `namespace:unique_id:v{version}`; [`KeyId::parse`] is the exact
/// inverse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId {
    namespace: String,
    unique_id: String,
    version: u32,
}

impl KeyId {
    /// Create a key id.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if a component is empty or contains `:`, or the version is zero.
    pub fn new(
        namespace: impl Into<String>,
        unique_id: impl Into<String>,
        version: u32,
    ) -> Result<Self, CryptoError> {
        let namespace = namespace.into();
        let unique_id = unique_id.into();
        validate_component("namespace", &namespace)?;
        validate_component("unique_id", &unique_id)?;
        if version == 0 {
            return Err(CryptoError::invalid_input("key version must be at least 1"));
        }
        Ok(Self {
            namespace,
            unique_id,
            version,
        })
    }

    /// Fresh version-1 id with a random UUID.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an invalid namespace.
    pub fn generate(namespace: &str) -> Result<Self, CryptoError> {
        Self::new(namespace, uuid::Uuid::new_v4().to_string(), 1)
    }

    /// Successor id for a rotation: same namespace, new UUID, version + 1.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the version counter would overflow.
    pub fn rotated(&self) -> Result<Self, CryptoError> {
        let version = self
            .version
            .checked_add(1)
            .ok_or_else(|| CryptoError::invalid_state("key version exhausted"))?;
        Self::new(self.namespace.clone(), uuid::Uuid::new_v4().to_string(), version)
    }

    /// Parse `namespace:unique_id:v{version}`.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for anything that [`KeyId`]'s `Display` would not produce.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let mut parts = s.split(':');
        let (Some(namespace), Some(unique_id), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CryptoError::invalid_input(format!("malformed key id: {s}")));
        };

        let version = version
            .strip_prefix('v')
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .filter(|digits| digits.len() == 1 || !digits.starts_with('0'))
            .and_then(|digits| digits.parse::<u32>().ok())
            .ok_or_else(|| CryptoError::invalid_input(format!("malformed key version: {s}")))?;

        Self::new(namespace, unique_id, version)
    }

    /// Namespace component.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Unique id component.
    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Version component.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }
}

fn validate_component(name: &str, value: &str) -> Result<(), CryptoError> {
    if value.is_empty() {
        return Err(CryptoError::invalid_input(format!("{name} must not be empty")));
    }
    if value.contains(':') {
        return Err(CryptoError::invalid_input(format!("{name} must not contain ':'")));
    }
    Ok(())
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:v{}", self.namespace, self.unique_id, self.version)
    }
}

impl FromStr for KeyId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Key algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// AES-128 in GCM mode
    #[serde(rename = "AES_128_GCM")]
    Aes128Gcm,
    /// AES-256 in GCM mode
    #[serde(rename = "AES_256_GCM")]
    Aes256Gcm,
    /// AES-128 in CBC mode
    #[serde(rename = "AES_128_CBC")]
    Aes128Cbc,
    /// AES-256 in CBC mode
    #[serde(rename = "AES_256_CBC")]
    Aes256Cbc,
    /// RSA with a 2048-bit modulus
    #[serde(rename = "RSA_2048")]
    Rsa2048,
    /// RSA with a 3072-bit modulus
    #[serde(rename = "RSA_3072")]
    Rsa3072,
    /// RSA with a 4096-bit modulus
    #[serde(rename = "RSA_4096")]
    Rsa4096,
    /// ECDSA over NIST P-256
    #[serde(rename = "ECDSA_P256")]
    EcdsaP256,
}

impl KeyAlgorithm {
    /// Canonical name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Aes128Gcm => "AES_128_GCM",
            Self::Aes256Gcm => "AES_256_GCM",
            Self::Aes128Cbc => "AES_128_CBC",
            Self::Aes256Cbc => "AES_256_CBC",
            Self::Rsa2048 => "RSA_2048",
            Self::Rsa3072 => "RSA_3072",
            Self::Rsa4096 => "RSA_4096",
            Self::EcdsaP256 => "ECDSA_P256",
        }
    }

    /// Symmetric key length, or modulus/scalar length for asymmetric keys.
    #[must_use]
    pub const fn key_size(&self) -> usize {
        match self {
            Self::Aes128Gcm | Self::Aes128Cbc => 16,
            Self::Aes256Gcm | Self::Aes256Cbc | Self::EcdsaP256 => 32,
            Self::Rsa2048 => 256,
            Self::Rsa3072 => 384,
            Self::Rsa4096 => 512,
        }
    }

    /// Whether this is an AES algorithm.
    #[must_use]
    pub const fn is_symmetric(&self) -> bool {
        matches!(
            self,
            Self::Aes128Gcm | Self::Aes256Gcm | Self::Aes128Cbc | Self::Aes256Cbc
        )
    }

    /// Whether this is an AES-GCM algorithm.
    #[must_use]
    pub const fn is_gcm(&self) -> bool {
        matches!(self, Self::Aes128Gcm | Self::Aes256Gcm)
    }

    /// Operations a new key of this algorithm allows when none are given.
    #[must_use]
    pub fn default_operations(&self) -> Vec<KeyOperation> {
        match self {
            Self::Aes128Gcm | Self::Aes256Gcm | Self::Aes128Cbc | Self::Aes256Cbc => vec![
                KeyOperation::Encrypt,
                KeyOperation::Decrypt,
                KeyOperation::WrapKey,
                KeyOperation::UnwrapKey,
            ],
            Self::Rsa2048 | Self::Rsa3072 | Self::Rsa4096 => vec![
                KeyOperation::Encrypt,
                KeyOperation::Decrypt,
                KeyOperation::Sign,
                KeyOperation::Verify,
            ],
            Self::EcdsaP256 => vec![KeyOperation::Sign, KeyOperation::Verify],
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AES_128_GCM" => Ok(Self::Aes128Gcm),
            "AES_256_GCM" => Ok(Self::Aes256Gcm),
            "AES_128_CBC" => Ok(Self::Aes128Cbc),
            "AES_256_CBC" => Ok(Self::Aes256Cbc),
            "RSA_2048" => Ok(Self::Rsa2048),
            "RSA_3072" => Ok(Self::Rsa3072),
            "RSA_4096" => Ok(Self::Rsa4096),
            "ECDSA_P256" => Ok(Self::EcdsaP256),
            other => Err(CryptoError::InvalidAlgorithm(other.to_string())),
        }
    }
}

/// Operation a key may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyOperation {
    /// Encrypt data
    Encrypt,
    /// Decrypt data
    Decrypt,
    /// Produce signatures
    Sign,
    /// Check signatures
    Verify,
    /// Wrap another key
    WrapKey,
    /// Unwrap another key
    UnwrapKey,
}

impl KeyOperation {
    /// Canonical name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Encrypt => "ENCRYPT",
            Self::Decrypt => "DECRYPT",
            Self::Sign => "SIGN",
            Self::Verify => "VERIFY",
            Self::WrapKey => "WRAP_KEY",
            Self::UnwrapKey => "UNWRAP_KEY",
        }
    }

    /// Operations that produce new ciphertext or signatures need an active key.
    #[must_use]
    pub const fn requires_active(&self) -> bool {
        matches!(self, Self::Encrypt | Self::Sign | Self::WrapKey)
    }
}

impl fmt::Display for KeyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyState {
    /// Usable for every allowed operation
    Active,
    /// Decrypt and verify only
    Deprecated,
    /// Terminal; all material access is refused
    Deleted,
}

impl KeyState {
    /// Whether moving to `next` is a legal forward transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        next > self
    }

    /// Canonical name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Deprecated => "DEPRECATED",
            Self::Deleted => "DELETED",
        }
    }
}

/// Key metadata. Never holds key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Key identifier
    pub id: KeyId,
    /// Algorithm
    pub algorithm: KeyAlgorithm,
    /// Lifecycle state
    pub state: KeyState,
    /// Owning service
    pub owner_service: String,
    /// Permitted operations
    pub allowed_operations: Vec<KeyOperation>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// End of the validity period
    pub expires_at: DateTime<Utc>,
    /// When this key was produced by rotation
    pub rotated_at: Option<DateTime<Utc>>,
    /// Key this one replaced
    pub previous_version: Option<KeyId>,
}

impl KeyMetadata {
    /// Metadata for a freshly created active key.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `validity` is not positive.
    pub fn new(
        id: KeyId,
        algorithm: KeyAlgorithm,
        owner_service: impl Into<String>,
        allowed_operations: Vec<KeyOperation>,
        validity: Duration,
    ) -> Result<Self, CryptoError> {
        if validity <= Duration::zero() {
            return Err(CryptoError::invalid_input("key validity must be positive"));
        }
        let created_at = Utc::now();
        Ok(Self {
            id,
            algorithm,
            state: KeyState::Active,
            owner_service: owner_service.into(),
            allowed_operations,
            created_at,
            expires_at: created_at + validity,
            rotated_at: None,
            previous_version: None,
        })
    }

    /// Length of the validity period.
    #[must_use]
    pub fn validity(&self) -> Duration {
        self.expires_at - self.created_at
    }

    /// Only active keys start new encryptions or signatures.
    #[must_use]
    pub fn can_encrypt(&self) -> bool {
        self.state == KeyState::Active
    }

    /// Active and deprecated keys may decrypt or verify.
    #[must_use]
    pub fn can_decrypt(&self) -> bool {
        matches!(self.state, KeyState::Active | KeyState::Deprecated)
    }

    /// Whether `op` is among the allowed operations.
    #[must_use]
    pub fn permits(&self, op: KeyOperation) -> bool {
        self.allowed_operations.contains(&op)
    }

    /// Whether the validity period has passed. Informational only.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Key material encrypted under the master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMaterial {
    /// Encrypted key bytes
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// GCM nonce
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    /// GCM tag
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
}

/// Persisted key: metadata plus sealed material (absent on a deletion tombstone).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Key metadata
    pub metadata: KeyMetadata,
    /// Sealed material
    pub material: Option<SealedMaterial>,
}

impl KeyRecord {
    /// Record id.
    #[must_use]
    pub const fn id(&self) -> &KeyId {
        &self.metadata.id
    }
}

/// Raw key bytes, wiped on drop.
///
/// `Debug` never prints the bytes; [`KeyMaterial::expose`] is the only way out.
#[derive(Clone)]
pub struct KeyMaterial(Zeroizing<Vec<u8>>);

impl KeyMaterial {
    /// Take ownership of raw bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Zeroizing<Vec<u8>>> for KeyMaterial {
    fn from(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED; {} bytes])", self.0.len())
    }
}

/// Who is asking, carried into audit records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallerContext {
    /// Request correlation id
    pub correlation_id: String,
    /// Authenticated caller
    pub caller_identity: String,
    /// Calling service
    pub caller_service: String,
    /// Source address
    pub source_ip: String,
}

impl CallerContext {
    /// Context with a fresh correlation id.
    #[must_use]
    pub fn new(caller_identity: impl Into<String>, caller_service: impl Into<String>) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            caller_identity: caller_identity.into(),
            caller_service: caller_service.into(),
            source_ip: String::new(),
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Set the source address.
    #[must_use]
    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = ip.into();
        self
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
