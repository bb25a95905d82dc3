//! Cryptographic primitive adapters.
//!
//! Each submodule wraps one RustCrypto primitive family; [`generate_material`]
//! dispatches on [`KeyAlgorithm`] to produce raw key bytes of the right shape.

pub mod aes;
pub mod ecdsa;
pub mod rsa;

use crate::error::CryptoError;
use crate::keys::{KeyAlgorithm, KeyMaterial};

/// Generate raw key material for `algorithm`.
///
/// AES keys are 16 or 32 random bytes, RSA keys PKCS#8 DER and ECDSA keys
/// 32-byte scalars.
///
/// # Errors
///
/// `Internal` if the underlying generator fails.
pub fn generate_material(algorithm: KeyAlgorithm) -> Result<KeyMaterial, CryptoError> {
    let bytes = match algorithm {
        KeyAlgorithm::Aes128Gcm
        | KeyAlgorithm::Aes256Gcm
        | KeyAlgorithm::Aes128Cbc
        | KeyAlgorithm::Aes256Cbc => aes::generate_key(algorithm.key_size())?,
        KeyAlgorithm::Rsa2048 => rsa::generate_key(2048)?,
        KeyAlgorithm::Rsa3072 => rsa::generate_key(3072)?,
        KeyAlgorithm::Rsa4096 => rsa::generate_key(4096)?,
        KeyAlgorithm::EcdsaP256 => ecdsa::generate_key(),
    };
    Ok(KeyMaterial::from(bytes))
}

/// Public half of an asymmetric key; `None` for symmetric algorithms.
///
/// # Errors
///
/// `InvalidInput` if `material` does not match `algorithm`.
pub fn public_key(algorithm: KeyAlgorithm, material: &KeyMaterial) -> Result<Option<Vec<u8>>, CryptoError> {
    match algorithm {
        KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa3072 | KeyAlgorithm::Rsa4096 => {
            rsa::public_key_der(material.expose()).map(Some)
        }
        KeyAlgorithm::EcdsaP256 => ecdsa::public_key(material.expose()).map(Some),
        _ => Ok(None),
    }
}
