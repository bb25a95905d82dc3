//! ECDSA over P-256 with SHA-256.
//!
//! Private keys are 32-byte scalars, public keys uncompressed SEC1 points and
//! signatures ASN.1 DER.

use crate::engine::rsa::MAX_SIGN_DATA_SIZE;
use crate::error::CryptoError;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// Generate a private scalar.
#[must_use]
pub fn generate_key() -> Zeroizing<Vec<u8>> {
    let key = SigningKey::random(&mut OsRng);
    Zeroizing::new(key.to_bytes().to_vec())
}

fn signing_key(private: &[u8]) -> Result<SigningKey, CryptoError> {
    SigningKey::from_slice(private).map_err(|_| CryptoError::invalid_input("malformed P-256 private key"))
}

/// Uncompressed SEC1 public key for a private scalar.
///
/// # Errors
///
/// `InvalidInput` for a malformed scalar.
pub fn public_key(private: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let verifying = VerifyingKey::from(&signing_key(private)?);
    Ok(verifying.to_encoded_point(false).as_bytes().to_vec())
}

/// Sign `data`.
///
/// # Errors
///
/// `InvalidInput` for a malformed scalar, `SizeLimitExceeded` for oversized input.
pub fn sign(private: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_size(data)?;
    let signature: Signature = signing_key(private)?.sign(data);
    Ok(signature.to_der().as_bytes().to_vec())
}

/// Verify a DER signature. A malformed signature verifies false.
///
/// # Errors
///
/// `InvalidInput` for a malformed public key, `SizeLimitExceeded` for oversized input.
pub fn verify(public: &[u8], data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
    check_size(data)?;
    let verifying = VerifyingKey::from_sec1_bytes(public)
        .map_err(|_| CryptoError::invalid_input("malformed P-256 public key"))?;
    let Ok(signature) = Signature::from_der(signature) else {
        return Ok(false);
    };
    Ok(verifying.verify(data, &signature).is_ok())
}

fn check_size(data: &[u8]) -> Result<(), CryptoError> {
    if data.len() > MAX_SIGN_DATA_SIZE {
        return Err(CryptoError::size_limit(
            "sign data",
            data.len() as u64,
            MAX_SIGN_DATA_SIZE as u64,
        ));
    }
    Ok(())
}
