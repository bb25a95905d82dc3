//! RSA-OAEP encryption and RSA-PSS signatures, both over SHA-256.
//!
//! Private keys travel as PKCS#8 DER and public keys as SPKI DER.

use crate::error::CryptoError;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

/// SHA-256 output length used by OAEP.
const HASH_LEN: usize = 32;
/// Largest accepted signing input.
pub const MAX_SIGN_DATA_SIZE: usize = 16 * 1024 * 1024;

/// Supported modulus sizes.
pub const SUPPORTED_BITS: [usize; 3] = [2048, 3072, 4096];

/// Generate a private key and return it as PKCS#8 DER.
///
/// # Errors
///
/// `InvalidInput` for an unsupported modulus size.
pub fn generate_key(bits: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if !SUPPORTED_BITS.contains(&bits) {
        return Err(CryptoError::invalid_input(format!(
            "RSA key size must be 2048, 3072 or 4096 bits, got {bits}"
        )));
    }
    let key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| CryptoError::internal(format!("RSA key generation failed: {e}")))?;
    export_private_key(&key)
}

/// Encode a private key as PKCS#8 DER.
///
/// # Errors
///
/// `Internal` if encoding fails.
pub fn export_private_key(key: &RsaPrivateKey) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let der = key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::internal(format!("PKCS#8 encoding failed: {e}")))?;
    Ok(Zeroizing::new(der.as_bytes().to_vec()))
}

/// Decode a PKCS#8 DER private key.
///
/// # Errors
///
/// `InvalidInput` for malformed DER.
pub fn import_private_key(der: &[u8]) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs8_der(der)
        .map_err(|_| CryptoError::invalid_input("malformed RSA private key"))
}

/// SPKI DER public key for a PKCS#8 DER private key.
///
/// # Errors
///
/// `InvalidInput` for malformed DER.
pub fn public_key_der(private_der: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let public = RsaPublicKey::from(&import_private_key(private_der)?);
    public
        .to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| CryptoError::internal(format!("SPKI encoding failed: {e}")))
}

/// Decode an SPKI DER public key.
///
/// # Errors
///
/// `InvalidInput` for malformed DER.
pub fn import_public_key(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_der(der)
        .map_err(|_| CryptoError::invalid_input("malformed RSA public key"))
}

/// Largest OAEP-SHA256 plaintext for a modulus of `key_bytes` bytes.
#[must_use]
pub const fn max_oaep_plaintext(key_bytes: usize) -> usize {
    key_bytes.saturating_sub(2 * HASH_LEN + 2)
}

/// Encrypt with OAEP-SHA256.
///
/// # Errors
///
/// `SizeLimitExceeded` when the plaintext does not fit the modulus.
pub fn encrypt_oaep(public: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let limit = max_oaep_plaintext(public.size());
    if plaintext.len() > limit {
        return Err(CryptoError::size_limit(
            "plaintext",
            plaintext.len() as u64,
            limit as u64,
        ));
    }
    public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| CryptoError::internal(format!("RSA-OAEP encryption failed: {e}")))
}

/// Decrypt with OAEP-SHA256.
///
/// # Errors
///
/// `IntegrityError` for any decryption failure.
pub fn decrypt_oaep(private: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    private
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::IntegrityError)
}

/// Sign with RSA-PSS over SHA-256.
///
/// # Errors
///
/// `SizeLimitExceeded` for oversized input.
pub fn sign_pss(private: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() > MAX_SIGN_DATA_SIZE {
        return Err(CryptoError::size_limit(
            "sign data",
            data.len() as u64,
            MAX_SIGN_DATA_SIZE as u64,
        ));
    }
    let signing_key = BlindedSigningKey::<Sha256>::new(private.clone());
    Ok(signing_key.sign_with_rng(&mut OsRng, data).to_vec())
}

/// Verify an RSA-PSS SHA-256 signature. A malformed signature verifies false.
///
/// # Errors
///
/// `SizeLimitExceeded` for oversized input.
pub fn verify_pss(public: &RsaPublicKey, data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
    if data.len() > MAX_SIGN_DATA_SIZE {
        return Err(CryptoError::size_limit(
            "sign data",
            data.len() as u64,
            MAX_SIGN_DATA_SIZE as u64,
        ));
    }
    let Ok(signature) = Signature::try_from(signature) else {
        return Ok(false);
    };
    let verifying_key = VerifyingKey::<Sha256>::new(public.clone());
    Ok(verifying_key.verify(data, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_oaep_plaintext() {
        assert_eq!(max_oaep_plaintext(256), 190);
        assert_eq!(max_oaep_plaintext(384), 318);
        assert_eq!(max_oaep_plaintext(512), 446);
        assert_eq!(max_oaep_plaintext(10), 0);
    }

    #[test]
    fn test_rejects_unsupported_size() {
        assert!(matches!(generate_key(1024), Err(CryptoError::InvalidInput(_))));
    }

    #[test]
    fn test_oaep_and_pss_with_2048_key() {
        let der = generate_key(2048).unwrap();
        let private = import_private_key(&der).unwrap();
        let public = import_public_key(&public_key_der(&der).unwrap()).unwrap();

        let ciphertext = encrypt_oaep(&public, b"wrapped secret").unwrap();
        assert_eq!(ciphertext.len(), 256);
        assert_eq!(decrypt_oaep(&private, &ciphertext).unwrap().as_slice(), b"wrapped secret");

        let too_big = vec![0u8; 191];
        assert!(matches!(
            encrypt_oaep(&public, &too_big),
            Err(CryptoError::SizeLimitExceeded { .. })
        ));

        let signature = sign_pss(&private, b"message").unwrap();
        assert!(verify_pss(&public, b"message", &signature).unwrap());
        assert!(!verify_pss(&public, b"massage", &signature).unwrap());
        assert!(!verify_pss(&public, b"message", b"short").unwrap());

        let mut tampered = ciphertext;
        tampered[0] ^= 0x01;
        assert!(matches!(decrypt_oaep(&private, &tampered), Err(CryptoError::IntegrityError)));
    }

    #[test]
    fn test_import_rejects_garbage() {
        assert!(import_private_key(b"not der").is_err());
        assert!(import_public_key(b"not der").is_err());
    }
}
