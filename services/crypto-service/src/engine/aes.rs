//! AES-GCM and AES-CBC primitives.

use crate::error::CryptoError;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// GCM nonce length in bytes.
pub const IV_LEN: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// CBC IV length in bytes.
pub const CBC_IV_LEN: usize = 16;
/// Largest accepted plaintext.
pub const MAX_PLAINTEXT_SIZE: usize = 64 * 1024 * 1024;
/// Largest accepted additional authenticated data.
pub const MAX_AAD_SIZE: usize = 64 * 1024;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Output of a GCM seal: ciphertext with detached IV and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcmCiphertext {
    /// Ciphertext, same length as the plaintext
    pub ciphertext: Vec<u8>,
    /// 96-bit nonce
    pub iv: Vec<u8>,
    /// 128-bit tag
    pub tag: Vec<u8>,
}

/// Output of a CBC encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbcCiphertext {
    /// PKCS#7 padded ciphertext
    pub ciphertext: Vec<u8>,
    /// 128-bit IV
    pub iv: Vec<u8>,
}

enum GcmCipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

impl GcmCipher {
    fn new(key: &[u8]) -> Result<Self, CryptoError> {
        match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map(Self::Aes128)
                .map_err(|e| CryptoError::internal(e.to_string())),
            32 => Aes256Gcm::new_from_slice(key)
                .map(Self::Aes256)
                .map_err(|e| CryptoError::internal(e.to_string())),
            n => Err(CryptoError::invalid_input(format!(
                "AES key must be 16 or 32 bytes, got {n}"
            ))),
        }
    }

    fn seal(&self, iv: &[u8], aad: &[u8], buffer: &mut Vec<u8>) -> Result<Vec<u8>, CryptoError> {
        let nonce = GenericArray::from_slice(iv);
        let tag = match self {
            Self::Aes128(c) => c.encrypt_in_place_detached(nonce, aad, buffer),
            Self::Aes256(c) => c.encrypt_in_place_detached(nonce, aad, buffer),
        }
        .map_err(|_| CryptoError::internal("AES-GCM encryption failed"))?;
        Ok(tag.to_vec())
    }

    fn open(&self, iv: &[u8], aad: &[u8], buffer: &mut Vec<u8>, tag: &[u8]) -> Result<(), CryptoError> {
        let nonce = GenericArray::from_slice(iv);
        let tag = GenericArray::from_slice(tag);
        match self {
            Self::Aes128(c) => c.decrypt_in_place_detached(nonce, aad, buffer, tag),
            Self::Aes256(c) => c.decrypt_in_place_detached(nonce, aad, buffer, tag),
        }
        .map_err(|_| CryptoError::IntegrityError)
    }
}

/// Generate a random AES key of 16 or 32 bytes.
///
/// # Errors
///
/// Returns `InvalidInput` for any other size.
pub fn generate_key(size: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if size != 16 && size != 32 {
        return Err(CryptoError::invalid_input(format!(
            "AES key size must be 16 or 32 bytes, got {size}"
        )));
    }
    let mut key = Zeroizing::new(vec![0u8; size]);
    OsRng.fill_bytes(&mut key);
    Ok(key)
}

/// Seal `plaintext` under a fresh random IV.
///
/// # Errors
///
/// `InvalidInput` for a bad key size, `SizeLimitExceeded` for oversized input.
pub fn encrypt_gcm(key: &[u8], plaintext: &[u8], aad: Option<&[u8]>) -> Result<GcmCiphertext, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    encrypt_gcm_with_iv(key, &iv, plaintext, aad)
}

/// Seal `plaintext` under a caller-chosen IV.
///
/// The caller guarantees the (key, IV) pair is never reused.
///
/// # Errors
///
/// `InvalidInput` for a bad key or IV size, `SizeLimitExceeded` for oversized input.
pub fn encrypt_gcm_with_iv(
    key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
    aad: Option<&[u8]>,
) -> Result<GcmCiphertext, CryptoError> {
    let aad = aad.unwrap_or_default();
    check_limits(plaintext.len(), aad.len())?;
    if iv.len() != IV_LEN {
        return Err(CryptoError::invalid_input(format!(
            "GCM IV must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }

    let cipher = GcmCipher::new(key)?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher.seal(iv, aad, &mut buffer)?;

    Ok(GcmCiphertext {
        ciphertext: buffer,
        iv: iv.to_vec(),
        tag,
    })
}

/// Open a GCM ciphertext.
///
/// # Errors
///
/// `IntegrityError` when the tag does not verify or the IV/tag lengths are
/// wrong; `InvalidInput` for a bad key size.
pub fn decrypt_gcm(
    key: &[u8],
    ciphertext: &[u8],
    iv: &[u8],
    tag: &[u8],
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, CryptoError> {
    let aad = aad.unwrap_or_default();
    check_limits(ciphertext.len(), aad.len())?;
    let cipher = GcmCipher::new(key)?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(CryptoError::IntegrityError);
    }

    let mut buffer = ciphertext.to_vec();
    cipher.open(iv, aad, &mut buffer, tag)?;
    Ok(buffer)
}

/// Encrypt with AES-CBC and PKCS#7 padding under a random IV.
///
/// # Errors
///
/// `InvalidInput` for a bad key size, `SizeLimitExceeded` for oversized input.
pub fn encrypt_cbc(key: &[u8], plaintext: &[u8]) -> Result<CbcCiphertext, CryptoError> {
    check_limits(plaintext.len(), 0)?;
    let mut iv = [0u8; CBC_IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = match key.len() {
        16 => Aes128CbcEnc::new_from_slices(key, &iv)
            .map_err(|e| CryptoError::internal(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => Aes256CbcEnc::new_from_slices(key, &iv)
            .map_err(|e| CryptoError::internal(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        n => {
            return Err(CryptoError::invalid_input(format!(
                "AES key must be 16 or 32 bytes, got {n}"
            )))
        }
    };

    Ok(CbcCiphertext {
        ciphertext,
        iv: iv.to_vec(),
    })
}

/// Decrypt AES-CBC and strip PKCS#7 padding.
///
/// CBC is unauthenticated; a padding failure is reported as `IntegrityError`.
///
/// # Errors
///
/// `IntegrityError` for bad padding or IV, `InvalidInput` for a bad key size.
pub fn decrypt_cbc(key: &[u8], ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != CBC_IV_LEN {
        return Err(CryptoError::IntegrityError);
    }
    match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|e| CryptoError::internal(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::IntegrityError),
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| CryptoError::internal(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::IntegrityError),
        n => Err(CryptoError::invalid_input(format!(
            "AES key must be 16 or 32 bytes, got {n}"
        ))),
    }
}

fn check_limits(data_len: usize, aad_len: usize) -> Result<(), CryptoError> {
    if data_len > MAX_PLAINTEXT_SIZE {
        return Err(CryptoError::size_limit(
            "plaintext",
            data_len as u64,
            MAX_PLAINTEXT_SIZE as u64,
        ));
    }
    if aad_len > MAX_AAD_SIZE {
        return Err(CryptoError::size_limit("aad", aad_len as u64, MAX_AAD_SIZE as u64));
    }
    Ok(())
}
