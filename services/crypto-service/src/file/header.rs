//! Envelope header codec.
//!
//! Layout (version 1, integers little-endian):
//!
//! ```text
//! magic "CFEH" | version u8 | algorithm u8 | key_id u16 len + UTF-8 |
//! wrapped_dek u32 len + bytes | iv u32 len + bytes | tag u32 len + bytes |
//! original_size u64 | chunk_size u32
//! ```
//!
//! On the wire the header is preceded by its own length as a `u32`.

use crate::config::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::engine::aes::{IV_LEN, TAG_LEN};
use crate::error::CryptoError;
use crate::keys::KeyId;
use std::io::ErrorKind as IoErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// File magic.
pub const MAGIC: &[u8; 4] = b"CFEH";
/// Current header version.
pub const VERSION: u8 = 1;
/// Chunked AES-256-GCM body.
pub const ALGORITHM_AES_256_GCM_CHUNKED: u8 = 1;
/// Upper bound on an encoded header.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Self-describing envelope header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEncryptionHeader {
    /// Format version
    pub version: u8,
    /// Body algorithm
    pub algorithm: u8,
    /// KEK that wrapped the DEK
    pub key_id: KeyId,
    /// DEK sealed under the KEK
    pub wrapped_dek: Vec<u8>,
    /// IV of the DEK wrap
    pub iv: Vec<u8>,
    /// Tag of the DEK wrap
    pub tag: Vec<u8>,
    /// Plaintext length
    pub original_size: u64,
    /// Plaintext bytes per chunk
    pub chunk_size: u32,
}

impl FileEncryptionHeader {
    /// Header for the current version and algorithm.
    #[must_use]
    pub const fn new(
        key_id: KeyId,
        wrapped_dek: Vec<u8>,
        iv: Vec<u8>,
        tag: Vec<u8>,
        original_size: u64,
        chunk_size: u32,
    ) -> Self {
        Self {
            version: VERSION,
            algorithm: ALGORITHM_AES_256_GCM_CHUNKED,
            key_id,
            wrapped_dek,
            iv,
            tag,
            original_size,
            chunk_size,
        }
    }

    /// Number of body chunks. Empty input still has one (empty) chunk.
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        if self.original_size == 0 {
            1
        } else {
            self.original_size.div_ceil(u64::from(self.chunk_size))
        }
    }

    /// Plaintext length of chunk `index`.
    #[must_use]
    pub fn chunk_len(&self, index: u64) -> usize {
        let chunk = u64::from(self.chunk_size);
        let start = index.saturating_mul(chunk);
        let len = self.original_size.saturating_sub(start).min(chunk);
        // chunk_size is a u32, so len fits
        usize::try_from(len).unwrap_or(usize::MAX)
    }

    /// Encode without the length prefix.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if a field violates the header invariants.
    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        self.check_fields().map_err(CryptoError::InvalidInput)?;

        let key_id = self.key_id.to_string();
        let key_id_len = u16::try_from(key_id.len())
            .map_err(|_| CryptoError::invalid_input("key id too long for header"))?;

        let mut out = Vec::with_capacity(
            MAGIC.len() + 2 + 2 + key_id.len() + 12 + self.wrapped_dek.len() + IV_LEN + TAG_LEN + 12,
        );
        out.extend_from_slice(MAGIC);
        out.push(self.version);
        out.push(self.algorithm);
        out.extend_from_slice(&key_id_len.to_le_bytes());
        out.extend_from_slice(key_id.as_bytes());
        for field in [&self.wrapped_dek, &self.iv, &self.tag] {
            let len = u32::try_from(field.len())
                .map_err(|_| CryptoError::invalid_input("header field too long"))?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(field);
        }
        out.extend_from_slice(&self.original_size.to_le_bytes());
        out.extend_from_slice(&self.chunk_size.to_le_bytes());

        if out.len() > MAX_HEADER_LEN {
            return Err(CryptoError::invalid_input("encoded header too large"));
        }
        Ok(out)
    }

    /// Decode a header body (no length prefix). Every byte must be consumed.
    ///
    /// # Errors
    ///
    /// `CorruptHeader` on bad magic, unknown version or algorithm, malformed
    /// sizes, truncation or trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = Reader { bytes, pos: 0 };

        if reader.take(MAGIC.len())? != MAGIC {
            return Err(CryptoError::corrupt_header("bad magic"));
        }
        let version = reader.u8()?;
        if version != VERSION {
            return Err(CryptoError::corrupt_header(format!("unsupported version {version}")));
        }
        let algorithm = reader.u8()?;
        if algorithm != ALGORITHM_AES_256_GCM_CHUNKED {
            return Err(CryptoError::corrupt_header(format!("unknown algorithm {algorithm}")));
        }

        let key_id_len = usize::from(reader.u16()?);
        let key_id = std::str::from_utf8(reader.take(key_id_len)?)
            .map_err(|_| CryptoError::corrupt_header("key id is not UTF-8"))?;
        let key_id = KeyId::parse(key_id).map_err(|_| CryptoError::corrupt_header("malformed key id"))?;

        let wrapped_dek = reader.prefixed()?.to_vec();
        let iv = reader.prefixed()?.to_vec();
        let tag = reader.prefixed()?.to_vec();
        let original_size = reader.u64()?;
        let chunk_size = reader.u32()?;

        if reader.pos != bytes.len() {
            return Err(CryptoError::corrupt_header("trailing bytes after header"));
        }

        let header = Self {
            version,
            algorithm,
            key_id,
            wrapped_dek,
            iv,
            tag,
            original_size,
            chunk_size,
        };
        header.check_fields().map_err(CryptoError::CorruptHeader)?;
        Ok(header)
    }

    /// Write `u32 len | header`, returning the encoded header bytes.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an invalid header, `Io` on write failure.
    pub async fn write_to<W>(&self, output: &mut W) -> Result<Vec<u8>, CryptoError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let bytes = self.encode()?;
        let len = u32::try_from(bytes.len()).map_err(|_| CryptoError::invalid_input("encoded header too large"))?;
        output.write_u32_le(len).await?;
        output.write_all(&bytes).await?;
        Ok(bytes)
    }

    /// Read `u32 len | header` from a stream, returning the header and its raw bytes.
    ///
    /// # Errors
    ///
    /// `CorruptHeader` for a bad length prefix, truncation or a malformed
    /// header; `Io` for other read failures.
    pub async fn read_from<R>(input: &mut R) -> Result<(Self, Vec<u8>), CryptoError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let len = input.read_u32_le().await.map_err(truncated)?;
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len == 0 || len > MAX_HEADER_LEN {
            return Err(CryptoError::corrupt_header(format!("header length {len} out of range")));
        }

        let mut bytes = vec![0u8; len];
        input.read_exact(&mut bytes).await.map_err(truncated)?;
        let header = Self::decode(&bytes)?;
        Ok((header, bytes))
    }

    fn check_fields(&self) -> Result<(), String> {
        if self.wrapped_dek.is_empty() {
            return Err("wrapped DEK is empty".into());
        }
        if self.iv.len() != IV_LEN {
            return Err(format!("IV must be {IV_LEN} bytes, got {}", self.iv.len()));
        }
        if self.tag.len() != TAG_LEN {
            return Err(format!("tag must be {TAG_LEN} bytes, got {}", self.tag.len()));
        }
        let chunk = usize::try_from(self.chunk_size).unwrap_or(usize::MAX);
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk) {
            return Err(format!("chunk size {chunk} out of range"));
        }
        Ok(())
    }
}

fn truncated(e: std::io::Error) -> CryptoError {
    if e.kind() == IoErrorKind::UnexpectedEof {
        CryptoError::corrupt_header("truncated header")
    } else {
        e.into()
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CryptoError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| CryptoError::corrupt_header("truncated header"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CryptoError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CryptoError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, CryptoError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, CryptoError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, CryptoError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn prefixed(&mut self) -> Result<&'a [u8], CryptoError> {
        let len = usize::try_from(self.u32()?).unwrap_or(usize::MAX);
        if len > MAX_HEADER_LEN {
            return Err(CryptoError::corrupt_header("field length out of range"));
        }
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FileEncryptionHeader {
        FileEncryptionHeader::new(
            KeyId::new("payments", "0b7c", 3).unwrap(),
            vec![7; 32],
            vec![1; IV_LEN],
            vec![2; TAG_LEN],
            200_000,
            65_536,
        )
    }

    #[test]
    fn test_encode_decode() {
        let h = header();
        let bytes = h.encode().unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(bytes[4], VERSION);
        assert_eq!(FileEncryptionHeader::decode(&bytes).unwrap(), h);
    }

    #[test]
    fn test_chunk_geometry() {
        let h = header();
        assert_eq!(h.chunk_count(), 4);
        assert_eq!(h.chunk_len(0), 65_536);
        assert_eq!(h.chunk_len(3), 200_000 - 3 * 65_536);

        let mut empty = header();
        empty.original_size = 0;
        assert_eq!(empty.chunk_count(), 1);
        assert_eq!(empty.chunk_len(0), 0);

        let mut exact = header();
        exact.original_size = 2 * 65_536;
        assert_eq!(exact.chunk_count(), 2);
        assert_eq!(exact.chunk_len(1), 65_536);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = header().encode().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            FileEncryptionHeader::decode(&bytes),
            Err(CryptoError::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_unknown_version_and_algorithm() {
        let mut bytes = header().encode().unwrap();
        bytes[4] = 2;
        assert!(matches!(
            FileEncryptionHeader::decode(&bytes),
            Err(CryptoError::CorruptHeader(_))
        ));

        let mut bytes = header().encode().unwrap();
        bytes[5] = 9;
        assert!(matches!(
            FileEncryptionHeader::decode(&bytes),
            Err(CryptoError::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_truncated_and_trailing() {
        let bytes = header().encode().unwrap();
        for cut in [0, 3, 6, 10, bytes.len() - 1] {
            assert!(matches!(
                FileEncryptionHeader::decode(&bytes[..cut]),
                Err(CryptoError::CorruptHeader(_))
            ));
        }

        let mut extra = bytes;
        extra.push(0);
        assert!(matches!(
            FileEncryptionHeader::decode(&extra),
            Err(CryptoError::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_encode_rejects_bad_fields() {
        let mut h = header();
        h.iv = vec![0; 8];
        assert!(matches!(h.encode(), Err(CryptoError::InvalidInput(_))));

        let mut h = header();
        h.wrapped_dek.clear();
        assert!(matches!(h.encode(), Err(CryptoError::InvalidInput(_))));

        let mut h = header();
        h.chunk_size = 0;
        assert!(matches!(h.encode(), Err(CryptoError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_stream_prefix() {
        let h = header();
        let mut buf = Vec::new();
        let raw = h.write_to(&mut buf).await.unwrap();
        assert_eq!(&buf[..4], &u32::try_from(raw.len()).unwrap().to_le_bytes());

        let mut reader = buf.as_slice();
        let (decoded, bytes) = FileEncryptionHeader::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded, h);
        assert_eq!(bytes, raw);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_stream_length_out_of_range() {
        let mut zero: &[u8] = &0u32.to_le_bytes();
        assert!(matches!(
            FileEncryptionHeader::read_from(&mut zero).await,
            Err(CryptoError::CorruptHeader(_))
        ));

        let huge = u32::try_from(MAX_HEADER_LEN + 1).unwrap().to_le_bytes();
        let mut huge: &[u8] = &huge;
        assert!(matches!(
            FileEncryptionHeader::read_from(&mut huge).await,
            Err(CryptoError::CorruptHeader(_))
        ));

        let mut short: &[u8] = &[1, 0];
        assert!(matches!(
            FileEncryptionHeader::read_from(&mut short).await,
            Err(CryptoError::CorruptHeader(_))
        ));
    }
}
