//! Streaming envelope encryption.
//!
//! A fresh DEK encrypts the body in fixed-size chunks; the DEK itself is
//! sealed under a KEK held by the key service and carried in the header.
//!
//! Chunk `i` uses nonce `0u32 BE || i u64 BE` and AAD
//! `SHA-256(header) || i u64 BE || final u8`, so chunks cannot be reordered,
//! dropped, truncated or moved between files.

use super::header::FileEncryptionHeader;
use crate::audit::{AuditEntry, AuditLogger, AuditOperation};
use crate::config::CryptoServiceConfig;
use crate::engine::aes::{self, IV_LEN, TAG_LEN};
use crate::error::CryptoError;
use crate::keys::{CallerContext, KeyId, KeyOperation, KeyService};
use crate::metrics::OperationTimer;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

const DEK_LEN: usize = 32;

/// Called after each chunk with `(processed_bytes, total_bytes)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Envelope file encryption over async streams.
pub struct FileEncryptionService {
    keys: Arc<KeyService>,
    audit: Arc<dyn AuditLogger>,
    max_file_size: u64,
    chunk_size: u32,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for FileEncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEncryptionService")
            .field("max_file_size", &self.max_file_size)
            .field("chunk_size", &self.chunk_size)
            .field("progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}

impl FileEncryptionService {
    /// Create a service using the size limits in `config`.
    #[must_use]
    pub fn new(keys: Arc<KeyService>, audit: Arc<dyn AuditLogger>, config: &CryptoServiceConfig) -> Self {
        Self {
            keys,
            audit,
            max_file_size: config.max_file_size,
            // out-of-range sizes are rejected when the header is encoded
            chunk_size: u32::try_from(config.chunk_size).unwrap_or(u32::MAX),
            progress: None,
        }
    }

    /// Report progress after every chunk.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Encrypt `declared_size` bytes from `input` under a fresh DEK wrapped by `kek_id`.
    ///
    /// # Errors
    ///
    /// `SizeLimitExceeded` above the configured maximum, `InvalidState` for a
    /// KEK that is not active, `InvalidInput` for a KEK that cannot wrap or an
    /// input whose length differs from `declared_size`, `KeyNotFound` /
    /// `KeyDeleted` from the key service, `Io` for stream failures.
    #[instrument(name = "encrypt", skip_all, fields(key_id = %kek_id, size = declared_size))]
    pub async fn encrypt_stream<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        kek_id: &KeyId,
        ctx: &CallerContext,
        declared_size: u64,
    ) -> Result<FileEncryptionHeader, CryptoError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let timer = OperationTimer::start("encrypt");
        let result = self.encrypt_inner(input, output, kek_id, declared_size).await;
        timer.finish(&result);

        let mut entry = AuditEntry::new(AuditOperation::FileEncrypt, Some(kek_id), ctx, &result)
            .with_metadata("declared_size", declared_size);
        if let Ok(header) = &result {
            entry = entry.with_metadata("chunks", header.chunk_count());
        }
        self.audit.log_operation(entry).await;
        result
    }

    async fn encrypt_inner<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        kek_id: &KeyId,
        declared_size: u64,
    ) -> Result<FileEncryptionHeader, CryptoError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        if declared_size > self.max_file_size {
            return Err(CryptoError::size_limit("file", declared_size, self.max_file_size));
        }

        let (metadata, kek) = self.keys.key_for_operation(kek_id, KeyOperation::WrapKey).await?;
        if !metadata.algorithm.is_gcm() {
            return Err(CryptoError::invalid_input(format!(
                "KEK algorithm {} cannot wrap keys",
                metadata.algorithm
            )));
        }

        let dek = aes::generate_key(DEK_LEN)?;
        let kek_aad = kek_id.to_string();
        let wrapped = aes::encrypt_gcm(kek.expose(), &dek, Some(kek_aad.as_bytes()))?;
        drop(kek);

        let header = FileEncryptionHeader::new(
            kek_id.clone(),
            wrapped.ciphertext,
            wrapped.iv,
            wrapped.tag,
            declared_size,
            self.chunk_size,
        );
        let header_bytes = header.write_to(output).await?;
        let digest = Sha256::digest(&header_bytes);

        let chunks = header.chunk_count();
        let mut buffer = vec![0u8; header.chunk_len(0)];
        let mut processed = 0u64;
        for index in 0..chunks {
            let len = header.chunk_len(index);
            let filled = read_full(input, &mut buffer[..len]).await?;
            if filled < len {
                return Err(CryptoError::invalid_input(format!(
                    "input ended after {} bytes, {declared_size} declared",
                    processed + filled as u64
                )));
            }

            let sealed = aes::encrypt_gcm_with_iv(
                &dek,
                &chunk_nonce(index),
                &buffer[..len],
                Some(&chunk_aad(&digest, index, index + 1 == chunks)),
            )?;
            output.write_all(&sealed.ciphertext).await?;
            output.write_all(&sealed.tag).await?;

            processed += len as u64;
            self.report(processed, declared_size);
        }

        let mut extra = [0u8; 1];
        if input.read(&mut extra).await? != 0 {
            return Err(CryptoError::invalid_input(format!(
                "input is longer than the {declared_size} bytes declared"
            )));
        }
        output.flush().await?;

        info!(key_id = %kek_id, size = declared_size, chunks, "Stream encrypted");
        Ok(header)
    }

    /// Decrypt a stream produced by [`Self::encrypt_stream`].
    ///
    /// Each chunk is authenticated before any of its plaintext is written.
    ///
    /// # Errors
    ///
    /// `CorruptHeader` for an unparseable header, `KeyNotFound` / `KeyDeleted`
    /// for an unavailable KEK, `InvalidInput` for a KEK that does not permit
    /// `UNWRAP_KEY`, `IntegrityError` for any authentication
    /// failure, a truncated body or trailing bytes.
    #[instrument(name = "decrypt", skip_all)]
    pub async fn decrypt_stream<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        ctx: &CallerContext,
    ) -> Result<FileEncryptionHeader, CryptoError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let timer = OperationTimer::start("decrypt");
        let mut key_id = None;
        let result = self.decrypt_inner(input, output, &mut key_id).await;
        timer.finish(&result);

        let mut entry = AuditEntry::new(AuditOperation::FileDecrypt, key_id.as_ref(), ctx, &result);
        if let Ok(header) = &result {
            entry = entry.with_metadata("original_size", header.original_size);
        }
        self.audit.log_operation(entry).await;
        result
    }

    async fn decrypt_inner<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        key_id: &mut Option<KeyId>,
    ) -> Result<FileEncryptionHeader, CryptoError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let (header, header_bytes) = FileEncryptionHeader::read_from(input).await?;
        *key_id = Some(header.key_id.clone());
        if header.original_size > self.max_file_size {
            return Err(CryptoError::size_limit(
                "file",
                header.original_size,
                self.max_file_size,
            ));
        }

        let (_, kek) = self
            .keys
            .key_for_operation(&header.key_id, KeyOperation::UnwrapKey)
            .await?;
        let kek_aad = header.key_id.to_string();
        let dek = Zeroizing::new(aes::decrypt_gcm(
            kek.expose(),
            &header.wrapped_dek,
            &header.iv,
            &header.tag,
            Some(kek_aad.as_bytes()),
        )?);
        drop(kek);
        if dek.len() != DEK_LEN {
            return Err(CryptoError::IntegrityError);
        }

        let digest = Sha256::digest(&header_bytes);
        let chunks = header.chunk_count();
        let mut buffer = vec![0u8; header.chunk_len(0) + TAG_LEN];
        let mut processed = 0u64;
        for index in 0..chunks {
            let len = header.chunk_len(index);
            let sealed = &mut buffer[..len + TAG_LEN];
            if read_full(input, sealed).await? < sealed.len() {
                warn!(key_id = %header.key_id, chunk = index, "Encrypted body truncated");
                return Err(CryptoError::IntegrityError);
            }

            let (ciphertext, tag) = sealed.split_at(len);
            let plaintext = aes::decrypt_gcm(
                &dek,
                ciphertext,
                &chunk_nonce(index),
                tag,
                Some(&chunk_aad(&digest, index, index + 1 == chunks)),
            )?;
            output.write_all(&plaintext).await?;

            processed += len as u64;
            self.report(processed, header.original_size);
        }

        let mut extra = [0u8; 1];
        if input.read(&mut extra).await? != 0 {
            warn!(key_id = %header.key_id, "Trailing bytes after encrypted body");
            return Err(CryptoError::IntegrityError);
        }
        output.flush().await?;

        info!(key_id = %header.key_id, size = header.original_size, chunks, "Stream decrypted");
        Ok(header)
    }

    /// Parse only the header of an encrypted stream.
    ///
    /// # Errors
    ///
    /// `CorruptHeader` for an unparseable header.
    pub async fn read_header<R>(&self, input: &mut R) -> Result<FileEncryptionHeader, CryptoError>
    where
        R: AsyncRead + Unpin + Send,
    {
        FileEncryptionHeader::read_from(input).await.map(|(header, _)| header)
    }

    /// Encrypt the file at `source` into `destination`.
    ///
    /// A partially written destination is removed on failure.
    ///
    /// # Errors
    ///
    /// As [`Self::encrypt_stream`].
    pub async fn encrypt_file(
        &self,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
        kek_id: &KeyId,
        ctx: &CallerContext,
    ) -> Result<FileEncryptionHeader, CryptoError> {
        let destination = destination.as_ref();
        let file = File::open(source.as_ref()).await?;
        let size = file.metadata().await?.len();
        let mut input = BufReader::new(file);
        let mut output = BufWriter::new(File::create(destination).await?);

        let result = self.encrypt_stream(&mut input, &mut output, kek_id, ctx, size).await;
        finish_file(result, destination).await
    }

    /// Decrypt the file at `source` into `destination`.
    ///
    /// A partially written destination is removed on failure.
    ///
    /// # Errors
    ///
    /// As [`Self::decrypt_stream`].
    pub async fn decrypt_file(
        &self,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
        ctx: &CallerContext,
    ) -> Result<FileEncryptionHeader, CryptoError> {
        let destination = destination.as_ref();
        let mut input = BufReader::new(File::open(source.as_ref()).await?);
        let mut output = BufWriter::new(File::create(destination).await?);

        let result = self.decrypt_stream(&mut input, &mut output, ctx).await;
        finish_file(result, destination).await
    }

    fn report(&self, processed: u64, total: u64) {
        if let Some(progress) = &self.progress {
            progress(processed, total);
        }
    }
}

async fn finish_file(
    result: Result<FileEncryptionHeader, CryptoError>,
    destination: &Path,
) -> Result<FileEncryptionHeader, CryptoError> {
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(destination).await {
            debug!(path = %destination.display(), error = %e, "Could not remove partial output");
        }
    }
    result
}

fn chunk_nonce(index: u64) -> [u8; IV_LEN] {
    let mut nonce = [0u8; IV_LEN];
    nonce[4..].copy_from_slice(&index.to_be_bytes());
    nonce
}

fn chunk_aad(header_digest: &[u8], index: u64, is_final: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header_digest.len() + 9);
    aad.extend_from_slice(header_digest);
    aad.extend_from_slice(&index.to_be_bytes());
    aad.push(u8::from(is_final));
    aad
}

/// Fill `buf` unless the stream ends first; returns the bytes read.
async fn read_full<R>(input: &mut R, buf: &mut [u8]) -> Result<usize, CryptoError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
