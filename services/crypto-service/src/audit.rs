//! Audit trail for key lifecycle calls and every use of a managed key.
//!
//! Entries describe who did what to which key and whether it worked. They
//! never carry key material, plaintext or ciphertext.

use crate::error::CryptoError;
use crate::keys::{CallerContext, KeyId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_common::{LogEntry, LogLevel, LoggingClient};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Audited operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    /// Key generation
    KeyGenerate,
    /// Key rotation
    KeyRotate,
    /// Key deletion
    KeyDelete,
    /// Streaming file encryption
    FileEncrypt,
    /// Streaming file decryption
    FileDecrypt,
    /// Data encryption under a managed key
    Encrypt,
    /// Data decryption under a managed key
    Decrypt,
    /// Signature creation
    Sign,
    /// Signature verification
    Verify,
}

impl AuditOperation {
    /// Canonical name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::KeyGenerate => "KEY_GENERATE",
            Self::KeyRotate => "KEY_ROTATE",
            Self::KeyDelete => "KEY_DELETE",
            Self::FileEncrypt => "FILE_ENCRYPT",
            Self::FileDecrypt => "FILE_DECRYPT",
            Self::Encrypt => "ENCRYPT",
            Self::Decrypt => "DECRYPT",
            Self::Sign => "SIGN",
            Self::Verify => "VERIFY",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    /// Request correlation id
    pub correlation_id: String,
    /// When the operation finished
    pub timestamp: DateTime<Utc>,
    /// What was done
    pub operation: AuditOperation,
    /// Key involved, rendered
    pub key_id: Option<String>,
    /// Authenticated caller
    pub caller_identity: String,
    /// Calling service
    pub caller_service: String,
    /// Outcome
    pub success: bool,
    /// Error code on failure
    pub error_code: Option<String>,
    /// Source address
    pub source_ip: String,
    /// Extra non-secret context
    pub metadata: HashMap<String, String>,
}

impl AuditEntry {
    /// Build an entry from a caller context and an outcome.
    #[must_use]
    pub fn new<T>(
        operation: AuditOperation,
        key_id: Option<&KeyId>,
        ctx: &CallerContext,
        outcome: &Result<T, CryptoError>,
    ) -> Self {
        Self {
            correlation_id: ctx.correlation_id.clone(),
            timestamp: Utc::now(),
            operation,
            key_id: key_id.map(ToString::to_string),
            caller_identity: ctx.caller_identity.clone(),
            caller_service: ctx.caller_service.clone(),
            success: outcome.is_ok(),
            error_code: outcome.as_ref().err().map(|e| e.code().to_string()),
            source_ip: ctx.source_ip.clone(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata pair.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// JSON rendering.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Audit sink.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    /// Record one entry. Sinks absorb their own failures.
    async fn log_operation(&self, entry: AuditEntry);
}

/// Keeps entries in memory; used by tests and local tooling.
#[derive(Debug, Default)]
pub struct InMemoryAuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLogger {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded entries.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Entries for one operation.
    #[must_use]
    pub fn entries_for(&self, operation: AuditOperation) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.operation == operation)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditLogger for InMemoryAuditLogger {
    async fn log_operation(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}

/// Emits each entry as a structured event on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log_operation(&self, entry: AuditEntry) {
        let key_id = entry.key_id.as_deref().unwrap_or("-");
        let error_code = entry.error_code.as_deref().unwrap_or("-");
        if entry.success {
            info!(
                target: "audit",
                operation = entry.operation.as_str(),
                key_id,
                correlation_id = %entry.correlation_id,
                caller = %entry.caller_identity,
                caller_service = %entry.caller_service,
                "audit"
            );
        } else {
            warn!(
                target: "audit",
                operation = entry.operation.as_str(),
                key_id,
                error_code,
                correlation_id = %entry.correlation_id,
                caller = %entry.caller_identity,
                caller_service = %entry.caller_service,
                "audit"
            );
        }
    }
}

/// Ships entries to the central logging service.
#[derive(Debug, Clone)]
pub struct LoggingServiceAuditLogger {
    client: Arc<LoggingClient>,
}

impl LoggingServiceAuditLogger {
    /// Wrap a logging client.
    #[must_use]
    pub const fn new(client: Arc<LoggingClient>) -> Self {
        Self { client }
    }

    /// Push buffered entries out.
    pub async fn flush(&self) {
        self.client.flush().await;
    }
}

#[async_trait]
impl AuditLogger for LoggingServiceAuditLogger {
    async fn log_operation(&self, entry: AuditEntry) {
        let level = if entry.success {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let mut log = LogEntry::new(level, entry.operation.as_str(), self.client.service_id())
            .with_correlation_id(&entry.correlation_id)
            .with_metadata("audit", entry.to_json());
        log.timestamp = entry.timestamp;
        self.client.log(log).await;
    }
}
