//! Batched client for the central logging service.
//!
//! Entries are buffered and shipped in batches through a [`LogTransport`].
//! When the transport fails or its circuit is open, the batch is written to
//! local `tracing` output instead so no entry is silently lost.

use crate::{CircuitBreaker, CircuitBreakerConfig, PlatformError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Log level matching the logging service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Convert to string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Log entry shipped to the logging service.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Log level
    pub level: LogLevel,
    /// Event name or message
    pub message: String,
    /// Emitting service
    pub service_id: String,
    /// Correlation ID for request tracing
    pub correlation_id: Option<String>,
    /// Structured payload
    pub metadata: HashMap<String, String>,
    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl LogEntry {
    /// Create a new log entry.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            service_id: service_id.into(),
            correlation_id: None,
            metadata: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Add correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add metadata.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Wire to the logging service.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Deliver one batch.
    async fn send_batch(&self, entries: &[LogEntry]) -> Result<(), PlatformError>;
}

/// Transport that keeps delivered batches in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogTransport {
    delivered: Arc<Mutex<Vec<LogEntry>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLogTransport {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the logging service reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    /// Entries delivered so far.
    #[must_use]
    pub fn delivered(&self) -> Vec<LogEntry> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl LogTransport for InMemoryLogTransport {
    async fn send_batch(&self, entries: &[LogEntry]) -> Result<(), PlatformError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(PlatformError::unavailable("logging service unreachable"));
        }
        self.delivered.lock().extend_from_slice(entries);
        Ok(())
    }
}

/// Logging client configuration.
#[derive(Debug, Clone)]
pub struct LoggingClientConfig {
    /// Batch size before flushing
    pub batch_size: usize,
    /// Maximum buffered entries; newer entries are dropped beyond this
    pub buffer_size: usize,
    /// Service identifier
    pub service_id: String,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for LoggingClientConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            buffer_size: 10_000,
            service_id: "crypto-service".to_string(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl LoggingClientConfig {
    /// Create config with custom service ID.
    #[must_use]
    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = service_id.into();
        self
    }

    /// Create config with custom batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }
}

/// Logging client with batching and circuit breaker.
pub struct LoggingClient {
    config: LoggingClientConfig,
    transport: Arc<dyn LogTransport>,
    buffer: Mutex<VecDeque<LogEntry>>,
    circuit_breaker: CircuitBreaker,
}

impl std::fmt::Debug for LoggingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingClient")
            .field("config", &self.config)
            .field("buffered", &self.buffer_size())
            .finish_non_exhaustive()
    }
}

impl LoggingClient {
    /// Create a new logging client over `transport`.
    #[must_use]
    pub fn new(config: LoggingClientConfig, transport: Arc<dyn LogTransport>) -> Self {
        Self {
            circuit_breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            buffer: Mutex::new(VecDeque::with_capacity(config.batch_size)),
            transport,
            config,
        }
    }

    /// Buffer an entry, flushing once a full batch is pending.
    pub async fn log(&self, entry: LogEntry) {
        let should_flush = {
            let mut buffer = self.buffer.lock();
            if buffer.len() < self.config.buffer_size {
                buffer.push_back(entry);
            } else {
                warn!(service = %self.config.service_id, "Log buffer full, dropping entry");
            }
            buffer.len() >= self.config.batch_size
        };

        if should_flush {
            self.flush().await;
        }
    }

    /// Log an info message.
    pub async fn info(&self, message: impl Into<String>) {
        let entry = LogEntry::new(LogLevel::Info, message, &self.config.service_id);
        self.log(entry).await;
    }

    /// Log an error message.
    pub async fn error(&self, message: impl Into<String>) {
        let entry = LogEntry::new(LogLevel::Error, message, &self.config.service_id);
        self.log(entry).await;
    }

    /// Ship buffered entries to the logging service.
    pub async fn flush(&self) {
        let entries: Vec<LogEntry> = self.buffer.lock().drain(..).collect();
        if entries.is_empty() {
            return;
        }

        if !self.circuit_breaker.allow_request() {
            warn!("Logging circuit breaker open, falling back to local tracing");
            entries.iter().for_each(Self::log_locally);
            return;
        }

        match self.transport.send_batch(&entries).await {
            Ok(()) => {
                self.circuit_breaker.record_success();
                debug!(count = entries.len(), "Flushed log batch");
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                warn!(error = %e, count = entries.len(), "Log batch delivery failed, falling back to local tracing");
                entries.iter().for_each(Self::log_locally);
            }
        }
    }

    fn log_locally(entry: &LogEntry) {
        let correlation = entry.correlation_id.as_deref().unwrap_or("-");
        let metadata = serde_json::to_string(&entry.metadata).unwrap_or_default();

        match entry.level {
            LogLevel::Debug => debug!(
                correlation_id = correlation,
                service = %entry.service_id,
                metadata = %metadata,
                "{}",
                entry.message
            ),
            LogLevel::Info => info!(
                correlation_id = correlation,
                service = %entry.service_id,
                metadata = %metadata,
                "{}",
                entry.message
            ),
            LogLevel::Warn => warn!(
                correlation_id = correlation,
                service = %entry.service_id,
                metadata = %metadata,
                "{}",
                entry.message
            ),
            LogLevel::Error => error!(
                correlation_id = correlation,
                service = %entry.service_id,
                metadata = %metadata,
                "{}",
                entry.message
            ),
        }
    }

    /// Get the current buffer size.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Get the service ID.
    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.config.service_id
    }
}
