//! Shared library for cross-cutting concerns in crypto platform Rust services.
//!
//! This crate provides centralized implementations for:
//! - Error types with retryability classification
//! - Circuit breaker pattern for resilience
//! - Two-tier namespaced cache client with local fallback
//! - Batched logging service client
//! - `tracing` subscriber setup
//! - Atomic metrics helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache_client;
pub mod circuit_breaker;
pub mod error;
pub mod logging_client;
pub mod metrics;
pub mod remote_cache;
pub mod tracing_config;

pub use cache_client::{CacheClient, CacheClientConfig, KeyCacheHelper, NAMESPACE_DELIMITER};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::PlatformError;
pub use logging_client::{
    InMemoryLogTransport, LogEntry, LogLevel, LogTransport, LoggingClient, LoggingClientConfig,
};
pub use metrics::{CacheMetrics, Counter, Gauge};
pub use remote_cache::{InMemoryRemoteCache, RemoteCache};
pub use tracing_config::{init_tracing, TracingConfig};
