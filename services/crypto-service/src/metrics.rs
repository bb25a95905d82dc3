//! Prometheus metrics for key and file operations.

use crate::error::CryptoError;
use once_cell::sync::Lazy;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};
use std::time::Instant;

static OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "crypto_service_operations_total",
        "Total crypto service operations",
        &["operation", "status"]
    )
    .expect("Failed to register crypto_service_operations_total metric")
});

static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "crypto_service_errors_total",
        "Crypto service errors by code",
        &["code"]
    )
    .expect("Failed to register crypto_service_errors_total metric")
});

static LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "crypto_service_operation_latency_seconds",
        "Crypto service operation latency",
        &["operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0]
    )
    .expect("Failed to register crypto_service_operation_latency_seconds metric")
});

/// Times one operation and records its outcome when finished.
#[derive(Debug)]
pub struct OperationTimer {
    operation: &'static str,
    started: Instant,
}

impl OperationTimer {
    /// Start timing `operation`.
    #[must_use]
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
        }
    }

    /// Record count, latency and, on failure, the error code.
    pub fn finish<T>(self, outcome: &Result<T, CryptoError>) {
        let status = if outcome.is_ok() { "success" } else { "failure" };
        OPERATIONS
            .with_label_values(&[self.operation, status])
            .inc();
        LATENCY
            .with_label_values(&[self.operation])
            .observe(self.started.elapsed().as_secs_f64());
        if let Err(e) = outcome {
            ERRORS.with_label_values(&[e.code()]).inc();
        }
    }
}

/// Current value of the operation counter.
#[must_use]
pub fn operation_count(operation: &str, status: &str) -> f64 {
    OPERATIONS.with_label_values(&[operation, status]).get()
}

/// Current value of the error counter.
#[must_use]
pub fn error_count(code: &str) -> f64 {
    ERRORS.with_label_values(&[code]).get()
}
