//! Atomic counters and gauges for in-process instrumentation.
//!
//! These are deliberately tiny: they back the cache client's hit/miss
//! accounting and render to the Prometheus text format when a service wants
//! to expose them next to its registry-based metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter that can be reset.
#[derive(Debug)]
pub struct Counter {
    name: String,
    help: String,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    #[must_use]
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: AtomicU64::new(0),
        }
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `amount`.
    pub fn inc_by(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero.
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// Metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render in Prometheus text format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n",
            name = self.name,
            help = self.help,
            value = self.get()
        )
    }
}

/// Gauge holding the latest observed value.
#[derive(Debug)]
pub struct Gauge {
    name: String,
    help: String,
    value: AtomicU64,
}

impl Gauge {
    /// Create a new gauge.
    #[must_use]
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: AtomicU64::new(0),
        }
    }

    /// Set the value.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Render in Prometheus text format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n",
            name = self.name,
            help = self.help,
            value = self.get()
        )
    }
}

/// Two-tier cache accounting.
#[derive(Debug)]
pub struct CacheMetrics {
    /// Local tier hits
    pub local_hits: Counter,
    /// Local tier misses
    pub local_misses: Counter,
    /// Remote tier failures (errors, timeouts, open circuit)
    pub remote_failures: Counter,
    /// Entries currently held by the local tier
    pub local_size: Gauge,
}

impl CacheMetrics {
    /// Create cache metrics with the given name prefix.
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            local_hits: Counter::new(
                format!("{prefix}_local_cache_hits_total"),
                "Local cache tier hits",
            ),
            local_misses: Counter::new(
                format!("{prefix}_local_cache_misses_total"),
                "Local cache tier misses",
            ),
            remote_failures: Counter::new(
                format!("{prefix}_remote_cache_failures_total"),
                "Remote cache tier failures absorbed by fallback",
            ),
            local_size: Gauge::new(
                format!("{prefix}_local_cache_size"),
                "Entries held by the local cache tier",
            ),
        }
    }

    /// Reset the local tier counters; remote accounting is kept.
    pub fn reset_local(&self) {
        self.local_hits.reset();
        self.local_misses.reset();
        self.local_size.set(0);
    }

    /// Render all metrics in Prometheus text format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        [
            self.local_hits.to_prometheus(),
            self.local_misses.to_prometheus(),
            self.remote_failures.to_prometheus(),
            self.local_size.to_prometheus(),
        ]
        .concat()
    }
}
