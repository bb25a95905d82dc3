//! Circuit breaker guarding calls to remote platform services.
//!
//! The breaker is consulted on every call to a remote tier. While it is open
//! the caller skips the remote entirely and serves from its local fallback,
//! so an unreachable dependency costs one timeout per `failure_threshold`
//! calls instead of one per call.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests are allowed
    Closed,
    /// Requests are rejected until the open timeout elapses
    Open,
    /// A limited number of trial requests are allowed
    HalfOpen,
}

impl CircuitState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing the circuit
    pub success_threshold: u32,
    /// Time spent open before probing again
    pub open_timeout: Duration,
    /// Maximum trial requests while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold.
    #[must_use]
    pub const fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the open timeout.
    #[must_use]
    pub const fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

/// Lock-light circuit breaker.
///
/// State lives in an atomic so the hot path (`allow_request` while closed)
/// never takes a lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
    half_open_requests: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed.to_u8()),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            half_open_requests: AtomicU32::new(0),
            opened_at: Mutex::new(None),
        }
    }

    /// Create a circuit breaker with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Whether a request may proceed to the protected service.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let mut opened_at = self.opened_at.lock();
                let elapsed = opened_at.map_or(true, |at| at.elapsed() >= self.config.open_timeout);
                if elapsed && self.state() == CircuitState::Open {
                    *opened_at = None;
                    self.successes.store(0, Ordering::Release);
                    self.half_open_requests.store(1, Ordering::Release);
                    self.set_state(CircuitState::HalfOpen);
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                self.half_open_requests.fetch_add(1, Ordering::AcqRel)
                    < self.config.half_open_max_requests
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.failures.store(0, Ordering::Release);
                    self.successes.store(0, Ordering::Release);
                    self.set_state(CircuitState::Closed);
                }
            }
            CircuitState::Closed => self.failures.store(0, Ordering::Release),
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        let should_open = match self.state() {
            CircuitState::Closed => failures >= self.config.failure_threshold,
            // A failed trial re-opens immediately
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            *self.opened_at.lock() = Some(Instant::now());
            self.successes.store(0, Ordering::Release);
            self.set_state(CircuitState::Open);
        }
    }

    /// Reset to closed.
    pub fn reset(&self) {
        *self.opened_at.lock() = None;
        self.failures.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
        self.half_open_requests.store(0, Ordering::Release);
        self.set_state(CircuitState::Closed);
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }
}
