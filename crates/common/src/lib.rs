//! Shared resilience and error-classification primitives for Ledgerkit
//!
//! This crate is transport-agnostic: nothing in it knows about HTTP or the
//! ledger API. It provides the error taxonomy and classification rules, the
//! backoff and retry machinery, the circuit breaker, and the worker pool
//! that `ledgerkit-client` composes into its batch engine.

pub mod error;
pub mod resilience;

pub use error::{
    ErrorCategory, ErrorClassification, ErrorClassifier, DEFAULT_RETRYABLE_PATTERNS,
    DEFAULT_RETRYABLE_STATUS_CODES,
};
pub use resilience::{
    retry_with_options, BackoffPolicy, BackoffPolicyBuilder, BreakerError, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics, CircuitState, Clock,
    ConfigError, MockClock, RetryError, RetryExecutor, RetryOptions, RetryOptionsBuilder,
    SystemClock, TaskOutcome, WorkItem, WorkerPool, WorkerPoolConfig, WorkerPoolError,
    MAX_BACKOFF_EXPONENT, MAX_WORKERS,
};
