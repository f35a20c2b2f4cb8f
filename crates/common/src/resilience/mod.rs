//! Resilience primitives for calling unreliable services
//!
//! This module provides the building blocks the client crates compose:
//!
//! - [`backoff`]: exponential backoff schedules with bounded jitter
//! - [`retry`]: a cancellation-aware retry executor
//! - [`circuit_breaker`]: a three-state breaker for failing dependencies
//! - [`worker_pool`]: bounded-queue fan-out over a fixed set of workers

pub mod backoff;
pub mod circuit_breaker;
pub mod retry;
pub mod worker_pool;

use thiserror::Error;

pub use backoff::{BackoffPolicy, BackoffPolicyBuilder, MAX_BACKOFF_EXPONENT};
pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitBreakerMetrics, CircuitState, Clock, MockClock, SystemClock,
};
pub use retry::{retry_with_options, RetryError, RetryExecutor, RetryOptions, RetryOptionsBuilder};
pub use worker_pool::{
    TaskOutcome, WorkItem, WorkerPool, WorkerPoolConfig, WorkerPoolError, MAX_WORKERS,
};

/// Configuration validation errors shared by the resilience builders.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value is out of its valid range.
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    /// Create an invalid-configuration error from any message.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}
