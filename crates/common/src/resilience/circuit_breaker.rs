//! Circuit breaker for fast-failing against a degraded dependency
//!
//! The breaker tracks consecutive outcomes and moves through three states:
//!
//! - `Closed`: calls flow through; consecutive failures are counted.
//! - `Open`: calls are rejected without running. After `open_timeout` has
//!   elapsed since the state change, the next permission check moves the
//!   breaker to half-open.
//! - `HalfOpen`: probe calls are allowed. Consecutive successes close the
//!   breaker again; a single failure reopens it and restarts the timeout.
//!
//! Clones share state, so one breaker can guard a dependency across many
//! tasks. Time is read through the [`Clock`] trait so timeout transitions
//! are testable without real delays.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use super::ConfigError;

/// Abstraction over time sources for circuit breaker timeout logic.
///
/// Production code uses [`SystemClock`]; tests inject a mock clock to drive
/// open-timeout transitions deterministically.
pub trait Clock: Send + Sync + 'static {
    /// Get current instant (monotonic time)
    fn now(&self) -> Instant;
}

/// Real system clock implementation for production use
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<T: Clock> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Mock clock for deterministic tests.
///
/// Allows tests to control time progression without actual delays. Clones
/// share the same elapsed counter.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current instant
    pub fn new() -> Self {
        Self { start: Instant::now(), elapsed: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    /// Advance the mock clock by a duration
    pub fn advance(&self, duration: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += duration;
        }
    }

    /// Advance the mock clock by milliseconds (convenience method)
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let elapsed = self.elapsed.lock().map(|e| *e).unwrap_or(Duration::ZERO);
        self.start + elapsed
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls flow through
    Closed,
    /// Dependency considered down; calls rejected
    Open,
    /// Probing whether the dependency has recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Errors returned by breaker-guarded execution.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the operation was not run.
    #[error("circuit breaker is open; call rejected")]
    Open,

    /// The operation ran and failed; the failure was recorded.
    #[error("operation failed: {source}")]
    Operation { source: E },
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in the closed state that open the breaker
    pub failure_threshold: u32,
    /// Consecutive successes in the half-open state that close the breaker
    pub success_threshold: u32,
    /// How long the breaker stays open before allowing a probe
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder seeded with the defaults.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be at least 1"));
        }
        if self.open_timeout.is_zero() {
            return Err(ConfigError::invalid("open_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time breaker metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct StateCell {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    changed_at: Instant,
}

#[derive(Debug)]
struct Shared {
    cell: Mutex<StateCell>,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

/// Circuit breaker with consecutive-outcome thresholds.
///
/// Clones share state through an inner `Arc`, so a cloned breaker observes
/// and contributes to the same failure counts and transitions.
#[derive(Debug)]
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    clock: C,
    shared: Arc<Shared>,
}

impl<C: Clock + Clone> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            clock: self.clock.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker using the real system clock.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a breaker with the default configuration.
    pub fn with_defaults() -> Self {
        Self::with_clock(CircuitBreakerConfig::default(), SystemClock)
            .unwrap_or_else(|_| unreachable!("default configuration is valid"))
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with an explicit clock.
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> Result<Self, ConfigError> {
        config.validate()?;
        let changed_at = clock.now();
        Ok(Self {
            config,
            clock,
            shared: Arc::new(Shared {
                cell: Mutex::new(StateCell {
                    state: CircuitState::Closed,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    changed_at,
                }),
                total_calls: AtomicU64::new(0),
                rejected_calls: AtomicU64::new(0),
            }),
        })
    }

    fn lock_cell(&self) -> std::sync::MutexGuard<'_, StateCell> {
        self.shared.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether a call is currently allowed.
    ///
    /// In the open state this is where the open-timeout transition to
    /// half-open happens, measured from the instant the breaker opened.
    pub fn can_execute(&self) -> bool {
        let mut cell = self.lock_cell();
        match cell.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let waited = self.clock.now().saturating_duration_since(cell.changed_at);
                if waited >= self.config.open_timeout {
                    debug!(waited_ms = waited.as_millis() as u64, "open timeout elapsed, moving to half-open");
                    Self::transition(&mut cell, CircuitState::HalfOpen, self.clock.now());
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call outcome.
    pub fn record_success(&self) {
        let mut cell = self.lock_cell();
        cell.consecutive_failures = 0;
        match cell.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                cell.consecutive_successes += 1;
                if cell.consecutive_successes >= self.config.success_threshold {
                    debug!(successes = cell.consecutive_successes, "probe succeeded, closing breaker");
                    Self::transition(&mut cell, CircuitState::Closed, self.clock.now());
                }
            }
            // A success while open means the outcome arrived after the
            // breaker tripped; leave the state alone.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call outcome.
    pub fn record_failure(&self) {
        let mut cell = self.lock_cell();
        cell.consecutive_successes = 0;
        match cell.state {
            CircuitState::Closed => {
                cell.consecutive_failures += 1;
                if cell.consecutive_failures >= self.config.failure_threshold {
                    warn!(failures = cell.consecutive_failures, "failure threshold reached, opening breaker");
                    Self::transition(&mut cell, CircuitState::Open, self.clock.now());
                }
            }
            CircuitState::HalfOpen => {
                warn!("probe failed, reopening breaker");
                Self::transition(&mut cell, CircuitState::Open, self.clock.now());
            }
            CircuitState::Open => {}
        }
    }

    fn transition(cell: &mut StateCell, next: CircuitState, at: Instant) {
        cell.state = next;
        cell.consecutive_failures = 0;
        cell.consecutive_successes = 0;
        cell.changed_at = at;
    }

    /// The breaker's current state.
    ///
    /// Does not perform the open-to-half-open transition; that happens in
    /// [`Self::can_execute`].
    pub fn state(&self) -> CircuitState {
        self.lock_cell().state
    }

    /// Snapshot of the breaker's counters and state.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let cell = self.lock_cell();
        CircuitBreakerMetrics {
            state: cell.state,
            consecutive_failures: cell.consecutive_failures,
            consecutive_successes: cell.consecutive_successes,
            total_calls: self.shared.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.shared.rejected_calls.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker back to closed and clear its counters.
    pub fn reset(&self) {
        let mut cell = self.lock_cell();
        Self::transition(&mut cell, CircuitState::Closed, self.clock.now());
        self.shared.total_calls.store(0, Ordering::Relaxed);
        self.shared.rejected_calls.store(0, Ordering::Relaxed);
    }

    /// Run an async operation under the breaker.
    ///
    /// Rejects immediately with [`BreakerError::Open`] when the breaker does
    /// not permit the call; otherwise the outcome is recorded before being
    /// returned.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_execute() {
            self.shared.rejected_calls.fetch_add(1, Ordering::Relaxed);
            return Err(BreakerError::Open);
        }
        self.shared.total_calls.fetch_add(1, Ordering::Relaxed);
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(BreakerError::Operation { source: error })
            }
        }
    }

    /// Run a blocking operation under the breaker.
    pub fn call<F, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.can_execute() {
            self.shared.rejected_calls.fetch_add(1, Ordering::Relaxed);
            return Err(BreakerError::Open);
        }
        self.shared.total_calls.fetch_add(1, Ordering::Relaxed);
        match operation() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(BreakerError::Operation { source: error })
            }
        }
    }
}
