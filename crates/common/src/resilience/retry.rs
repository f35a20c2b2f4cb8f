//! Generic retry executor with cancellation-aware backoff
//!
//! Drives a fallible async operation through a bounded number of attempts,
//! deciding retryability through an [`ErrorClassifier`] and spacing attempts
//! with a [`BackoffPolicy`]. Every wait races the caller's
//! [`CancellationToken`], so a shutdown signal interrupts a backoff sleep
//! immediately instead of letting it run to completion.
//!
//! The executor itself is stateless across calls; all state lives in the
//! per-call loop.

use std::fmt;
use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{BackoffPolicy, ConfigError};
use crate::error::{ErrorClassification, ErrorClassifier};

/// Errors produced by the retry loop.
///
/// Every variant preserves the underlying cause where one exists, so callers
/// can walk the source chain for diagnosis.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The attempt budget ran out; wraps the last underlying error.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },

    /// The failure was classified as non-retryable on its first occurrence.
    #[error("operation failed with non-retryable error: {source}")]
    NonRetryable { source: E },

    /// The cancellation token fired before or during a backoff wait.
    ///
    /// Carries the error from the attempt that preceded the wait, when the
    /// cancellation interrupted one.
    #[error("operation cancelled while retrying")]
    Cancelled { source: Option<E> },
}

impl<E> RetryError<E> {
    /// The underlying operation error, when one was observed.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::NonRetryable { source } => Some(source),
            Self::Cancelled { source } => source,
        }
    }
}

/// Configuration for a retry loop; immutable once constructed.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Number of retries after the initial attempt; total invocations are
    /// `max_retries + 1`
    pub max_retries: u32,
    /// Delay schedule between attempts
    pub policy: BackoffPolicy,
    /// Retryability decision
    pub classifier: ErrorClassifier,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            policy: BackoffPolicy::default(),
            classifier: ErrorClassifier::default(),
        }
    }
}

impl RetryOptions {
    /// Create an options builder seeded with the defaults.
    pub fn builder() -> RetryOptionsBuilder {
        RetryOptionsBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate()
    }
}

/// Builder for [`RetryOptions`].
#[derive(Debug, Default)]
pub struct RetryOptionsBuilder {
    options: RetryOptions,
}

impl RetryOptionsBuilder {
    pub fn new() -> Self {
        Self { options: RetryOptions::default() }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.options.max_retries = retries;
        self
    }

    pub fn policy(mut self, policy: BackoffPolicy) -> Self {
        self.options.policy = policy;
        self
    }

    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.options.classifier = classifier;
        self
    }

    pub fn build(self) -> Result<RetryOptions, ConfigError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// The retry executor.
///
/// Holds only configuration; safe to share and reuse across calls.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    options: RetryOptions,
}

impl RetryExecutor {
    /// Create an executor with the given options.
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    /// Create an executor with default options.
    pub fn with_defaults() -> Self {
        Self::new(RetryOptions::default())
    }

    /// The options this executor was built with.
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Execute an operation with retry semantics.
    ///
    /// The operation runs at most `max_retries + 1` times. A success returns
    /// immediately. A failure on the final attempt returns
    /// [`RetryError::Exhausted`] wrapping the last error; a failure the
    /// classifier rejects returns [`RetryError::NonRetryable`] without
    /// further attempts. Between attempts the executor sleeps for the
    /// policy's delay, racing the cancellation token; a cancellation during
    /// the wait (or observed before an attempt) returns
    /// [`RetryError::Cancelled`] carrying the prior error when there is one.
    #[instrument(skip(self, cancel, operation), fields(max_retries = self.options.max_retries))]
    pub async fn execute<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Debug + fmt::Display + ErrorClassification,
    {
        let max_attempts = self.options.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                debug!(attempt, "cancellation observed before attempt");
                return Err(RetryError::Cancelled { source: None });
            }

            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if attempt + 1 >= max_attempts {
                        warn!(attempts = max_attempts, error = %error, "retries exhausted");
                        return Err(RetryError::Exhausted { attempts: max_attempts, source: error });
                    }

                    if !self.options.classifier.is_retryable(&error) {
                        debug!(error = %error, "non-retryable failure, giving up");
                        return Err(RetryError::NonRetryable { source: error });
                    }

                    let delay = self.options.policy.delay(attempt);
                    debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %error, "backing off before retry");

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            debug!("cancelled during backoff wait");
                            return Err(RetryError::Cancelled { source: Some(error) });
                        }
                    }

                    attempt += 1;
                }
            }
        }
    }
}

/// Convenience function: build an executor and run one operation through it.
pub async fn retry_with_options<F, Fut, T, E>(
    options: RetryOptions,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Debug + fmt::Display + ErrorClassification,
{
    RetryExecutor::new(options).execute(cancel, operation).await
}
