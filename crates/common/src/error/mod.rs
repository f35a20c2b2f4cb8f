//! Error classification shared across ledgerkit crates
//!
//! This module provides the classification layer that the retry executor,
//! batch processor, and summary aggregation all build on. It deliberately
//! avoids runtime type inspection: an error participates in classification by
//! implementing [`ErrorClassification`], a small capability trait exposing the
//! error's category, an optional HTTP status code, and whether the error is a
//! cancellation signal.
//!
//! # Architecture
//!
//! Three pieces cooperate:
//!
//! 1. **[`ErrorCategory`]**: the failure taxonomy used to bucket errors in
//!    batch summaries (validation, not_found, authentication, rate_limit,
//!    timeout, network, conflict, internal, unclassified).
//!
//! 2. **[`ErrorClassification`] trait**: implemented by concrete error types
//!    to surface their category, status code, and cancellation flag. Default
//!    methods mean most implementors only write `category()`.
//!
//! 3. **[`ErrorClassifier`]**: a value object deciding retryability from a
//!    configured set of message patterns and status codes. Constructed once
//!    per retry configuration and consumed read-only.
//!
//! Cancellations are never retryable, regardless of message content or any
//! status code the error claims to carry.

use std::collections::HashSet;
use std::fmt;

/// Failure taxonomy used for retry decisions and summary bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCategory {
    /// Input failed validation; retrying the same payload cannot succeed
    Validation,
    /// The referenced resource does not exist
    NotFound,
    /// Credentials missing, expired, or insufficient
    Authentication,
    /// The service asked the caller to slow down
    RateLimit,
    /// The operation exceeded its deadline
    Timeout,
    /// Transport-level connectivity failure
    Network,
    /// The request conflicts with existing state (e.g. duplicate key)
    Conflict,
    /// Server-side failure inside the remote service
    Internal,
    /// No richer classification is available
    Unclassified,
}

impl ErrorCategory {
    /// Stable label used as the bucket key in batch summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
            Self::Unclassified => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Capability trait for errors that participate in retry classification.
///
/// Implementors surface what the classifier needs through explicit accessors
/// rather than downcasting. The defaults cover errors that carry no status
/// code and cannot represent cancellation, so most implementations only
/// provide `category()`.
pub trait ErrorClassification {
    /// The taxonomy bucket this error belongs to.
    fn category(&self) -> ErrorCategory;

    /// The HTTP status code associated with this error, when one exists.
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Whether this error represents a cancellation or deadline signal.
    ///
    /// Cancellations are fatal to the in-flight operation and are never
    /// retried or reclassified.
    fn is_cancellation(&self) -> bool {
        false
    }
}

/// Message substrings that indicate a transient failure worth retrying.
pub const DEFAULT_RETRYABLE_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "timeout",
    "deadline exceeded",
    "too many requests",
    "rate limit",
    "service unavailable",
];

/// Status codes outside the 5xx class that are retried by default.
pub const DEFAULT_RETRYABLE_STATUS_CODES: &[u16] = &[429];

/// Decides whether a failure is worth retrying.
///
/// The decision combines three signals, checked in order:
///
/// 1. cancellation, which is never retryable;
/// 2. message patterns, matched case-insensitively as substrings against
///    the configured pattern set;
/// 3. status code, either membership in the configured retryable set or any
///    5xx when `retry_server_errors` is enabled.
///
/// Immutable once constructed; cheap to clone into retry options.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    patterns: Vec<String>,
    retryable_status_codes: HashSet<u16>,
    retry_server_errors: bool,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_RETRYABLE_PATTERNS.iter().map(|p| (*p).to_string()).collect(),
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.iter().copied().collect(),
            retry_server_errors: true,
        }
    }
}

impl ErrorClassifier {
    /// Create a classifier with the default pattern and status-code sets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a classifier with no patterns and no retryable status codes.
    ///
    /// Useful as a starting point when the caller wants full control over
    /// what is considered transient.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            retryable_status_codes: HashSet::new(),
            retry_server_errors: false,
        }
    }

    /// Add a message pattern (matched case-insensitively).
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into().to_lowercase());
        self
    }

    /// Add a retryable status code.
    pub fn with_status_code(mut self, code: u16) -> Self {
        self.retryable_status_codes.insert(code);
        self
    }

    /// Control whether every 5xx response is considered retryable.
    pub fn retry_server_errors(mut self, retry: bool) -> Self {
        self.retry_server_errors = retry;
        self
    }

    /// Decide retryability for a classified error.
    pub fn is_retryable<E>(&self, error: &E) -> bool
    where
        E: fmt::Display + ErrorClassification,
    {
        if error.is_cancellation() {
            return false;
        }

        let message = error.to_string().to_lowercase();
        if self.patterns.iter().any(|pattern| message.contains(pattern.as_str())) {
            return true;
        }

        error.status_code().is_some_and(|code| self.is_retryable_status(code))
    }

    /// Decide retryability from a status code alone.
    ///
    /// Used by the HTTP retry executor, where the response status is the only
    /// signal available before an error value is constructed.
    pub fn is_retryable_status(&self, code: u16) -> bool {
        if self.retryable_status_codes.contains(&code) {
            return true;
        }
        self.retry_server_errors && (500..=599).contains(&code)
    }
}
