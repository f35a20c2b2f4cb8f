//! Client error taxonomy for the ledger API
//!
//! Failures from the ledger service are mapped into a fixed set of
//! categories so the retry machinery can classify them without inspecting
//! concrete error types downstream. Each variant owns its message; the
//! original transport error is flattened into text at the conversion
//! boundary so the type stays `Clone` and can live inside batch results.

use ledgerkit_common::{ErrorCategory, ErrorClassification};
use thiserror::Error;

/// Errors surfaced by the ledger client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The request payload failed server-side validation.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// The referenced entity does not exist.
    #[error("resource not found: {message}")]
    NotFound { message: String },

    /// The request was rejected for missing or invalid credentials.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// The service throttled the request.
    #[error("rate limited: {message}")]
    RateLimit { message: String },

    /// The request or response timed out.
    /// Display text keeps the word "timeout" so pattern classification
    /// marks it retryable.
    #[error("request timeout: {message}")]
    Timeout { message: String },

    /// The request never produced a response.
    #[error("network error: {message}")]
    Network { message: String },

    /// The request conflicts with existing state.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// The service failed; carries the observed status code when known.
    #[error("server error (status {status}): {message}")]
    Internal { status: u16, message: String },

    /// A circuit breaker rejected the call before it was sent.
    ///
    /// The message deliberately reads as a service-unavailable condition so
    /// pattern-based classification treats it as retryable.
    #[error("service unavailable: circuit breaker is open")]
    CircuitOpen,

    /// The governing cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A failure that matched no known mapping.
    #[error("{message}")]
    Other { message: String },
}

impl ClientError {
    /// Map an HTTP status code and response text to an error variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 | 422 => Self::Validation { message },
            404 => Self::NotFound { message },
            401 | 403 => Self::Authentication { message },
            429 => Self::RateLimit { message },
            408 => Self::Timeout { message },
            409 => Self::Conflict { message },
            500..=599 => Self::Internal { status, message },
            _ => Self::Other { message },
        }
    }

    /// The originating HTTP status, when one is known or implied.
    pub fn status(&self) -> Option<u16> {
        self.status_code()
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout { message: err.to_string() };
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        Self::Network { message: err.to_string() }
    }
}

impl ErrorClassification for ClientError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::RateLimit { .. } => ErrorCategory::RateLimit,
            Self::Timeout { .. } | Self::Cancelled => ErrorCategory::Timeout,
            Self::Network { .. } => ErrorCategory::Network,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::Internal { .. } => ErrorCategory::Internal,
            Self::CircuitOpen | Self::Other { .. } => ErrorCategory::Unclassified,
        }
    }

    // Errors with no mapped status fall back to a category-derived code:
    // 503 for transport faults, 500 for unclassified failures, mirroring the
    // server's envelope. This makes them retryable under a
    // retry-server-errors policy; see DESIGN.md before changing.
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Validation { .. } => Some(400),
            Self::NotFound { .. } => Some(404),
            Self::Authentication { .. } => Some(401),
            Self::RateLimit { .. } => Some(429),
            Self::Timeout { .. } => Some(408),
            Self::Conflict { .. } => Some(409),
            Self::Internal { status, .. } => Some(*status),
            Self::Network { .. } => Some(503),
            Self::Other { .. } => Some(500),
            Self::CircuitOpen | Self::Cancelled => None,
        }
    }

    fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
