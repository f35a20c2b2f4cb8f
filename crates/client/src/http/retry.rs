//! Retrying HTTP execution over `reqwest`
//!
//! The first attempt sends the request as given. Retries send a fresh copy:
//! cloneable requests are re-cloned directly; requests whose body cannot be
//! cloned fall back to a bodyless rebuild that copies method, URL, and
//! headers. The response body is read fully exactly once per attempt,
//! whatever the status, so the connection is returned to the pool on every
//! exit path. Retry eligibility is decided from the status code only after
//! the body read.
//!
//! An optional pre-retry hook runs before each retry attempt (never before
//! the first) with the outgoing request and, when the prior failure carried
//! a response, that drained response; a hook error aborts the loop.

use std::sync::Arc;

use bytes::Bytes;
use ledgerkit_common::{BackoffPolicy, ErrorClassifier};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::errors::ClientError;

/// Longest slice of a response body quoted inside error messages.
const BODY_PREVIEW_CHARS: usize = 200;

/// A fully-read HTTP response.
///
/// The body has already been drained from the connection, so this value can
/// be inspected, retried against, or discarded freely.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.body)
            .map_err(|err| ClientError::Other { message: format!("invalid response body: {err}") })
    }

    /// The body as lossily-decoded text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Errors surfaced by [`HttpRetryExecutor::execute`].
#[derive(Debug, Error)]
pub enum HttpRetryError {
    /// The attempt budget ran out; carries the last status seen, when the
    /// final failure came from a response rather than the transport.
    #[error("http retries exhausted after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, last_status: Option<u16>, source: ClientError },

    /// The failure was classified as non-retryable.
    #[error("non-retryable http failure: {source}")]
    NonRetryable { source: ClientError },

    /// The pre-retry hook returned an error, aborting the loop.
    #[error("retry hook aborted the retry loop: {source}")]
    HookAborted { source: ClientError },

    /// The request could not be constructed.
    #[error("request construction failed: {source}")]
    Request { source: ClientError },

    /// The cancellation token fired.
    #[error("request cancelled")]
    Cancelled,
}

impl HttpRetryError {
    /// The underlying client error, when the failure carries one.
    pub fn client_error(&self) -> Option<&ClientError> {
        match self {
            Self::Exhausted { source, .. }
            | Self::NonRetryable { source }
            | Self::HookAborted { source }
            | Self::Request { source } => Some(source),
            Self::Cancelled => None,
        }
    }
}

/// Configuration for HTTP retry execution.
#[derive(Debug, Clone)]
pub struct HttpRetryOptions {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Delay schedule between attempts
    pub policy: BackoffPolicy,
    /// Status and message classification
    pub classifier: ErrorClassifier,
}

impl Default for HttpRetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            policy: BackoffPolicy::default(),
            // Ledger-service errors without a specific mapping arrive as
            // 5xx, so server errors are retried by default here.
            classifier: ErrorClassifier::new().retry_server_errors(true),
        }
    }
}

type RetryHook =
    Arc<dyn Fn(&reqwest::Request, Option<&HttpResponse>) -> Result<(), ClientError> + Send + Sync>;

/// A retrying HTTP executor bound to one `reqwest` client.
#[derive(Clone)]
pub struct HttpRetryExecutor {
    client: reqwest::Client,
    options: HttpRetryOptions,
    on_retry: Option<RetryHook>,
}

impl std::fmt::Debug for HttpRetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRetryExecutor")
            .field("options", &self.options)
            .field("has_retry_hook", &self.on_retry.is_some())
            .finish()
    }
}

impl HttpRetryExecutor {
    /// Create an executor with explicit options.
    pub fn new(client: reqwest::Client, options: HttpRetryOptions) -> Self {
        Self { client, options, on_retry: None }
    }

    /// Create an executor with the default retry policy.
    pub fn with_defaults(client: reqwest::Client) -> Self {
        Self::new(client, HttpRetryOptions::default())
    }

    /// Install a hook invoked before every retry attempt (never before the
    /// first attempt, never after the last) with the outgoing request and
    /// the response that triggered the retry, when there was one; transport
    /// failures pass `None`. A hook error aborts retrying.
    #[must_use]
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&reqwest::Request, Option<&HttpResponse>) -> Result<(), ClientError>
            + Send
            + Sync
            + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Execute a request built fresh for every attempt.
    ///
    /// The factory is the re-readable-body path: it must produce an
    /// equivalent request each time it is called.
    #[instrument(skip(self, cancel, factory), fields(max_retries = self.options.max_retries))]
    pub async fn execute<F>(
        &self,
        cancel: &CancellationToken,
        mut factory: F,
    ) -> Result<HttpResponse, HttpRetryError>
    where
        F: FnMut() -> Result<reqwest::Request, ClientError>,
    {
        let max_attempts = self.options.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;
        let mut last_response: Option<HttpResponse> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(HttpRetryError::Cancelled);
            }

            let request = factory().map_err(|source| HttpRetryError::Request { source })?;
            if attempt > 0 {
                if let Some(hook) = &self.on_retry {
                    hook(&request, last_response.as_ref())
                        .map_err(|source| HttpRetryError::HookAborted { source })?;
                }
            }
            let method = request.method().clone();
            let url = request.url().clone();

            let attempt_future = async {
                let response =
                    self.client.execute(request).await.map_err(ClientError::from)?;
                let status = response.status();
                let headers = response.headers().clone();
                let body = response.bytes().await.map_err(ClientError::from)?;
                Ok::<HttpResponse, ClientError>(HttpResponse { status, headers, body })
            };

            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(HttpRetryError::Cancelled),
                outcome = attempt_future => outcome,
            };

            match outcome {
                Ok(response) if response.status.is_success() => {
                    if attempt > 0 {
                        debug!(%method, %url, retries = attempt, "request succeeded after retries");
                    }
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status.as_u16();
                    let error = ClientError::from_status(status, status_message(&response));

                    if attempt + 1 >= max_attempts {
                        warn!(%method, %url, status, attempts = max_attempts, "http retries exhausted");
                        return Err(HttpRetryError::Exhausted {
                            attempts: max_attempts,
                            last_status: Some(status),
                            source: error,
                        });
                    }
                    if !self.options.classifier.is_retryable_status(status) {
                        return Err(HttpRetryError::NonRetryable { source: error });
                    }
                    last_response = Some(response);

                    debug!(%method, %url, status, attempt = attempt + 1, "retrying after status failure");
                    self.backoff(cancel, attempt).await?;
                    attempt += 1;
                }
                Err(error) => {
                    if attempt + 1 >= max_attempts {
                        warn!(%method, %url, error = %error, attempts = max_attempts, "http retries exhausted");
                        return Err(HttpRetryError::Exhausted {
                            attempts: max_attempts,
                            last_status: None,
                            source: error,
                        });
                    }
                    if !self.options.classifier.is_retryable(&error) {
                        return Err(HttpRetryError::NonRetryable { source: error });
                    }
                    last_response = None;

                    debug!(%method, %url, error = %error, attempt = attempt + 1, "retrying after transport failure");
                    self.backoff(cancel, attempt).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Execute a single prepared request, re-cloning it between attempts.
    ///
    /// The first attempt sends the request exactly as given, streaming body
    /// included. Retries send clones; when the body cannot be cloned they
    /// fall back to a bodyless rebuild that copies method, URL, and headers.
    pub async fn execute_request(
        &self,
        cancel: &CancellationToken,
        request: reqwest::Request,
    ) -> Result<HttpResponse, HttpRetryError> {
        let template = clone_request(&request);
        let mut original = Some(request);
        self.execute(cancel, move || {
            Ok(original.take().unwrap_or_else(|| clone_request(&template)))
        })
        .await
    }

    async fn backoff(&self, cancel: &CancellationToken, attempt: u32) -> Result<(), HttpRetryError> {
        let delay = self.options.policy.delay(attempt);
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = cancel.cancelled() => Err(HttpRetryError::Cancelled),
        }
    }
}

/// Clone a request for resubmission, dropping the body when it cannot be
/// duplicated.
fn clone_request(request: &reqwest::Request) -> reqwest::Request {
    request.try_clone().unwrap_or_else(|| {
        let mut clone = reqwest::Request::new(request.method().clone(), request.url().clone());
        *clone.headers_mut() = request.headers().clone();
        *clone.timeout_mut() = request.timeout().copied();
        clone
    })
}

/// Build a concise error message from a failed response.
fn status_message(response: &HttpResponse) -> String {
    let preview: String =
        String::from_utf8_lossy(&response.body).chars().take(BODY_PREVIEW_CHARS).collect();
    let trimmed = preview.trim();
    if trimmed.is_empty() {
        response.status.canonical_reason().unwrap_or("unknown status").to_string()
    } else {
        trimmed.to_string()
    }
}
