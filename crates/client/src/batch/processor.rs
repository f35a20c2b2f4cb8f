//! Batch transaction submission
//!
//! Drives many transaction-creation calls through the worker pool, an
//! optional circuit breaker, and a per-item retry loop, producing one
//! [`BatchResult`] per input. Item failures are contained in their results;
//! only `stop_on_error` promotes a failure to the batch level, and even
//! then every result collected so far is handed back.
//!
//! Inputs are processed in chunks of `batch_size`. Within a chunk items run
//! concurrently with no ordering guarantee; results are re-sorted by index
//! before they are returned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ledgerkit_common::{
    CircuitBreaker, ErrorClassifier, TaskOutcome, WorkItem, WorkerPool, WorkerPoolConfig,
    WorkerPoolError,
};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::batch::summary::BatchResult;
use crate::errors::ClientError;

/// Largest delay exponent used by the per-item retry schedule.
const MAX_ITEM_BACKOFF_EXPONENT: i64 = 30;

/// One transaction to submit.
///
/// The payload is opaque to the batch engine; only the idempotency key is
/// inspected and, when absent, synthesized.
#[derive(Debug, Clone)]
pub struct TransactionInput {
    /// Caller-supplied idempotency key; filled in by the processor when empty
    pub idempotency_key: Option<String>,
    /// Transaction body forwarded verbatim to the creator
    pub payload: serde_json::Value,
}

impl TransactionInput {
    /// Create an input with no idempotency key.
    pub fn new(payload: serde_json::Value) -> Self {
        Self { idempotency_key: None, payload }
    }

    /// Create an input with a caller-chosen idempotency key.
    pub fn with_idempotency_key(payload: serde_json::Value, key: impl Into<String>) -> Self {
        Self { idempotency_key: Some(key.into()), payload }
    }
}

/// Capability for creating one transaction against the ledger service.
///
/// The wire protocol behind this trait is out of the batch engine's hands;
/// implementations are expected to be idempotent with respect to the key.
#[async_trait]
pub trait TransactionCreator: Send + Sync {
    /// Create a transaction, returning its service-assigned identifier.
    async fn create(
        &self,
        org_id: &str,
        ledger_id: &str,
        input: &TransactionInput,
        idempotency_key: &str,
    ) -> Result<String, ClientError>;
}

/// Callback invoked after each item completes.
pub type ProgressCallback = Arc<dyn Fn(usize, usize, &BatchResult) + Send + Sync>;

/// Options governing one batch run.
#[derive(Clone)]
pub struct BatchOptions {
    /// Concurrent workers; values below 1 are normalized to 1
    pub concurrency: usize,
    /// Items per chunk; 0 falls back to the default
    pub batch_size: usize,
    /// Retries per item after its initial attempt
    pub retry_count: u32,
    /// Base delay for the per-item retry schedule
    pub retry_delay: Duration,
    /// Prefix for synthesized idempotency keys; empty falls back to the default
    pub idempotency_key_prefix: String,
    /// Abort the batch on the first failed item
    pub stop_on_error: bool,
    /// Completion callback, invoked as `(completed, total, result)`
    pub on_progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOptions")
            .field("concurrency", &self.concurrency)
            .field("batch_size", &self.batch_size)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("idempotency_key_prefix", &self.idempotency_key_prefix)
            .field("stop_on_error", &self.stop_on_error)
            .field("has_progress_callback", &self.on_progress.is_some())
            .finish()
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 100,
            retry_count: 3,
            retry_delay: Duration::from_millis(100),
            idempotency_key_prefix: "batch".to_string(),
            stop_on_error: false,
            on_progress: None,
        }
    }
}

impl BatchOptions {
    /// Clamp out-of-range values back to their documented defaults.
    pub fn normalized(mut self) -> Self {
        if self.concurrency == 0 {
            warn!("batch concurrency 0 normalized to 1");
            self.concurrency = 1;
        }
        if self.batch_size == 0 {
            self.batch_size = 100;
        }
        if self.retry_delay.is_zero() {
            self.retry_delay = Duration::from_millis(100);
        }
        if self.idempotency_key_prefix.is_empty() {
            self.idempotency_key_prefix = "batch".to_string();
        }
        self
    }
}

/// Batch-level failures.
///
/// Item failures never appear here unless `stop_on_error` promotes one.
#[derive(Debug, Error)]
pub enum BatchError {
    /// `stop_on_error` was set and an item failed; carries everything
    /// completed up to the abort so finished work is not lost.
    #[error("batch aborted on first error: {source}")]
    Aborted { results: Vec<BatchResult>, source: ClientError },

    /// The worker pool itself failed.
    #[error(transparent)]
    Pool(#[from] WorkerPoolError),
}

/// The batch processor.
pub struct BatchProcessor {
    creator: Arc<dyn TransactionCreator>,
    breaker: Option<CircuitBreaker>,
    classifier: ErrorClassifier,
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor").field("has_breaker", &self.breaker.is_some()).finish()
    }
}

impl BatchProcessor {
    /// Create a processor over a transaction creator.
    pub fn new(creator: Arc<dyn TransactionCreator>) -> Self {
        Self {
            creator,
            breaker: None,
            // Generic failures from the service imply a 500, so server
            // errors are retried by default.
            classifier: ErrorClassifier::new().retry_server_errors(true),
        }
    }

    /// Guard every creation call with the given circuit breaker.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Override the retryability classification.
    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Run a batch of transaction creations.
    ///
    /// Returns one result per completed item, sorted by input index. A
    /// cancellation stops dispatch and returns whatever completed first;
    /// `stop_on_error` aborts after the first failed chunk, returning the
    /// partial results inside [`BatchError::Aborted`].
    #[instrument(skip(self, cancel, inputs, options), fields(inputs = inputs.len()))]
    pub async fn run_batch(
        &self,
        cancel: &CancellationToken,
        org_id: &str,
        ledger_id: &str,
        inputs: Vec<TransactionInput>,
        options: BatchOptions,
    ) -> Result<Vec<BatchResult>, BatchError> {
        let options = options.normalized();
        let total = inputs.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        info!(
            total,
            concurrency = options.concurrency,
            batch_size = options.batch_size,
            "starting batch run"
        );

        let pool = WorkerPool::new(WorkerPoolConfig {
            workers: options.concurrency,
            buffer_size: options.concurrency,
        });

        let context = Arc::new(ItemContext {
            creator: Arc::clone(&self.creator),
            breaker: self.breaker.clone(),
            classifier: self.classifier.clone(),
            cancel: cancel.clone(),
            org_id: org_id.to_string(),
            ledger_id: ledger_id.to_string(),
            retry_count: options.retry_count,
            retry_delay: options.retry_delay,
            prefix: options.idempotency_key_prefix.clone(),
            on_progress: options.on_progress.clone(),
            total,
        });

        let mut inputs = inputs;
        let mut results: Vec<BatchResult> = Vec::with_capacity(total);
        let mut chunk_start = 0usize;

        while chunk_start < total {
            if cancel.is_cancelled() {
                debug!(completed = results.len(), "batch cancelled between chunks");
                break;
            }

            let chunk_end = calculate_batch_end(chunk_start, options.batch_size, total);
            let chunk: Vec<WorkItem<TransactionInput>> = inputs
                .drain(..chunk_end - chunk_start)
                .enumerate()
                .map(|(offset, payload)| WorkItem { index: chunk_start + offset, payload })
                .collect();

            let context = Arc::clone(&context);
            let outcomes = pool
                .run(cancel, chunk, move |item: WorkItem<TransactionInput>| {
                    let context = Arc::clone(&context);
                    async move { context.process_item(item).await }
                })
                .await?;

            let mut chunk_results: Vec<BatchResult> = outcomes
                .into_iter()
                .map(|outcome: TaskOutcome<BatchResult, ClientError>| match outcome.result {
                    Ok(result) => result,
                    // process_item is infallible at the handler level; item
                    // failures travel inside the BatchResult.
                    Err(error) => BatchResult {
                        index: outcome.index,
                        transaction_id: String::new(),
                        error: Some(error),
                        duration: outcome.duration,
                    },
                })
                .collect();
            chunk_results.sort_by_key(|result| result.index);
            results.extend(chunk_results);

            if options.stop_on_error {
                if let Some(first_error) =
                    results.iter().find_map(|result| result.error.clone())
                {
                    warn!(completed = results.len(), error = %first_error, "aborting batch on first error");
                    return Err(BatchError::Aborted { results, source: first_error });
                }
            }

            chunk_start = chunk_end;
        }

        info!(
            completed = results.len(),
            failed = results.iter().filter(|r| r.error.is_some()).count(),
            "batch run finished"
        );
        Ok(results)
    }
}

/// Everything one worker needs to process an item.
struct ItemContext {
    creator: Arc<dyn TransactionCreator>,
    breaker: Option<CircuitBreaker>,
    classifier: ErrorClassifier,
    cancel: CancellationToken,
    org_id: String,
    ledger_id: String,
    retry_count: u32,
    retry_delay: Duration,
    prefix: String,
    on_progress: Option<ProgressCallback>,
    total: usize,
}

impl ItemContext {
    async fn process_item(&self, item: WorkItem<TransactionInput>) -> Result<BatchResult, ClientError> {
        let index = item.index;
        let mut input = item.payload;
        let key = ensure_idempotency_key(&mut input, &self.prefix, index);
        let start = Instant::now();

        let outcome = self.create_with_retry(&input, &key).await;
        let result = match outcome {
            Ok(transaction_id) => BatchResult {
                index,
                transaction_id,
                error: None,
                duration: start.elapsed(),
            },
            Err(error) => BatchResult {
                index,
                transaction_id: String::new(),
                error: Some(error),
                duration: start.elapsed(),
            },
        };

        if let Some(on_progress) = &self.on_progress {
            on_progress(index + 1, self.total, &result);
        }
        Ok(result)
    }

    async fn create_with_retry(
        &self,
        input: &TransactionInput,
        key: &str,
    ) -> Result<String, ClientError> {
        let attempts = self.retry_count.saturating_add(1);
        let mut attempt: u32 = 1;

        loop {
            match self.create_once(input, key).await {
                Ok(transaction_id) => return Ok(transaction_id),
                Err(error) => {
                    if attempt >= attempts || !self.classifier.is_retryable(&error) {
                        return Err(error);
                    }

                    let exponent = calculate_backoff_factor(i64::from(attempt));
                    let delay = self.retry_delay.saturating_mul(1u32 << exponent);
                    debug!(key, attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying transaction");

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => {
                            debug!(key, "item cancelled during retry backoff");
                            return Err(ClientError::Cancelled);
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn create_once(&self, input: &TransactionInput, key: &str) -> Result<String, ClientError> {
        match &self.breaker {
            None => self.creator.create(&self.org_id, &self.ledger_id, input, key).await,
            Some(breaker) => breaker
                .execute(|| self.creator.create(&self.org_id, &self.ledger_id, input, key))
                .await
                .map_err(|err| match err {
                    ledgerkit_common::BreakerError::Open => ClientError::CircuitOpen,
                    ledgerkit_common::BreakerError::Operation { source } => source,
                }),
        }
    }

}

/// End index (exclusive) of the chunk starting at `start`.
pub fn calculate_batch_end(start: usize, batch_size: usize, total: usize) -> usize {
    (start + batch_size).min(total)
}

/// Exponent for the per-item retry delay.
///
/// The first retry waits the base delay unscaled; each later retry doubles
/// it, capped so the shift never overflows. Inputs below 2, including
/// negatives, map to 0.
pub fn calculate_backoff_factor(attempt: i64) -> u32 {
    if attempt <= 1 {
        return 0;
    }
    (attempt - 2).min(MAX_ITEM_BACKOFF_EXPONENT) as u32
}

/// Fill in a synthesized idempotency key when the input carries none.
///
/// A caller-supplied key is never overwritten.
pub fn ensure_idempotency_key(
    input: &mut TransactionInput,
    prefix: &str,
    index: usize,
) -> String {
    match &input.idempotency_key {
        Some(key) if !key.is_empty() => key.clone(),
        _ => {
            let key = format!("{prefix}-{index}");
            input.idempotency_key = Some(key.clone());
            key
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Validates chunk end calculation, including the short final chunk.
    #[test]
    fn test_calculate_batch_end() {
        assert_eq!(calculate_batch_end(0, 100, 250), 100);
        assert_eq!(calculate_batch_end(100, 100, 250), 200);
        assert_eq!(calculate_batch_end(200, 100, 250), 250);
        assert_eq!(calculate_batch_end(0, 100, 5), 5);
    }

    /// Validates the retry delay exponent table.
    ///
    /// Assertions:
    /// - Confirms attempts 0 and 1 (and negatives) map to exponent 0.
    /// - Confirms attempts 2 through 31 map to `attempt - 2`.
    /// - Confirms the exponent caps at 30 beyond that.
    #[test]
    fn test_calculate_backoff_factor() {
        assert_eq!(calculate_backoff_factor(-5), 0);
        assert_eq!(calculate_backoff_factor(0), 0);
        assert_eq!(calculate_backoff_factor(1), 0);
        assert_eq!(calculate_backoff_factor(2), 0);
        assert_eq!(calculate_backoff_factor(3), 1);
        assert_eq!(calculate_backoff_factor(31), 29);
        assert_eq!(calculate_backoff_factor(32), 30);
        assert_eq!(calculate_backoff_factor(1_000_000), 30);
    }

    /// Validates idempotency key assignment.
    ///
    /// Assertions:
    /// - Confirms an empty key is synthesized as `{prefix}-{index}`.
    /// - Confirms a caller-supplied key is never overwritten.
    #[test]
    fn test_ensure_idempotency_key() {
        let mut input = TransactionInput::new(json!({"amount": 1}));
        assert_eq!(ensure_idempotency_key(&mut input, "batch", 5), "batch-5");
        assert_eq!(input.idempotency_key.as_deref(), Some("batch-5"));

        let mut keyed = TransactionInput::with_idempotency_key(json!({"amount": 1}), "mine-1");
        assert_eq!(ensure_idempotency_key(&mut keyed, "batch", 5), "mine-1");
        assert_eq!(keyed.idempotency_key.as_deref(), Some("mine-1"));

        let mut blank = TransactionInput { idempotency_key: Some(String::new()), payload: json!({}) };
        assert_eq!(ensure_idempotency_key(&mut blank, "batch", 0), "batch-0");
    }

    /// Tests option normalization back to documented defaults.
    #[test]
    fn test_options_normalization() {
        let options = BatchOptions {
            concurrency: 0,
            batch_size: 0,
            retry_delay: Duration::ZERO,
            idempotency_key_prefix: String::new(),
            ..BatchOptions::default()
        };
        let normalized = options.normalized();
        assert_eq!(normalized.concurrency, 1);
        assert_eq!(normalized.batch_size, 100);
        assert_eq!(normalized.retry_delay, Duration::from_millis(100));
        assert_eq!(normalized.idempotency_key_prefix, "batch");
    }
}
