//! Integration tests composing the resilience primitives
//!
//! Covers retry and circuit breaker composition, deterministic timeout
//! transitions through the mock clock, worker pool fan-out, and concurrent
//! breaker access from multiple tasks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ledgerkit_common::{
    BackoffPolicy, BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    ErrorCategory, ErrorClassification, ErrorClassifier, MockClock, RetryError, RetryExecutor,
    RetryOptions, WorkItem, WorkerPool, WorkerPoolConfig,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct ServiceError {
    message: String,
}

impl ServiceError {
    fn transient() -> Self {
        Self { message: "service unavailable".to_string() }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ServiceError {}

impl ErrorClassification for ServiceError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Network
    }
}

fn fast_retry(max_retries: u32) -> RetryExecutor {
    let options = RetryOptions::builder()
        .max_retries(max_retries)
        .policy(
            BackoffPolicy::builder()
                .initial_delay(Duration::from_millis(1))
                .no_jitter()
                .build()
                .expect("valid policy"),
        )
        .classifier(ErrorClassifier::new())
        .build()
        .expect("valid options");
    RetryExecutor::new(options)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_recovers_flaky_operation() {
    let executor = fast_retry(4);
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);

    let result = executor
        .execute(&cancel, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ServiceError::transient())
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;

    assert_eq!(result.expect("should recover"), "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_inside_breaker_trips_it() {
    let executor = fast_retry(1);
    let clock = MockClock::new();
    let breaker = CircuitBreaker::with_clock(
        CircuitBreakerConfig::builder()
            .failure_threshold(2)
            .success_threshold(1)
            .open_timeout(Duration::from_secs(30))
            .build()
            .expect("valid config"),
        clock.clone(),
    )
    .expect("valid breaker");
    let cancel = CancellationToken::new();

    // Each breaker call runs a full retry loop; two exhausted loops reach
    // the failure threshold.
    for _ in 0..2 {
        let executor = executor.clone();
        let cancel = cancel.clone();
        let outcome: Result<(), BreakerError<RetryError<ServiceError>>> = breaker
            .execute(|| async move {
                executor
                    .execute(&cancel, || async { Err::<(), _>(ServiceError::transient()) })
                    .await
            })
            .await;
        assert!(matches!(outcome, Err(BreakerError::Operation { .. })));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected: Result<(), BreakerError<RetryError<ServiceError>>> =
        breaker.execute(|| async { Ok(()) }).await;
    assert!(matches!(rejected, Err(BreakerError::Open)));

    // After the open timeout a probe is allowed and recovery closes the
    // breaker again.
    clock.advance(Duration::from_secs(30));
    let probe: Result<(), BreakerError<RetryError<ServiceError>>> =
        breaker.execute(|| async { Ok(()) }).await;
    assert!(probe.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_breaker_under_concurrent_load() {
    let breaker = Arc::new(CircuitBreaker::with_defaults());
    let mut handles = Vec::new();

    for task in 0..8u32 {
        let breaker = Arc::clone(&breaker);
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                let _: Result<u32, BreakerError<ServiceError>> =
                    breaker.execute(|| async move { Ok(task) }).await;
            }
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    let metrics = breaker.metrics();
    assert_eq!(metrics.total_calls, 400);
    assert_eq!(metrics.rejected_calls, 0);
    assert_eq!(metrics.state, CircuitState::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_pool_with_retrying_handler() {
    let pool = WorkerPool::new(WorkerPoolConfig { workers: 4, buffer_size: 4 });
    let cancel = CancellationToken::new();
    let executor = fast_retry(2);

    let items: Vec<WorkItem<u32>> =
        (0..20).map(|index| WorkItem { index, payload: index as u32 }).collect();
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = Arc::clone(&attempts);
    // Indices whose first attempt has already happened.
    let seen: Arc<std::sync::Mutex<std::collections::HashSet<usize>>> =
        Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));

    let cancel_for_handler = cancel.clone();
    let outcomes = pool
        .run(&cancel, items, move |item: WorkItem<u32>| {
            let executor = executor.clone();
            let cancel = cancel_for_handler.clone();
            let attempts = Arc::clone(&attempts_clone);
            let seen = Arc::clone(&seen);
            async move {
                executor
                    .execute(&cancel, || {
                        let attempts = Arc::clone(&attempts);
                        let seen = Arc::clone(&seen);
                        async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            // Every item fails its first attempt, then
                            // succeeds.
                            if seen.lock().expect("lock").insert(item.index) {
                                Err(ServiceError::transient())
                            } else {
                                Ok(item.payload * 2)
                            }
                        }
                    })
                    .await
            }
        })
        .await
        .expect("pool should complete");

    assert_eq!(outcomes.len(), 20);
    assert!(outcomes.iter().all(|o| o.result.is_ok()));
    assert_eq!(attempts.load(Ordering::SeqCst), 40);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_stops_retry_and_pool() {
    let pool = WorkerPool::new(WorkerPoolConfig { workers: 2, buffer_size: 1 });
    let cancel = CancellationToken::new();
    let executor = RetryExecutor::new(
        RetryOptions::builder()
            .max_retries(10)
            .policy(
                BackoffPolicy::builder()
                    .initial_delay(Duration::from_secs(10))
                    .no_jitter()
                    .build()
                    .expect("valid policy"),
            )
            .build()
            .expect("valid options"),
    );

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_clone.cancel();
    });

    let items: Vec<WorkItem<u32>> =
        (0..10).map(|index| WorkItem { index, payload: 0 }).collect();
    let cancel_for_handler = cancel.clone();
    let outcomes = pool
        .run(&cancel, items, move |_item: WorkItem<u32>| {
            let executor = executor.clone();
            let cancel = cancel_for_handler.clone();
            async move {
                executor
                    .execute(&cancel, || async { Err::<u32, _>(ServiceError::transient()) })
                    .await
            }
        })
        .await
        .expect("pool should stop cleanly");

    // Whatever ran was interrupted inside its backoff wait.
    assert!(outcomes
        .iter()
        .all(|o| matches!(o.result, Err(RetryError::Cancelled { .. }))));
}
