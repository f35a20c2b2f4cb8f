//! Fixed-size async worker pool over a bounded queue
//!
//! Work items flow through a bounded `mpsc` channel to a fixed set of
//! spawned workers; backpressure comes from the channel capacity, not from
//! unbounded task spawning. Each item carries its original index so callers
//! can reorder outcomes after the fan-out.
//!
//! Cancellation is checked both when dispatching items into the queue and
//! when a worker picks one up, so a cancelled run stops promptly and simply
//! returns the outcomes completed so far.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Hard upper bound on concurrent workers.
pub const MAX_WORKERS: usize = 100;

/// A unit of work tagged with its position in the submitted sequence.
#[derive(Debug, Clone)]
pub struct WorkItem<T> {
    /// Zero-based position in the original input
    pub index: usize,
    /// The value handed to the handler
    pub payload: T,
}

/// The outcome of one work item.
#[derive(Debug)]
pub struct TaskOutcome<R, E> {
    /// Index of the originating [`WorkItem`]
    pub index: usize,
    /// Handler result for that item
    pub result: Result<R, E>,
    /// Wall time the handler spent on the item
    pub duration: Duration,
}

/// Errors surfaced by a pool run.
#[derive(Debug, Error)]
pub enum WorkerPoolError {
    /// A worker task panicked; its in-flight item is lost.
    #[error("worker task panicked: {0}")]
    WorkerPanicked(String),
}

/// Worker pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers; clamped to `1..=MAX_WORKERS`
    pub workers: usize,
    /// Capacity of the dispatch queue; at least 1
    pub buffer_size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { workers: 10, buffer_size: 10 }
    }
}

impl WorkerPoolConfig {
    /// Clamp the configuration into its valid ranges, logging when a value
    /// had to be adjusted.
    pub fn normalized(self) -> Self {
        let workers = self.workers.clamp(1, MAX_WORKERS);
        if workers != self.workers {
            warn!(requested = self.workers, clamped = workers, "worker count out of range, clamping");
        }
        Self { workers, buffer_size: self.buffer_size.max(1) }
    }
}

/// A reusable fixed-size worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Create a pool; the configuration is normalized on construction.
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self { config: config.normalized() }
    }

    /// The pool's effective (post-clamp) configuration.
    pub fn config(&self) -> WorkerPoolConfig {
        self.config
    }

    /// Run all items through the handler and collect their outcomes.
    ///
    /// Outcomes arrive in completion order, not input order; each completed
    /// item appears exactly once, identified by its index. The outcome
    /// channel is sized to the input length, so workers never block on
    /// reporting results.
    ///
    /// A cancellation stops dispatch and idles the workers; items already
    /// being processed run to completion and their outcomes are included.
    #[instrument(skip(self, cancel, items, handler), fields(workers = self.config.workers, items = items.len()))]
    pub async fn run<T, R, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        items: Vec<WorkItem<T>>,
        handler: F,
    ) -> Result<Vec<TaskOutcome<R, E>>, WorkerPoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(WorkItem<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send,
    {
        let total = items.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let handler = Arc::new(handler);
        let (work_tx, work_rx) = mpsc::channel::<WorkItem<T>>(self.config.buffer_size);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<TaskOutcome<R, E>>(total);

        let mut handles = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let work_rx = Arc::clone(&work_rx);
            let outcome_tx = outcome_tx.clone();
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        () = cancel.cancelled() => break,
                        item = async { work_rx.lock().await.recv().await } => match item {
                            Some(item) => item,
                            None => break,
                        },
                    };

                    let index = item.index;
                    let start = Instant::now();
                    let result = handler(item).await;
                    let outcome = TaskOutcome { index, result, duration: start.elapsed() };
                    if outcome_tx.send(outcome).await.is_err() {
                        break;
                    }
                }
                debug!(worker_id, "worker finished");
            }));
        }
        drop(outcome_tx);

        let mut dispatched = 0usize;
        for item in items {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(dispatched, total, "dispatch cancelled");
                    break;
                }
                sent = work_tx.send(item) => {
                    if sent.is_err() {
                        break;
                    }
                    dispatched += 1;
                }
            }
        }
        drop(work_tx);

        for handle in handles {
            if let Err(join_err) = handle.await {
                return Err(WorkerPoolError::WorkerPanicked(join_err.to_string()));
            }
        }

        let mut outcomes = Vec::with_capacity(dispatched);
        while let Some(outcome) = outcome_rx.recv().await {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
