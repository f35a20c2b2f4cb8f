//! Batch transaction execution and aggregation

pub mod processor;
pub mod summary;

pub use processor::{
    calculate_backoff_factor, calculate_batch_end, ensure_idempotency_key, BatchError,
    BatchOptions, BatchProcessor, ProgressCallback, TransactionCreator, TransactionInput,
};
pub use summary::{get_batch_summary, BatchResult, BatchSummary};
