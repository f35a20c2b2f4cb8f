//! Resilient ledger API client
//!
//! Builds the ledger-facing execution layer on top of the primitives in
//! `ledgerkit-common`: an error taxonomy for service failures, a retrying
//! HTTP executor, and a batch processor that drives many transaction
//! creations through bounded concurrency with per-item retries and
//! aggregate statistics.

pub mod batch;
pub mod errors;
pub mod http;

pub use batch::{
    get_batch_summary, BatchError, BatchOptions, BatchProcessor, BatchResult, BatchSummary,
    ProgressCallback, TransactionCreator, TransactionInput,
};
pub use errors::ClientError;
pub use http::{HttpResponse, HttpRetryError, HttpRetryExecutor, HttpRetryOptions};
