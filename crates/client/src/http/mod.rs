//! HTTP-aware resilient execution
//!
//! Wraps `reqwest` with the retry semantics the ledger client needs:
//! status-code classification, request re-cloning between attempts, a
//! single full body read per response, and an optional pre-retry hook.

pub mod retry;

pub use retry::{HttpResponse, HttpRetryError, HttpRetryExecutor, HttpRetryOptions};
