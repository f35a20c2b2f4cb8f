//! Aggregate statistics over a finished batch run

use std::collections::BTreeMap;
use std::time::Duration;

use ledgerkit_common::ErrorClassification;
use serde::Serialize;

use crate::errors::ClientError;

/// The outcome of one transaction in a batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Position of the input in the submitted list
    pub index: usize,
    /// Identifier returned by the ledger service; empty on failure
    pub transaction_id: String,
    /// The failure, when the item did not complete
    pub error: Option<ClientError>,
    /// Wall time the item spent including its retries
    pub duration: Duration,
}

impl BatchResult {
    /// Whether this item completed without error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Derived statistics for a batch run; computed on demand, never stored.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchSummary {
    pub total_transactions: usize,
    pub success_count: usize,
    pub error_count: usize,
    /// Percentage of items that succeeded, in `[0, 100]`
    pub success_rate: f64,
    /// Sum of per-item durations
    pub total_duration: Duration,
    pub average_duration: Duration,
    /// Successful transactions divided by total duration in seconds;
    /// zero when the total duration is zero
    pub transactions_per_second: f64,
    /// Failure counts keyed by classified category label
    pub error_categories: BTreeMap<&'static str, usize>,
}

impl BatchSummary {
    fn empty() -> Self {
        Self {
            total_transactions: 0,
            success_count: 0,
            error_count: 0,
            success_rate: 0.0,
            total_duration: Duration::ZERO,
            average_duration: Duration::ZERO,
            transactions_per_second: 0.0,
            error_categories: BTreeMap::new(),
        }
    }
}

/// Compute aggregate statistics from a slice of batch results.
pub fn get_batch_summary(results: &[BatchResult]) -> BatchSummary {
    if results.is_empty() {
        return BatchSummary::empty();
    }

    let total = results.len();
    let mut success_count = 0usize;
    let mut total_duration = Duration::ZERO;
    let mut error_categories: BTreeMap<&'static str, usize> = BTreeMap::new();

    for result in results {
        total_duration += result.duration;
        match &result.error {
            None => success_count += 1,
            Some(error) => {
                *error_categories.entry(error.category().label()).or_insert(0) += 1;
            }
        }
    }

    let error_count = total - success_count;
    let total_seconds = total_duration.as_secs_f64();
    let transactions_per_second =
        if total_seconds > 0.0 { success_count as f64 / total_seconds } else { 0.0 };

    BatchSummary {
        total_transactions: total,
        success_count,
        error_count,
        success_rate: success_count as f64 / total as f64 * 100.0,
        total_duration,
        average_duration: total_duration / total as u32,
        transactions_per_second,
        error_categories,
    }
}
