//! Backoff between oracle retry rounds.

use crate::config::OracleConfig;
use std::time::Duration;

/// Exponential backoff for the given zero-based retry attempt, capped at
/// `max_backoff_ms`.
pub fn compute_backoff(config: &OracleConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = base.min(config.max_backoff_ms as f64);
    Duration::from_millis(capped.max(0.0) as u64)
}

/// Upper bound on the time one `predict_batch` call may take: each round
/// costs at most two timeouts (batch call plus per-instance isolation),
/// plus the backoff between rounds.
pub fn worst_case_duration(config: &OracleConfig) -> Duration {
    let mut total = config.timeout() * 2 * (config.retries + 1);
    for attempt in 0..config.retries {
        total += compute_backoff(config, attempt);
    }
    total
}
