use std::time::Duration;

use flowd_core::config::RetryConfig;

/// Delay before attempt `attempt` of a call whose ladder has `ladder_len` models.
///
/// The first pass down the ladder is immediate; every attempt after the first
/// wrap waits with exponential backoff.
pub fn backoff_before(attempt: u32, ladder_len: usize, config: &RetryConfig) -> Option<Duration> {
    let ladder_len = ladder_len.max(1) as u32;
    if attempt < ladder_len {
        return None;
    }
    Some(calculate_backoff(attempt - ladder_len, config))
}

pub fn calculate_backoff(step: u32, config: &RetryConfig) -> Duration {
    let factor = 2u64.saturating_pow(step);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
