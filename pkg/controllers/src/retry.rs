//! Exponential backoff with jitter for cluster API calls.

use pkg_constants::controller::{
    DEFAULT_RETRY_INITIAL_DELAY_MS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_DELAY_MS,
    DEFAULT_RETRY_MULTIPLIER,
};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Backoff policy for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (0 = infinite)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_RETRY_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            multiplier: DEFAULT_RETRY_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("retry initial delay must be positive".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("retry max delay must not be smaller than the initial delay".to_string());
        }
        if !(self.multiplier >= 1.0) {
            return Err("retry multiplier must be at least 1".to_string());
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Delay before retry number `attempt`, with 0.5x to 1.5x jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(0.5..1.5);
        Duration::from_secs_f64(self.base_delay(attempt).as_secs_f64() * jitter)
    }
}

/// Run `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or `max_attempts` is exhausted. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.delay_for(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
