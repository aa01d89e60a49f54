//! Exponential backoff retry (spec §4.7).

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{BrokerError, IsRetryable, Result};

const DEFAULT_BASE_MS: u64 = 1_000;
const DEFAULT_GROWTH: f64 = 2.0;
const DEFAULT_CAP_MS: u64 = 60_000;
const DEFAULT_JITTER_FACTOR: f64 = 0.1;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Exponential backoff with jitter: `delay(i) = min(base * growth^i, cap) + U(0, jitter_factor * delay)`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoffPolicy {
    max_attempts: u32,
    base: Duration,
    growth: f64,
    cap: Duration,
    jitter_factor: f64,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::from_millis(DEFAULT_BASE_MS),
            growth: DEFAULT_GROWTH,
            cap: Duration::from_millis(DEFAULT_CAP_MS),
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    pub fn default_policy() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    pub fn with_growth(mut self, growth: f64) -> Self {
        self.growth = growth;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponential = self.base.as_millis() as f64 * self.growth.powi(attempt as i32);
        let delay_ms = exponential.min(self.cap.as_millis() as f64);
        let jitter = delay_ms * self.jitter_factor * fastrand::f64();
        Duration::from_millis((delay_ms + jitter) as u64)
    }

    /// Run `f`, retrying classified-retryable errors up to `max_attempts`
    /// times. Non-retryable errors return immediately on first occurrence.
    pub async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!("operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !e.is_retryable() {
                        warn!("non-retryable error, aborting: {}", e);
                        return Err(e);
                    }

                    if attempt == self.max_attempts - 1 {
                        warn!("max retries ({}) reached", self.max_attempts);
                        return Err(e);
                    }

                    let backoff = self.calculate_backoff(attempt);
                    warn!(
                        "retryable error (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        self.max_attempts,
                        backoff,
                        e
                    );
                    last_error = Some(e);
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BrokerError::Internal("retry loop exhausted without an error".to_string())))
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}

/// AWS error codes classified as transient per spec §4.7.
pub const AWS_RETRYABLE_CODES: &[&str] = &[
    "ThrottlingException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "InternalServerError",
    "RequestTimeout",
    "InsufficientInstanceCapacity",
    "PriorRequestNotComplete",
    "RequestTimeTooSkewed",
];

pub fn is_aws_code_retryable(code: &str) -> bool {
    AWS_RETRYABLE_CODES.iter().any(|c| *c == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let policy = ExponentialBackoffPolicy::new(3).with_base(Duration::from_millis(1));
        let result: Result<u32> = policy.execute_with_retry(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = ExponentialBackoffPolicy::new(3).with_base(Duration::from_millis(1));

        let result: Result<u32> = policy
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(BrokerError::ProviderTransient {
                        provider: "aws".to_string(),
                        message: "throttled".to_string(),
                        source: None,
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_short_circuit() {
        let calls = AtomicU32::new(0);
        let policy = ExponentialBackoffPolicy::new(3).with_base(Duration::from_millis(1));

        let result: Result<u32> = policy
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BrokerError::Conflict("already terminal".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn aws_retryable_codes_match_spec_list() {
        assert!(is_aws_code_retryable("ThrottlingException"));
        assert!(is_aws_code_retryable("InsufficientInstanceCapacity"));
        assert!(!is_aws_code_retryable("UnauthorizedOperation"));
    }
}
