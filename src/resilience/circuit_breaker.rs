//! Per-service circuit breaker (spec §4.7).
//!
//! CLOSED -> OPEN after `failure_threshold` consecutive failures. OPEN calls
//! fail fast without touching the wrapped operation. After `reset_timeout`
//! the breaker allows one probe (HALF_OPEN); success closes it, failure
//! reopens it, and a probe that never arrives within `half_open_timeout`
//! reverts to OPEN.

use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_since: Option<Instant>,
}

/// A single named circuit, e.g. `aws_ec2`.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_since: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.evaluate_transition();
        self.inner.lock().state
    }

    /// Move OPEN -> HALF_OPEN once `reset_timeout` has elapsed, and revert a
    /// stale HALF_OPEN probe back to OPEN if `half_open_timeout` expired
    /// without a result being recorded.
    fn evaluate_transition(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => {
                if let Some(opened_at) = inner.opened_at {
                    if opened_at.elapsed() >= self.config.reset_timeout {
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_since = Some(Instant::now());
                    }
                }
            }
            CircuitState::HalfOpen => {
                if let Some(since) = inner.half_open_since {
                    if since.elapsed() >= self.config.half_open_timeout {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(Instant::now());
                    }
                }
            }
            CircuitState::Closed => {}
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.half_open_since = None;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_since = None;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        "circuit {} OPEN after {} consecutive failures",
                        self.service, inner.consecutive_failures
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` through the breaker. Fails fast with `CircuitBreakerOpen` when
    /// the circuit is OPEN, without invoking `f`.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.evaluate_transition();
        if self.inner.lock().state == CircuitState::Open {
            return Err(BrokerError::CircuitBreakerOpen {
                service: self.service.clone(),
            });
        }

        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(10),
            half_open_timeout: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("aws_ec2", fast_config());
        for _ in 0..2 {
            let _: Result<()> = breaker
                .call(|| async { Err(BrokerError::provider_transient("aws", "boom")) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_calling_body() {
        let breaker = CircuitBreaker::new("aws_ec2", fast_config());
        for _ in 0..2 {
            let _: Result<()> = breaker
                .call(|| async { Err(BrokerError::provider_transient("aws", "boom")) })
                .await;
        }

        let called = std::sync::atomic::AtomicBool::new(false);
        let result: Result<()> = breaker
            .call(|| {
                called.store(true, std::sync::atomic::Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(BrokerError::CircuitBreakerOpen { .. })));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn half_open_success_closes_circuit() {
        let breaker = CircuitBreaker::new("aws_ec2", fast_config());
        for _ in 0..2 {
            let _: Result<()> = breaker
                .call(|| async { Err(BrokerError::provider_transient("aws", "boom")) })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let result: Result<()> = breaker.call(|| async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new("aws_ec2", fast_config());
        for _ in 0..2 {
            let _: Result<()> = breaker
                .call(|| async { Err(BrokerError::provider_transient("aws", "boom")) })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _: Result<()> = breaker
            .call(|| async { Err(BrokerError::provider_transient("aws", "still broken")) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
