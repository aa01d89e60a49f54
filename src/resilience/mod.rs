//! Retry, circuit breaker, and timeout, composed per spec §4.7: timeout
//! inside retry inside circuit breaker (circuit breaker outermost).

pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{is_aws_code_retryable, ExponentialBackoffPolicy, AWS_RETRYABLE_CODES};
pub use timeout::{with_timeout, TimeoutTable};

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Wrap a fallible async operation with the full resilience stack.
///
/// `f` must be cheaply re-callable: it is invoked once per retry attempt, and
/// each attempt is individually time-boxed, with the breaker guarding the
/// whole sequence.
pub async fn with_resilience<F, Fut, T>(
    breaker: &CircuitBreaker,
    retry_policy: &ExponentialBackoffPolicy,
    operation_timeout: Duration,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
{
    breaker
        .call(|| retry_policy.execute_with_retry(|| timeout::with_timeout(operation_timeout, f())))
        .await
}
