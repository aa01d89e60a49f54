//! Per-operation timeout wrapper (spec §4.7).

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::error::{BrokerError, Result};

/// Named per-operation timeouts, falling back to `default` when an operation
/// has no specific entry (spec §4.7's examples: `ec2_run_instances: 180s`,
/// `autoscaling_create_group: 120s`, `spot_fleet_request: 300s`).
#[derive(Debug, Clone)]
pub struct TimeoutTable {
    default: Duration,
    overrides: HashMap<String, Duration>,
}

impl TimeoutTable {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, operation: impl Into<String>, timeout: Duration) -> Self {
        self.overrides.insert(operation.into(), timeout);
        self
    }

    pub fn for_operation(&self, operation: &str) -> Duration {
        self.overrides.get(operation).copied().unwrap_or(self.default)
    }
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
            .with_override("ec2_run_instances", Duration::from_secs(180))
            .with_override("autoscaling_create_group", Duration::from_secs(120))
            .with_override("spot_fleet_request", Duration::from_secs(300))
    }
}

/// Run `f`, raising a retryable `Timeout` if it doesn't resolve within
/// `duration`. A timeout of exactly the configured value still fires (spec
/// §8 boundary behavior: not rounded down).
pub async fn with_timeout<Fut, T>(duration: Duration, f: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, f).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_operation_falls_back_to_default() {
        let table = TimeoutTable::default();
        assert_eq!(table.for_operation("describe_instances"), Duration::from_secs(30));
        assert_eq!(table.for_operation("ec2_run_instances"), Duration::from_secs(180));
    }

    #[tokio::test]
    async fn fast_future_completes_without_timeout() {
        let result: Result<u32> = with_timeout(Duration::from_millis(50), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn slow_future_raises_timeout_error() {
        let result: Result<u32> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(7)
        })
        .await;
        assert!(matches!(result, Err(BrokerError::Timeout(_))));
    }
}
