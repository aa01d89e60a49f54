//! Provider context and selection policies (spec §4.4).
//!
//! A [`ProviderContext`] owns a set of named [`ProviderStrategy`]
//! implementations and picks one per operation according to a
//! [`SelectionPolicy`], using rolling [`StrategyMetrics`] and
//! [`HealthStatus`] snapshots. One cloud, one strategy: today only
//! [`aws::AwsStrategy`] exists, but nothing here assumes AWS.

pub mod aws;

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::Machine;
use crate::error::{BrokerError, Result};
use crate::domain::Template;

/// The provider-internal contract every cloud strategy implements (spec §4.5).
#[async_trait]
pub trait ProviderStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn provision_machines(&self, request_id: &str, template: &Template, count: u32) -> Result<Vec<Machine>>;

    async fn terminate_machines(&self, instance_ids: &[String]) -> Result<bool>;

    async fn get_machine_status(&self, instance_ids: &[String]) -> Result<std::collections::HashMap<String, crate::domain::MachineStatus>>;

    async fn validate_template(&self, template: &Template) -> Result<Vec<String>>;

    async fn get_available_templates(&self) -> Result<Vec<Template>>;

    async fn health_check(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    FirstAvailable,
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    FastestResponse,
    HighestSuccessRate,
    CapabilityBased,
    HealthBased,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Ordering for `HEALTH_BASED` selection: higher score wins ties broken
    /// by lower priority (spec §4.4 step 6).
    fn score(self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }
}

/// Rolling metrics kept per strategy: last `WINDOW` samples of (success,
/// duration), reduced to success rate and p95 on demand.
pub struct StrategyMetrics {
    window: parking_lot::Mutex<std::collections::VecDeque<(bool, Duration)>>,
    window_size: usize,
    active_operations: AtomicUsize,
    total_operations: AtomicU64,
}

const DEFAULT_WINDOW_SIZE: usize = 100;

impl StrategyMetrics {
    fn new() -> Self {
        Self {
            window: parking_lot::Mutex::new(std::collections::VecDeque::with_capacity(DEFAULT_WINDOW_SIZE)),
            window_size: DEFAULT_WINDOW_SIZE,
            active_operations: AtomicUsize::new(0),
            total_operations: AtomicU64::new(0),
        }
    }

    pub fn record(&self, success: bool, duration: Duration) {
        let mut window = self.window.lock();
        if window.len() == self.window_size {
            window.pop_front();
        }
        window.push_back((success, duration));
        self.total_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_rate(&self) -> f64 {
        let window = self.window.lock();
        if window.is_empty() {
            return 1.0;
        }
        let successes = window.iter().filter(|(ok, _)| *ok).count();
        successes as f64 / window.len() as f64
    }

    pub fn p95_response_time(&self) -> Duration {
        let window = self.window.lock();
        if window.is_empty() {
            return Duration::ZERO;
        }
        let mut durations: Vec<Duration> = window.iter().map(|(_, d)| *d).collect();
        durations.sort();
        let idx = ((durations.len() as f64) * 0.95).ceil() as usize;
        durations[idx.saturating_sub(1).min(durations.len() - 1)]
    }

    pub fn active_operations(&self) -> usize {
        self.active_operations.load(Ordering::Relaxed)
    }

    fn begin_operation(&self) {
        self.active_operations.fetch_add(1, Ordering::Relaxed);
    }

    fn end_operation(&self) {
        self.active_operations.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A registered, named provider strategy plus its configuration (spec §3's
/// "ProviderStrategy registration" entity).
pub struct RegisteredStrategy {
    pub strategy: Arc<dyn ProviderStrategy>,
    pub provider_type: String,
    pub config: std::collections::HashMap<String, String>,
    pub capabilities: HashSet<String>,
    pub priority: i32,
    pub weight: u32,
    pub metrics: StrategyMetrics,
    pub health: parking_lot::Mutex<HealthStatus>,
}

/// Criteria narrowing the candidate set before policy selection (spec §4.4).
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    pub required_capabilities: Vec<String>,
    pub min_success_rate: Option<f64>,
    pub max_response_time_ms: Option<u64>,
    pub require_healthy: bool,
    pub exclude_strategies: Vec<String>,
    pub prefer_strategies: Vec<String>,
}

/// Owns the registered strategies and the active selection policy.
pub struct ProviderContext {
    strategies: DashMap<String, RegisteredStrategy>,
    default_strategy: parking_lot::Mutex<Option<String>>,
    policy: parking_lot::Mutex<SelectionPolicy>,
    round_robin_cursor: AtomicUsize,
}

impl ProviderContext {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            strategies: DashMap::new(),
            default_strategy: parking_lot::Mutex::new(None),
            policy: parking_lot::Mutex::new(policy),
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        strategy: Arc<dyn ProviderStrategy>,
        provider_type: impl Into<String>,
        config: std::collections::HashMap<String, String>,
        capabilities: HashSet<String>,
        priority: i32,
        weight: u32,
    ) {
        let name = name.into();
        let mut default = self.default_strategy.lock();
        if default.is_none() {
            *default = Some(name.clone());
        }
        self.strategies.insert(
            name,
            RegisteredStrategy {
                strategy,
                provider_type: provider_type.into(),
                config,
                capabilities,
                priority,
                weight,
                metrics: StrategyMetrics::new(),
                health: parking_lot::Mutex::new(HealthStatus::Healthy),
            },
        );
    }

    pub fn set_policy(&self, policy: SelectionPolicy) {
        *self.policy.lock() = policy;
    }

    pub fn mark_health(&self, name: &str, health: HealthStatus) {
        if let Some(entry) = self.strategies.get(name) {
            *entry.health.lock() = health;
        }
    }

    pub fn record_outcome(&self, name: &str, success: bool, duration: Duration) {
        if let Some(entry) = self.strategies.get(name) {
            entry.metrics.record(success, duration);
        }
    }

    /// Run the full selection algorithm (spec §4.4 steps 1-7) and return the
    /// chosen strategy's registered name.
    pub fn select(&self, criteria: &SelectionCriteria) -> Result<String> {
        self.select_with_rng(criteria, fastrand::f64())
    }

    /// Injectable-RNG form, used by tests to make `RANDOM` deterministic
    /// (spec §8: "deterministic given a fixed policy... and RNG seed").
    pub fn select_with_rng(&self, criteria: &SelectionCriteria, rng_draw: f64) -> Result<String> {
        let mut candidates: Vec<String> = self.strategies.iter().map(|e| e.key().clone()).collect();
        candidates.sort();

        // 2. exclude / require_healthy
        candidates.retain(|name| !criteria.exclude_strategies.contains(name));
        if criteria.require_healthy {
            candidates.retain(|name| {
                self.strategies
                    .get(name)
                    .map(|e| *e.health.lock() == HealthStatus::Healthy)
                    .unwrap_or(false)
            });
        }

        // 3. required capabilities (superset)
        if !criteria.required_capabilities.is_empty() {
            candidates.retain(|name| {
                self.strategies
                    .get(name)
                    .map(|e| {
                        criteria
                            .required_capabilities
                            .iter()
                            .all(|c| e.capabilities.contains(c))
                    })
                    .unwrap_or(false)
            });
        }

        // 4. threshold filters
        if let Some(min_rate) = criteria.min_success_rate {
            candidates.retain(|name| {
                self.strategies
                    .get(name)
                    .map(|e| e.metrics.success_rate() >= min_rate)
                    .unwrap_or(false)
            });
        }
        if let Some(max_ms) = criteria.max_response_time_ms {
            candidates.retain(|name| {
                self.strategies
                    .get(name)
                    .map(|e| e.metrics.p95_response_time() <= Duration::from_millis(max_ms))
                    .unwrap_or(false)
            });
        }

        // 5. prefer_strategies restricts if any survive
        if !criteria.prefer_strategies.is_empty() {
            let preferred: Vec<String> = candidates
                .iter()
                .filter(|name| criteria.prefer_strategies.contains(name))
                .cloned()
                .collect();
            if !preferred.is_empty() {
                candidates = preferred;
            }
        }

        if candidates.is_empty() {
            return Err(BrokerError::NoProviderAvailable {
                operation: "select_strategy".to_string(),
            });
        }

        let policy = *self.policy.lock();
        self.pick_by_policy(candidates, policy, rng_draw)
    }

    fn pick_by_policy(&self, mut candidates: Vec<String>, policy: SelectionPolicy, rng_draw: f64) -> Result<String> {
        // Stable tie-break: lower priority first, then name ascending.
        candidates.sort_by(|a, b| {
            let pa = self.strategies.get(a).map(|e| e.priority).unwrap_or(i32::MAX);
            let pb = self.strategies.get(b).map(|e| e.priority).unwrap_or(i32::MAX);
            pa.cmp(&pb).then_with(|| a.cmp(b))
        });

        let chosen = match policy {
            SelectionPolicy::FirstAvailable => candidates.first().cloned(),
            SelectionPolicy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.get(idx).cloned()
            }
            SelectionPolicy::WeightedRoundRobin => candidates
                .iter()
                .max_by_key(|name| self.strategies.get(*name).map(|e| e.weight).unwrap_or(0))
                .cloned(),
            SelectionPolicy::LeastConnections => candidates
                .iter()
                .min_by_key(|name| self.strategies.get(*name).map(|e| e.metrics.active_operations()).unwrap_or(usize::MAX))
                .cloned(),
            SelectionPolicy::FastestResponse => candidates
                .iter()
                .min_by_key(|name| self.strategies.get(*name).map(|e| e.metrics.p95_response_time()).unwrap_or(Duration::MAX))
                .cloned(),
            SelectionPolicy::HighestSuccessRate => candidates
                .iter()
                .max_by(|a, b| {
                    let ra = self.strategies.get(*a).map(|e| e.metrics.success_rate()).unwrap_or(0.0);
                    let rb = self.strategies.get(*b).map(|e| e.metrics.success_rate()).unwrap_or(0.0);
                    ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .cloned(),
            SelectionPolicy::CapabilityBased => candidates
                .iter()
                .min_by_key(|name| self.strategies.get(*name).map(|e| e.capabilities.len()).unwrap_or(usize::MAX))
                .cloned(),
            SelectionPolicy::HealthBased => candidates
                .iter()
                .max_by_key(|name| self.strategies.get(*name).map(|e| (*e.health.lock()).score()).unwrap_or(0))
                .cloned(),
            SelectionPolicy::Random => {
                let idx = ((rng_draw * candidates.len() as f64) as usize).min(candidates.len() - 1);
                candidates.get(idx).cloned()
            }
        };

        chosen.ok_or_else(|| BrokerError::NoProviderAvailable {
            operation: "select_strategy".to_string(),
        })
    }

    /// Spawn a background task that calls every registered strategy's
    /// `health_check()` on `interval` and feeds the result into
    /// [`ProviderContext::mark_health`] (spec §4.4: "a health checker runs
    /// periodically per strategy"). Returns the task handle so the caller
    /// can abort it on shutdown; dropping the returned `Arc<Self>` clone held
    /// by the task does not stop it by itself.
    pub fn spawn_health_checker(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let ctx = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let names = ctx.names();
                for name in names {
                    let Some(strategy) = ctx.get(&name) else { continue };
                    let health = match strategy.health_check().await {
                        Ok(true) => HealthStatus::Healthy,
                        Ok(false) => HealthStatus::Degraded,
                        Err(_) => HealthStatus::Unhealthy,
                    };
                    ctx.mark_health(&name, health);
                }
            }
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderStrategy>> {
        self.strategies.get(name).map(|e| e.strategy.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.strategies.iter().map(|e| e.key().clone()).collect()
    }

    pub fn capabilities(&self, name: &str) -> Option<HashSet<String>> {
        self.strategies.get(name).map(|e| e.capabilities.clone())
    }

    pub fn config(&self, name: &str) -> Option<std::collections::HashMap<String, String>> {
        self.strategies.get(name).map(|e| e.config.clone())
    }

    pub fn metrics_snapshot(&self, name: &str) -> Option<(f64, Duration, usize)> {
        self.strategies
            .get(name)
            .map(|e| (e.metrics.success_rate(), e.metrics.p95_response_time(), e.metrics.active_operations()))
    }

    /// Run an operation against `strategy_name`, bumping `active_operations`
    /// for the duration and recording the outcome (spec §5 backpressure,
    /// §4.4 metrics).
    pub async fn run_tracked<F, Fut, T>(&self, strategy_name: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn ProviderStrategy>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let entry = self
            .strategies
            .get(strategy_name)
            .ok_or_else(|| BrokerError::NoProviderAvailable {
                operation: strategy_name.to_string(),
            })?;
        let strategy = entry.strategy.clone();
        entry.metrics.begin_operation();
        drop(entry);

        let start = std::time::Instant::now();
        let result = f(strategy).await;
        let elapsed = start.elapsed();

        if let Some(entry) = self.strategies.get(strategy_name) {
            entry.metrics.end_operation();
            entry.metrics.record(result.is_ok(), elapsed);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct StubStrategy {
        name: String,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl ProviderStrategy for StubStrategy {
        fn name(&self) -> &str {
            &self.name
        }

        async fn provision_machines(&self, _request_id: &str, _template: &Template, _count: u32) -> Result<Vec<Machine>> {
            Ok(vec![])
        }

        async fn terminate_machines(&self, _instance_ids: &[String]) -> Result<bool> {
            Ok(true)
        }

        async fn get_machine_status(&self, _instance_ids: &[String]) -> Result<std::collections::HashMap<String, crate::domain::MachineStatus>> {
            Ok(std::collections::HashMap::new())
        }

        async fn validate_template(&self, _template: &Template) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn get_available_templates(&self) -> Result<Vec<Template>> {
            Ok(vec![])
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(self.healthy.load(Ordering::Relaxed))
        }
    }

    fn context_with(names_and_priorities: &[(&str, i32)]) -> ProviderContext {
        let ctx = ProviderContext::new(SelectionPolicy::FirstAvailable);
        for (name, priority) in names_and_priorities {
            ctx.register(
                *name,
                Arc::new(StubStrategy {
                    name: name.to_string(),
                    healthy: AtomicBool::new(true),
                }),
                "aws",
                std::collections::HashMap::new(),
                HashSet::new(),
                *priority,
                1,
            );
        }
        ctx
    }

    #[test]
    fn first_available_picks_lowest_priority() {
        let ctx = context_with(&[("aws-backup", 2), ("aws-primary", 1)]);
        let selected = ctx.select(&SelectionCriteria::default()).unwrap();
        assert_eq!(selected, "aws-primary");
    }

    #[test]
    fn excluded_strategies_are_removed_from_candidates() {
        let ctx = context_with(&[("aws-backup", 2), ("aws-primary", 1)]);
        let criteria = SelectionCriteria {
            exclude_strategies: vec!["aws-primary".to_string()],
            ..Default::default()
        };
        let selected = ctx.select(&criteria).unwrap();
        assert_eq!(selected, "aws-backup");
    }

    #[test]
    fn empty_candidate_set_fails_with_no_provider_available() {
        let ctx = context_with(&[("aws-primary", 1)]);
        let criteria = SelectionCriteria {
            exclude_strategies: vec!["aws-primary".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            ctx.select(&criteria),
            Err(BrokerError::NoProviderAvailable { .. })
        ));
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let ctx = context_with(&[("a", 1), ("b", 1)]);
        ctx.set_policy(SelectionPolicy::RoundRobin);
        let first = ctx.select(&SelectionCriteria::default()).unwrap();
        let second = ctx.select(&SelectionCriteria::default()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn require_healthy_filters_unhealthy_strategies() {
        let ctx = context_with(&[("a", 1), ("b", 2)]);
        ctx.mark_health("a", HealthStatus::Unhealthy);
        let criteria = SelectionCriteria {
            require_healthy: true,
            ..Default::default()
        };
        let selected = ctx.select(&criteria).unwrap();
        assert_eq!(selected, "b");
    }

    #[test]
    fn selection_is_deterministic_given_fixed_rng_draw() {
        let ctx = context_with(&[("a", 1), ("b", 1)]);
        ctx.set_policy(SelectionPolicy::Random);
        let first = ctx.select_with_rng(&SelectionCriteria::default(), 0.1).unwrap();
        let second = ctx.select_with_rng(&SelectionCriteria::default(), 0.1).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn health_checker_marks_an_unhealthy_strategy_from_a_failing_health_check() {
        struct FlakyStrategy {
            name: String,
        }

        #[async_trait]
        impl ProviderStrategy for FlakyStrategy {
            fn name(&self) -> &str {
                &self.name
            }
            async fn provision_machines(&self, _request_id: &str, _template: &Template, _count: u32) -> Result<Vec<Machine>> {
                Ok(vec![])
            }
            async fn terminate_machines(&self, _instance_ids: &[String]) -> Result<bool> {
                Ok(true)
            }
            async fn get_machine_status(&self, _instance_ids: &[String]) -> Result<std::collections::HashMap<String, crate::domain::MachineStatus>> {
                Ok(std::collections::HashMap::new())
            }
            async fn validate_template(&self, _template: &Template) -> Result<Vec<String>> {
                Ok(vec![])
            }
            async fn get_available_templates(&self) -> Result<Vec<Template>> {
                Ok(vec![])
            }
            async fn health_check(&self) -> Result<bool> {
                Ok(false)
            }
        }

        let ctx = Arc::new(ProviderContext::new(SelectionPolicy::FirstAvailable));
        ctx.register(
            "flaky",
            Arc::new(FlakyStrategy { name: "flaky".to_string() }),
            "aws",
            std::collections::HashMap::new(),
            HashSet::new(),
            0,
            1,
        );

        let handle = ctx.spawn_health_checker(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();

        let criteria = SelectionCriteria {
            require_healthy: true,
            ..Default::default()
        };
        assert!(matches!(ctx.select(&criteria), Err(BrokerError::NoProviderAvailable { .. })));
    }
}
