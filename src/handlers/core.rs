//! `BrokerCore`: the application layer's shared state (spec §4.1).
//!
//! One instance is shared behind an `Arc` by every bus handler. It owns the
//! repositories, the provider context, the template manager, the event
//! publisher, and the resilience policies, and exposes one method per
//! orchestrated operation: validate input, load aggregates, invoke the
//! provider context, persist changes, publish events, in that order.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::bus::single_flight::SingleFlight;
use crate::domain::{DomainEvent, EventPublisher, Machine, MachineStatus, Request, RequestType, Template};
use crate::error::{BrokerError, Result, ValidationError};
use crate::provider::{HealthStatus, ProviderContext, ProviderStrategy, SelectionCriteria};
use crate::repository::{MachineRepository, RequestRepository, Repository, TemplateRepository};
use crate::resilience::{with_resilience, CircuitBreaker, CircuitBreakerConfig, ExponentialBackoffPolicy, TimeoutTable};
use crate::template::validation::ValidationReport;
use crate::template::TemplateConfigManager;

pub struct BrokerCore {
    provider_api: String,
    templates: Arc<TemplateConfigManager>,
    template_repo: Arc<TemplateRepository>,
    request_repo: Arc<RequestRepository>,
    machine_repo: Arc<MachineRepository>,
    provider_context: Arc<ProviderContext>,
    events: EventPublisher,
    single_flight: Arc<SingleFlight>,
    retry_policy: ExponentialBackoffPolicy,
    timeout_table: TimeoutTable,
    circuit_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BrokerCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider_api: impl Into<String>,
        templates: Arc<TemplateConfigManager>,
        template_repo: Arc<TemplateRepository>,
        request_repo: Arc<RequestRepository>,
        machine_repo: Arc<MachineRepository>,
        provider_context: Arc<ProviderContext>,
        events: EventPublisher,
        retry_policy: ExponentialBackoffPolicy,
        timeout_table: TimeoutTable,
        circuit_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            provider_api: provider_api.into(),
            templates,
            template_repo,
            request_repo,
            machine_repo,
            provider_context,
            events,
            single_flight: Arc::new(SingleFlight::new()),
            retry_policy,
            timeout_table,
            circuit_config,
            breakers: DashMap::new(),
        }
    }

    fn flush_request_events(&self, request: &mut Request) {
        for event in request.take_events() {
            self.events.publish(event);
        }
    }

    fn breaker_for(&self, strategy_name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(strategy_name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(format!("provider:{strategy_name}"), self.circuit_config)))
            .clone()
    }

    // ---- Requests -------------------------------------------------------

    pub async fn create_provision_request(
        &self,
        template_id: &str,
        machine_count: u32,
        tags: HashMap<String, String>,
        priority: i32,
    ) -> Result<Request> {
        self.create_provision_request_with_id(None, template_id, machine_count, tags, priority).await
    }

    /// At-most-once form: when `idempotency_key` is `Some`, a prior request
    /// persisted under that id is returned as-is instead of provisioning a
    /// second time (spec §4.1: "a handler MUST be idempotent with respect to
    /// repeated identical commands bearing the same `request_id`"; §8: two
    /// `CreateRequest` dispatches with the same id yield one persisted
    /// `Request`). A single-flight lock on the key serializes concurrent
    /// duplicates so the second caller observes the first's result rather
    /// than racing it.
    pub async fn create_provision_request_with_id(
        &self,
        idempotency_key: Option<String>,
        template_id: &str,
        machine_count: u32,
        tags: HashMap<String, String>,
        priority: i32,
    ) -> Result<Request> {
        if machine_count == 0 {
            return Err(BrokerError::Validation(ValidationError::BelowMinimum {
                field: "machine_count".to_string(),
                min: 1,
                actual: 0,
            }));
        }

        let template = self.templates.get_template(&self.provider_api, template_id).await?;
        if machine_count > template.max_number {
            return Err(BrokerError::Validation(ValidationError::AboveMaximum {
                field: "machine_count".to_string(),
                max: template.max_number as i64,
                actual: machine_count as i64,
            }));
        }

        let _guard = if let Some(key) = &idempotency_key {
            Some(self.single_flight.acquire(key).await)
        } else {
            None
        };
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.request_repo.get_by_id(key).await? {
                return Ok(existing);
            }
        }

        let request_id = idempotency_key.unwrap_or_else(|| format!("req-{}", Uuid::new_v4()));
        let mut request = Request::new_provision(request_id.clone(), template_id.to_string(), machine_count, tags, priority);
        self.flush_request_events(&mut request);
        self.request_repo.save(request.clone()).await?;

        let (strategy_name, machines) = match self.provision_with_failover(&request_id, &template, machine_count).await {
            Ok(result) => result,
            Err(e) => {
                request.fail(format!("provisioning failed: {e}"), HashMap::new())?;
                self.flush_request_events(&mut request);
                self.request_repo.save(request.clone()).await?;
                return Err(e);
            }
        };

        let mut machine_ids = Vec::with_capacity(machines.len());
        for mut machine in machines {
            machine.template_id = template_id.to_string();
            machine.request_id = request_id.clone();
            machine_ids.push(machine.machine_id.clone());
            self.machine_repo.save(machine.clone()).await?;
            self.events.publish(DomainEvent::MachineCreated {
                machine_id: machine.machine_id.clone(),
                request_id: request_id.clone(),
                at: Utc::now(),
            });
        }

        request.start_provisioning(machine_ids)?;
        self.flush_request_events(&mut request);
        self.provider_context.mark_health(&strategy_name, HealthStatus::Healthy);

        self.try_advance_request(&mut request).await?;
        self.flush_request_events(&mut request);
        self.request_repo.save(request.clone()).await?;

        Ok(request)
    }

    pub async fn create_return_request(
        &self,
        machine_ids: Vec<String>,
        tags: HashMap<String, String>,
        priority: i32,
    ) -> Result<Request> {
        self.create_return_request_with_id(None, machine_ids, tags, priority).await
    }

    /// At-most-once form, mirroring [`Self::create_provision_request_with_id`].
    pub async fn create_return_request_with_id(
        &self,
        idempotency_key: Option<String>,
        machine_ids: Vec<String>,
        tags: HashMap<String, String>,
        priority: i32,
    ) -> Result<Request> {
        if machine_ids.is_empty() {
            return Err(BrokerError::Validation(ValidationError::MissingField("machine_ids".to_string())));
        }

        let _guard = if let Some(key) = &idempotency_key {
            Some(self.single_flight.acquire(key).await)
        } else {
            None
        };
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.request_repo.get_by_id(key).await? {
                return Ok(existing);
            }
        }

        let request_id = idempotency_key.unwrap_or_else(|| format!("ret-{}", Uuid::new_v4()));
        let mut request = Request::new_return(request_id.clone(), machine_ids.clone(), tags, priority);
        self.flush_request_events(&mut request);
        self.request_repo.save(request.clone()).await?;

        let mut provider_instance_ids = Vec::new();
        for machine_id in &machine_ids {
            let mut machine = self
                .machine_repo
                .get_by_id(machine_id)
                .await?
                .ok_or_else(|| BrokerError::not_found("Machine", machine_id.clone()))?;
            let from = machine.status;
            machine.request_return()?;
            if from != machine.status {
                self.events.publish(DomainEvent::MachineStatusChanged {
                    machine_id: machine_id.clone(),
                    from,
                    to: machine.status,
                    at: Utc::now(),
                });
            }
            if let Some(instance_id) = &machine.provider_instance_id {
                provider_instance_ids.push(instance_id.clone());
            }
            self.machine_repo.save(machine).await?;
        }

        request.start_provisioning(machine_ids)?;
        self.flush_request_events(&mut request);
        self.request_repo.save(request.clone()).await?;

        if !provider_instance_ids.is_empty() {
            if let Err(e) = self.terminate_with_resilience(provider_instance_ids).await {
                request.fail(format!("termination failed: {e}"), HashMap::new())?;
                self.flush_request_events(&mut request);
                self.request_repo.save(request.clone()).await?;
                return Err(e);
            }
        }

        Ok(request)
    }

    /// Re-poll every machine backing `request_id` and advance its status if
    /// eligible. Idempotent: repeating against an already-terminal request is
    /// a no-op (spec §4.3/§4.1 at-most-once guard).
    pub async fn update_request_status(&self, request_id: &str) -> Result<Request> {
        let _guard = self.single_flight.acquire(request_id).await;

        let mut request = self
            .request_repo
            .get_by_id(request_id)
            .await?
            .ok_or_else(|| BrokerError::not_found("Request", request_id))?;
        if request.is_already_resolved() {
            return Ok(request);
        }

        self.refresh_machine_statuses(&request.machine_ids).await?;
        self.try_advance_request(&mut request).await?;
        self.flush_request_events(&mut request);
        self.request_repo.save(request.clone()).await?;
        Ok(request)
    }

    /// Force a finalization check. Shares `update_request_status`'s
    /// poll-then-advance logic; kept as a distinct entry point because a
    /// scheduler may call it explicitly rather than rely on the next poll.
    pub async fn complete_request(&self, request_id: &str) -> Result<Request> {
        self.update_request_status(request_id).await
    }

    pub async fn cleanup_machine_resources(&self, request_id: &str) -> Result<()> {
        let machines = self.machine_repo.find(&|m: &Machine| m.request_id == request_id).await?;
        let instance_ids: Vec<String> = machines.iter().filter_map(|m| m.provider_instance_id.clone()).collect();
        if !instance_ids.is_empty() {
            self.terminate_with_resilience(instance_ids).await?;
        }

        for mut machine in machines {
            let from = machine.status;
            if from.is_terminal() {
                continue;
            }
            if matches!(machine.status, MachineStatus::Running) {
                let _ = machine.request_return();
            }
            match machine.transition_to(MachineStatus::Terminated) {
                Ok(true) => {
                    self.events.publish(DomainEvent::MachineStatusChanged {
                        machine_id: machine.machine_id.clone(),
                        from,
                        to: MachineStatus::Terminated,
                        at: Utc::now(),
                    });
                    self.machine_repo.save(machine).await?;
                }
                Ok(false) => {}
                Err(e) => warn!("could not terminate machine {}: {e}", machine.machine_id),
            }
        }
        Ok(())
    }

    pub async fn get_request(&self, request_id: &str) -> Result<Option<Request>> {
        self.request_repo.get_by_id(request_id).await
    }

    pub async fn list_active_requests(&self) -> Result<Vec<Request>> {
        self.request_repo.find(&|r: &Request| !r.status.is_terminal()).await
    }

    // ---- Machines ---------------------------------------------------------

    pub async fn update_machine_status(&self, machine_id: &str) -> Result<Machine> {
        let mut machine = self
            .machine_repo
            .get_by_id(machine_id)
            .await?
            .ok_or_else(|| BrokerError::not_found("Machine", machine_id))?;
        let Some(instance_id) = machine.provider_instance_id.clone() else {
            return Ok(machine);
        };

        let strategy_name = self.provider_context.select(&SelectionCriteria::default())?;
        let lookup_id = instance_id.clone();
        let statuses = self
            .provider_context
            .run_tracked(&strategy_name, |s| async move { s.get_machine_status(&[lookup_id]).await })
            .await?;

        if let Some(new_status) = statuses.get(&instance_id) {
            let from = machine.status;
            match machine.transition_to(*new_status) {
                Ok(true) => {
                    self.events.publish(DomainEvent::MachineStatusChanged {
                        machine_id: machine.machine_id.clone(),
                        from,
                        to: *new_status,
                        at: Utc::now(),
                    });
                    self.machine_repo.save(machine.clone()).await?;
                }
                Ok(false) => {}
                Err(e) => warn!("ignoring illegal machine transition for {}: {e}", machine.machine_id),
            }
        }
        Ok(machine)
    }

    pub async fn get_machine(&self, machine_id: &str) -> Result<Option<Machine>> {
        self.machine_repo.get_by_id(machine_id).await
    }

    pub async fn list_machines_by_request(&self, request_id: &str) -> Result<Vec<Machine>> {
        self.machine_repo.find(&|m: &Machine| m.request_id == request_id).await
    }

    pub async fn get_active_machine_count(&self) -> Result<u32> {
        let active = self.machine_repo.find(&|m: &Machine| !m.status.is_terminal()).await?;
        Ok(active.len() as u32)
    }

    async fn refresh_machine_statuses(&self, machine_ids: &[String]) -> Result<()> {
        let mut machines = Vec::new();
        for id in machine_ids {
            if let Some(m) = self.machine_repo.get_by_id(id).await? {
                machines.push(m);
            }
        }
        let instance_ids: Vec<String> = machines.iter().filter_map(|m| m.provider_instance_id.clone()).collect();
        if instance_ids.is_empty() {
            return Ok(());
        }

        let strategy_name = self.provider_context.select(&SelectionCriteria::default())?;
        let lookup_ids = instance_ids.clone();
        let statuses = self
            .provider_context
            .run_tracked(&strategy_name, |s| async move { s.get_machine_status(&lookup_ids).await })
            .await?;

        for mut machine in machines {
            let Some(instance_id) = machine.provider_instance_id.clone() else {
                continue;
            };
            let Some(new_status) = statuses.get(&instance_id) else {
                continue;
            };
            let from = machine.status;
            match machine.transition_to(*new_status) {
                Ok(true) => {
                    self.events.publish(DomainEvent::MachineStatusChanged {
                        machine_id: machine.machine_id.clone(),
                        from,
                        to: *new_status,
                        at: Utc::now(),
                    });
                    self.machine_repo.save(machine).await?;
                }
                Ok(false) => {}
                Err(e) => warn!("ignoring illegal machine transition for {}: {e}", machine.machine_id),
            }
        }
        Ok(())
    }

    /// Advance `request` toward a terminal state if the machines backing it
    /// justify it (spec §4.3: full count running -> COMPLETED; any failure ->
    /// FAILED with a per-machine error summary).
    async fn try_advance_request(&self, request: &mut Request) -> Result<()> {
        if request.is_already_resolved() {
            return Ok(());
        }
        let machines = self.machine_repo.find(&|m: &Machine| m.request_id == request.request_id).await?;

        match request.request_type {
            RequestType::Provision => {
                if machines.len() as u32 == request.machine_count
                    && machines.iter().all(|m| m.status == MachineStatus::Running)
                {
                    request.complete()?;
                } else if machines.iter().any(|m| m.status == MachineStatus::Failed) {
                    let machine_errors = machines
                        .iter()
                        .filter(|m| m.status == MachineStatus::Failed)
                        .map(|m| (m.machine_id.clone(), "machine failed to launch".to_string()))
                        .collect();
                    request.fail("one or more machines failed to launch", machine_errors)?;
                }
            }
            RequestType::Return => {
                if machines.iter().all(|m| m.status == MachineStatus::Terminated) {
                    request.complete()?;
                }
            }
        }
        Ok(())
    }

    /// Select a strategy, provision through it, and on a retryable failure
    /// exclude that strategy and try the next candidate (spec §4.4 failover).
    async fn provision_with_failover(&self, request_id: &str, template: &Template, count: u32) -> Result<(String, Vec<Machine>)> {
        let mut excluded: Vec<String> = Vec::new();
        let attempts = self.provider_context.names().len().max(1);
        let mut last_err: Option<BrokerError> = None;

        for _ in 0..attempts {
            let criteria = SelectionCriteria {
                exclude_strategies: excluded.clone(),
                ..Default::default()
            };
            let name = match self.provider_context.select(&criteria) {
                Ok(n) => n,
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            };

            let breaker = self.breaker_for(&name);
            let timeout = self.timeout_table.for_operation("provision_machines");
            let retry_policy = self.retry_policy;
            let ctx = self.provider_context.clone();
            let rid = request_id.to_string();
            let tmpl = template.clone();
            let strategy_name = name.clone();

            let result = with_resilience(&breaker, &retry_policy, timeout, move || {
                let ctx = ctx.clone();
                let rid = rid.clone();
                let tmpl = tmpl.clone();
                let strategy_name = strategy_name.clone();
                async move {
                    ctx.run_tracked(&strategy_name, |s| {
                        let rid = rid.clone();
                        let tmpl = tmpl.clone();
                        async move { s.provision_machines(&rid, &tmpl, count).await }
                    })
                    .await
                }
            })
            .await;

            match result {
                Ok(machines) => return Ok((name, machines)),
                Err(e) => {
                    if crate::error::IsRetryable::is_retryable(&e) {
                        excluded.push(name);
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| BrokerError::NoProviderAvailable {
            operation: "provision_machines".to_string(),
        }))
    }

    async fn terminate_with_resilience(&self, instance_ids: Vec<String>) -> Result<bool> {
        let name = self.provider_context.select(&SelectionCriteria::default())?;
        let breaker = self.breaker_for(&name);
        let timeout = self.timeout_table.for_operation("terminate_machines");
        let retry_policy = self.retry_policy;
        let ctx = self.provider_context.clone();
        let strategy_name = name.clone();
        let ids = instance_ids;

        with_resilience(&breaker, &retry_policy, timeout, move || {
            let ctx = ctx.clone();
            let strategy_name = strategy_name.clone();
            let ids = ids.clone();
            async move { ctx.run_tracked(&strategy_name, |s| { let ids = ids.clone(); async move { s.terminate_machines(&ids).await } }).await }
        })
        .await
    }

    // ---- Templates ----------------------------------------------------

    pub async fn create_template(&self, template: Template) -> Result<Template> {
        if self.template_repo.exists(&template.template_id).await? {
            return Err(BrokerError::Conflict(format!("template {} already exists", template.template_id)));
        }
        self.template_repo.save(template.clone()).await?;
        Ok(template)
    }

    pub async fn update_template(&self, template: Template) -> Result<Template> {
        if !self.template_repo.exists(&template.template_id).await? {
            return Err(BrokerError::not_found("Template", template.template_id.clone()));
        }
        self.template_repo.save(template.clone()).await?;
        Ok(template)
    }

    pub async fn delete_template(&self, template_id: &str) -> Result<bool> {
        self.template_repo.delete(template_id).await
    }

    pub async fn get_template(&self, template_id: &str) -> Result<Template> {
        self.templates.get_template(&self.provider_api, template_id).await
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>> {
        self.templates.list_templates(&self.provider_api).await
    }

    pub fn validate_template(&self, template: &Template) -> ValidationReport {
        self.templates.validate(template)
    }

    // ---- Provider context -----------------------------------------------

    pub fn select_provider_strategy(&self, criteria: &SelectionCriteria) -> Result<String> {
        self.provider_context.select(criteria)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register_provider_strategy(
        &self,
        name: impl Into<String>,
        strategy: Arc<dyn ProviderStrategy>,
        provider_type: impl Into<String>,
        config: std::collections::HashMap<String, String>,
        capabilities: std::collections::HashSet<String>,
        priority: i32,
        weight: u32,
    ) {
        self.provider_context
            .register(name, strategy, provider_type, config, capabilities, priority, weight);
    }

    pub fn update_provider_health(&self, name: &str, health: HealthStatus) {
        self.provider_context.mark_health(name, health);
    }

    pub fn configure_provider_policy(&self, policy: crate::provider::SelectionPolicy) {
        self.provider_context.set_policy(policy);
    }

    pub async fn execute_provider_operation(&self, strategy_name: &str, instance_ids: Vec<String>) -> Result<bool> {
        self.provider_context
            .run_tracked(strategy_name, |s| async move { s.terminate_machines(&instance_ids).await })
            .await
    }

    pub async fn provider_health(&self, name: &str) -> Result<bool> {
        let strategy = self
            .provider_context
            .get(name)
            .ok_or_else(|| BrokerError::NoProviderAvailable { operation: "health_check".to_string() })?;
        strategy.health_check().await
    }

    pub fn list_available_providers(&self) -> Vec<String> {
        self.provider_context.names()
    }

    pub fn provider_capabilities(&self, name: &str) -> Option<std::collections::HashSet<String>> {
        self.provider_context.capabilities(name)
    }

    pub fn provider_metrics(&self, name: &str) -> Option<(f64, std::time::Duration, usize)> {
        self.provider_context.metrics_snapshot(name)
    }

    pub fn provider_config(&self, name: &str) -> Option<std::collections::HashMap<String, String>> {
        self.provider_context.config(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RequestStatus;
    use crate::provider::{ProviderStrategy, SelectionPolicy};
    use crate::repository::in_memory::InMemoryRepository;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubStrategy {
        name: String,
        launched: AtomicU32,
    }

    #[async_trait]
    impl ProviderStrategy for StubStrategy {
        fn name(&self) -> &str {
            &self.name
        }

        async fn provision_machines(&self, request_id: &str, _template: &Template, count: u32) -> Result<Vec<Machine>> {
            let mut machines = Vec::new();
            for _ in 0..count {
                let n = self.launched.fetch_add(1, Ordering::SeqCst);
                let mut m = Machine::new(format!("m-{n}"), request_id.to_string(), String::new());
                m.assign_provider_instance(format!("i-{n}")).unwrap();
                m.transition_to(MachineStatus::Running).unwrap();
                machines.push(m);
            }
            Ok(machines)
        }

        async fn terminate_machines(&self, _instance_ids: &[String]) -> Result<bool> {
            Ok(true)
        }

        async fn get_machine_status(&self, instance_ids: &[String]) -> Result<HashMap<String, MachineStatus>> {
            Ok(instance_ids.iter().map(|id| (id.clone(), MachineStatus::Running)).collect())
        }

        async fn validate_template(&self, _template: &Template) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn get_available_templates(&self) -> Result<Vec<Template>> {
            Ok(vec![])
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn write_template_file(dir: &std::path::Path) {
        let mut f = std::fs::File::create(dir.join("templates.json")).unwrap();
        write!(
            f,
            r#"[{{"templateId": "t1", "image_id": "ami-0abc1234def567890",
                "subnet_ids": "subnet-aaaa1111bbbb2222c", "instance_type": "t3.medium",
                "max_number": 5}}]"#
        )
        .unwrap();
    }

    fn core_with_stub() -> (Arc<BrokerCore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        write_template_file(dir.path());

        let templates = Arc::new(TemplateConfigManager::new(dir.path().to_path_buf(), vec![], Duration::from_secs(60)));
        let provider_context = Arc::new(ProviderContext::new(SelectionPolicy::FirstAvailable));
        provider_context.register(
            "aws-primary",
            Arc::new(StubStrategy {
                name: "aws-primary".to_string(),
                launched: AtomicU32::new(0),
            }),
            "aws",
            std::collections::HashMap::new(),
            HashSet::new(),
            0,
            1,
        );

        let core = Arc::new(BrokerCore::new(
            "aws",
            templates,
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryRepository::new()),
            provider_context,
            EventPublisher::default(),
            ExponentialBackoffPolicy::new(2).with_base(Duration::from_millis(1)),
            TimeoutTable::default(),
            CircuitBreakerConfig::default(),
        ));
        (core, dir)
    }

    #[tokio::test]
    async fn create_provision_request_completes_when_all_machines_come_up_running() {
        let (core, _dir) = core_with_stub();
        let request = core.create_provision_request("t1", 2, HashMap::new(), 0).await.unwrap();
        assert_eq!(request.status, RequestStatus::Completed);
        assert_eq!(request.machine_ids.len(), 2);
    }

    #[tokio::test]
    async fn zero_machine_count_is_rejected() {
        let (core, _dir) = core_with_stub();
        assert!(core.create_provision_request("t1", 0, HashMap::new(), 0).await.is_err());
    }

    #[tokio::test]
    async fn machine_count_over_template_max_is_rejected() {
        let (core, _dir) = core_with_stub();
        assert!(core.create_provision_request("t1", 50, HashMap::new(), 0).await.is_err());
    }

    #[tokio::test]
    async fn update_request_status_on_terminal_request_is_a_noop() {
        let (core, _dir) = core_with_stub();
        let request = core.create_provision_request("t1", 1, HashMap::new(), 0).await.unwrap();
        let refreshed = core.update_request_status(&request.request_id).await.unwrap();
        assert_eq!(refreshed.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn return_request_moves_its_machines_into_stopping() {
        let (core, _dir) = core_with_stub();
        let provision = core.create_provision_request("t1", 1, HashMap::new(), 0).await.unwrap();
        let machine_id = provision.machine_ids[0].clone();

        let ret = core.create_return_request(vec![machine_id.clone()], HashMap::new(), 0).await.unwrap();
        assert_eq!(ret.request_type, RequestType::Return);

        let machine = core.get_machine(&machine_id).await.unwrap().unwrap();
        assert_eq!(machine.status, MachineStatus::Stopping);
    }

    #[tokio::test]
    async fn return_request_with_no_machine_ids_is_rejected() {
        let (core, _dir) = core_with_stub();
        assert!(core.create_return_request(vec![], HashMap::new(), 0).await.is_err());
    }

    #[tokio::test]
    async fn repeated_provision_request_with_same_idempotency_key_provisions_once() {
        let (core, _dir) = core_with_stub();
        let key = Some("req-fixed".to_string());

        let first = core
            .create_provision_request_with_id(key.clone(), "t1", 2, HashMap::new(), 0)
            .await
            .unwrap();
        let second = core
            .create_provision_request_with_id(key, "t1", 2, HashMap::new(), 0)
            .await
            .unwrap();

        assert_eq!(first.request_id, second.request_id);
        assert_eq!(first.machine_ids, second.machine_ids);
        // Only the two machines from the first call exist, not four.
        let all_machines = core.machine_repo.find(&|_: &Machine| true).await.unwrap();
        assert_eq!(all_machines.len(), 2);
    }
}
