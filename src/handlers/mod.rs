//! Command/query types and the handlers that bind them to [`core::BrokerCore`]
//! through the [`crate::bus::Bus`] (spec §4.1).
//!
//! `BrokerCore` already does the real work (validate, load aggregates,
//! invoke the provider context, persist, publish); everything in this module
//! is the thin `CommandHandler`/`QueryHandler` adapter the bus dispatches to,
//! one per recognized command/query name from spec §4.1's two lists.

pub mod core;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::bus::{Bus, Command, CommandHandler, Query, QueryHandler};
use crate::domain::{Machine, Request, Template};
use crate::error::Result;
use crate::provider::{HealthStatus, SelectionCriteria, SelectionPolicy};
use crate::template::validation::ValidationReport;

use self::core::BrokerCore;

// ---- Commands ---------------------------------------------------------

pub struct CreateRequest {
    pub template_id: String,
    pub machine_count: u32,
    pub tags: HashMap<String, String>,
    pub priority: i32,
    /// Optional caller-supplied idempotency key (spec §4.1/§8 at-most-once:
    /// repeated dispatches with the same id return the first's outcome
    /// instead of provisioning twice). `None` generates a fresh `req-<uuid>`.
    pub idempotency_key: Option<String>,
}
impl Command for CreateRequest {
    type Output = Request;
}

pub struct UpdateRequestStatus {
    pub request_id: String,
}
impl Command for UpdateRequestStatus {
    type Output = Request;
}

pub struct CompleteRequest {
    pub request_id: String,
}
impl Command for CompleteRequest {
    type Output = Request;
}

pub struct ReturnMachines {
    pub machine_ids: Vec<String>,
    pub tags: HashMap<String, String>,
    pub priority: i32,
    /// See [`CreateRequest::idempotency_key`].
    pub idempotency_key: Option<String>,
}
impl Command for ReturnMachines {
    type Output = Request;
}

pub struct UpdateMachineStatus {
    pub machine_id: String,
}
impl Command for UpdateMachineStatus {
    type Output = Machine;
}

pub struct CleanupMachineResources {
    pub request_id: String,
}
impl Command for CleanupMachineResources {
    type Output = ();
}

pub struct ValidateTemplateCommand {
    pub template: Template,
}
impl Command for ValidateTemplateCommand {
    type Output = ValidationReport;
}

pub struct CreateTemplate {
    pub template: Template,
}
impl Command for CreateTemplate {
    type Output = Template;
}

pub struct UpdateTemplate {
    pub template: Template,
}
impl Command for UpdateTemplate {
    type Output = Template;
}

pub struct DeleteTemplate {
    pub template_id: String,
}
impl Command for DeleteTemplate {
    type Output = bool;
}

pub struct SelectProviderStrategy {
    pub criteria: SelectionCriteria,
}
impl Command for SelectProviderStrategy {
    type Output = String;
}

pub struct ExecuteProviderOperation {
    pub strategy_name: String,
    pub instance_ids: Vec<String>,
}
impl Command for ExecuteProviderOperation {
    type Output = bool;
}

pub struct RegisterProviderStrategy {
    pub name: String,
    pub strategy: Arc<dyn crate::provider::ProviderStrategy>,
    pub provider_type: String,
    pub config: std::collections::HashMap<String, String>,
    pub capabilities: std::collections::HashSet<String>,
    pub priority: i32,
    pub weight: u32,
}
impl Command for RegisterProviderStrategy {
    type Output = ();
}

pub struct UpdateProviderHealth {
    pub name: String,
    pub health: HealthStatus,
}
impl Command for UpdateProviderHealth {
    type Output = ();
}

pub struct ConfigureProviderStrategy {
    pub policy: SelectionPolicy,
}
impl Command for ConfigureProviderStrategy {
    type Output = ();
}

// ---- Queries ------------------------------------------------------------

pub struct GetRequest {
    pub request_id: String,
}
impl Query for GetRequest {
    type Output = Option<Request>;
}

pub struct ListActiveRequests;
impl Query for ListActiveRequests {
    type Output = Vec<Request>;
}

pub struct GetRequestStatus {
    pub request_id: String,
}
impl Query for GetRequestStatus {
    type Output = Option<Request>;
}

pub struct GetMachine {
    pub machine_id: String,
}
impl Query for GetMachine {
    type Output = Option<Machine>;
}

pub struct ListMachinesByRequest {
    pub request_id: String,
}
impl Query for ListMachinesByRequest {
    type Output = Vec<Machine>;
}

pub struct GetActiveMachineCount;
impl Query for GetActiveMachineCount {
    type Output = u32;
}

pub struct ListTemplates;
impl Query for ListTemplates {
    type Output = Vec<Template>;
}

pub struct GetTemplate {
    pub template_id: String,
}
impl Query for GetTemplate {
    type Output = Template;
}

pub struct GetProviderHealth {
    pub name: String,
}
impl Query for GetProviderHealth {
    type Output = bool;
}

pub struct ListAvailableProviders;
impl Query for ListAvailableProviders {
    type Output = Vec<String>;
}

pub struct GetProviderCapabilities {
    pub name: String,
}
impl Query for GetProviderCapabilities {
    type Output = Option<std::collections::HashSet<String>>;
}

pub struct GetProviderMetrics {
    pub name: String,
}
impl Query for GetProviderMetrics {
    type Output = Option<(f64, std::time::Duration, usize)>;
}

pub struct GetProviderConfig {
    pub name: String,
}
impl Query for GetProviderConfig {
    type Output = Option<std::collections::HashMap<String, String>>;
}

pub struct ValidateTemplate {
    pub template: Template,
}
impl Query for ValidateTemplate {
    type Output = ValidationReport;
}

// ---- Handlers -------------------------------------------------------------
//
// Every handler is the same one-line shape: unpack the command/query, call
// the matching `BrokerCore` method. Registration happens once in
// `register_all`, in the teacher's "explicit wiring function" style (see
// spec §9's "no runtime reflection... a small code-generated registry or an
// explicit wiring function").

struct CoreHandler(Arc<BrokerCore>);

macro_rules! command_handler {
    ($cmd:ty, |$self:ident, $input:ident| $body:expr) => {
        #[async_trait]
        impl CommandHandler<$cmd> for CoreHandler {
            async fn handle(&$self, $input: $cmd) -> Result<<$cmd as Command>::Output> {
                $body
            }
        }
    };
}

macro_rules! query_handler {
    ($q:ty, |$self:ident, $input:ident| $body:expr) => {
        #[async_trait]
        impl QueryHandler<$q> for CoreHandler {
            async fn handle(&$self, $input: $q) -> Result<<$q as Query>::Output> {
                $body
            }
        }
    };
}

command_handler!(CreateRequest, |self, cmd| self
    .0
    .create_provision_request_with_id(cmd.idempotency_key, &cmd.template_id, cmd.machine_count, cmd.tags, cmd.priority)
    .await);

command_handler!(UpdateRequestStatus, |self, cmd| self.0.update_request_status(&cmd.request_id).await);

command_handler!(CompleteRequest, |self, cmd| self.0.complete_request(&cmd.request_id).await);

command_handler!(ReturnMachines, |self, cmd| self
    .0
    .create_return_request_with_id(cmd.idempotency_key, cmd.machine_ids, cmd.tags, cmd.priority)
    .await);

command_handler!(UpdateMachineStatus, |self, cmd| self.0.update_machine_status(&cmd.machine_id).await);

command_handler!(CleanupMachineResources, |self, cmd| self.0.cleanup_machine_resources(&cmd.request_id).await);

command_handler!(ValidateTemplateCommand, |self, cmd| Ok(self.0.validate_template(&cmd.template)));

command_handler!(CreateTemplate, |self, cmd| self.0.create_template(cmd.template).await);

command_handler!(UpdateTemplate, |self, cmd| self.0.update_template(cmd.template).await);

command_handler!(DeleteTemplate, |self, cmd| self.0.delete_template(&cmd.template_id).await);

command_handler!(SelectProviderStrategy, |self, cmd| self.0.select_provider_strategy(&cmd.criteria));

command_handler!(ExecuteProviderOperation, |self, cmd| self
    .0
    .execute_provider_operation(&cmd.strategy_name, cmd.instance_ids)
    .await);

#[async_trait]
impl CommandHandler<RegisterProviderStrategy> for CoreHandler {
    async fn handle(&self, cmd: RegisterProviderStrategy) -> Result<()> {
        self.0.register_provider_strategy(
            cmd.name,
            cmd.strategy,
            cmd.provider_type,
            cmd.config,
            cmd.capabilities,
            cmd.priority,
            cmd.weight,
        );
        Ok(())
    }
}

command_handler!(UpdateProviderHealth, |self, cmd| {
    self.0.update_provider_health(&cmd.name, cmd.health);
    Ok(())
});

command_handler!(ConfigureProviderStrategy, |self, cmd| {
    self.0.configure_provider_policy(cmd.policy);
    Ok(())
});

query_handler!(GetRequest, |self, q| self.0.get_request(&q.request_id).await);

query_handler!(ListActiveRequests, |self, _q| self.0.list_active_requests().await);

query_handler!(GetRequestStatus, |self, q| self.0.get_request(&q.request_id).await);

query_handler!(GetMachine, |self, q| self.0.get_machine(&q.machine_id).await);

query_handler!(ListMachinesByRequest, |self, q| self.0.list_machines_by_request(&q.request_id).await);

query_handler!(GetActiveMachineCount, |self, _q| self.0.get_active_machine_count().await);

query_handler!(ListTemplates, |self, _q| self.0.list_templates().await);

query_handler!(GetTemplate, |self, q| self.0.get_template(&q.template_id).await);

query_handler!(GetProviderHealth, |self, q| self.0.provider_health(&q.name).await);

query_handler!(ListAvailableProviders, |self, _q| Ok(self.0.list_available_providers()));

query_handler!(GetProviderCapabilities, |self, q| Ok(self.0.provider_capabilities(&q.name)));

query_handler!(GetProviderMetrics, |self, q| Ok(self.0.provider_metrics(&q.name)));

query_handler!(GetProviderConfig, |self, q| Ok(self.0.provider_config(&q.name)));

query_handler!(ValidateTemplate, |self, q| Ok(self.0.validate_template(&q.template)));

/// Register every recognized command and query (spec §4.1) against a single
/// shared [`BrokerCore`]. Registration order doesn't matter — the bus
/// resolves handlers lazily by type — but this is the one place that must
/// register all of them before the first dispatch.
pub fn register_all(bus: &mut Bus, core: Arc<BrokerCore>) {
    macro_rules! reg_cmd {
        ($cmd:ty) => {
            bus.register_command::<$cmd>(CoreHandler(core.clone()));
        };
    }
    macro_rules! reg_query {
        ($q:ty) => {
            bus.register_query::<$q>(CoreHandler(core.clone()));
        };
    }

    reg_cmd!(CreateRequest);
    reg_cmd!(UpdateRequestStatus);
    reg_cmd!(CompleteRequest);
    reg_cmd!(ReturnMachines);
    reg_cmd!(UpdateMachineStatus);
    reg_cmd!(CleanupMachineResources);
    reg_cmd!(ValidateTemplateCommand);
    reg_cmd!(CreateTemplate);
    reg_cmd!(UpdateTemplate);
    reg_cmd!(DeleteTemplate);
    reg_cmd!(SelectProviderStrategy);
    reg_cmd!(ExecuteProviderOperation);
    reg_cmd!(RegisterProviderStrategy);
    reg_cmd!(UpdateProviderHealth);
    reg_cmd!(ConfigureProviderStrategy);

    reg_query!(GetRequest);
    reg_query!(ListActiveRequests);
    reg_query!(GetRequestStatus);
    reg_query!(GetMachine);
    reg_query!(ListMachinesByRequest);
    reg_query!(GetActiveMachineCount);
    reg_query!(ListTemplates);
    reg_query!(GetTemplate);
    reg_query!(GetProviderHealth);
    reg_query!(ListAvailableProviders);
    reg_query!(GetProviderCapabilities);
    reg_query!(GetProviderMetrics);
    reg_query!(GetProviderConfig);
    reg_query!(ValidateTemplate);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventPublisher;
    use crate::provider::ProviderContext;
    use crate::repository::in_memory::InMemoryRepository;
    use crate::resilience::{CircuitBreakerConfig, ExponentialBackoffPolicy, TimeoutTable};
    use crate::template::TemplateConfigManager;
    use std::io::Write;
    use std::time::Duration;

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

    async fn bus_with_stub_core() -> (Bus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        write_template_file(dir.path());

        let templates = Arc::new(TemplateConfigManager::new(dir.path().to_path_buf(), vec![], Duration::from_secs(60)));
        let provider_context = Arc::new(ProviderContext::new(SelectionPolicy::FirstAvailable));

        let broker_core = Arc::new(BrokerCore::new(
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

        let mut bus = Bus::new();
        register_all(&mut bus, broker_core);
        (bus, dir)
    }

    #[tokio::test]
    async fn get_template_query_dispatches_through_the_bus() {
        let (bus, _dir) = bus_with_stub_core().await;
        let template = bus.query(GetTemplate { template_id: "t1".to_string() }).await.unwrap();
        assert_eq!(template.template_id, "t1");
    }

    #[tokio::test]
    async fn list_available_providers_starts_empty_until_registered() {
        let (bus, _dir) = bus_with_stub_core().await;
        let providers = bus.query(ListAvailableProviders).await.unwrap();
        assert!(providers.is_empty());
    }

    #[tokio::test]
    async fn zero_machine_count_create_request_is_rejected_through_the_bus() {
        let (bus, _dir) = bus_with_stub_core().await;
        let result = bus
            .dispatch(CreateRequest {
                template_id: "t1".to_string(),
                machine_count: 0,
                tags: HashMap::new(),
                priority: 0,
                idempotency_key: None,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn create_request_with_same_idempotency_key_is_a_single_persisted_request() {
        let (bus, _dir) = bus_with_stub_core().await;
        let cmd = || CreateRequest {
            template_id: "t1".to_string(),
            machine_count: 1,
            tags: HashMap::new(),
            priority: 0,
            idempotency_key: Some("req-fixed-key".to_string()),
        };

        // No provider is registered in `bus_with_stub_core`, so the first
        // dispatch fails provisioning (and persists a FAILED request under
        // the key). The second dispatch must find that persisted outcome
        // and return it rather than re-attempting provisioning.
        let first = bus.dispatch(cmd()).await;
        assert!(first.is_err());

        let second = bus.dispatch(cmd()).await.unwrap();
        assert_eq!(second.request_id, "req-fixed-key");

        let get = bus.query(GetRequest { request_id: "req-fixed-key".to_string() }).await.unwrap();
        assert_eq!(get.unwrap().request_id, second.request_id);
    }
}
