//! AWS provider strategy (spec §4.5): bootstraps the AWS SDK clients,
//! dispatches provisioning to the mechanism the handler factory selects, and
//! implements the cloud-agnostic [`ProviderStrategy`] contract.

pub mod autoscaling_group;
pub mod ec2_fleet;
pub mod handler_factory;
pub mod run_instances;
pub mod spot_fleet;
pub mod util;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_autoscaling::Client as AutoScalingClient;
use aws_sdk_ec2::Client as Ec2Client;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{Machine, MachineStatus, Template};
use crate::error::Result;
use crate::provider::ProviderStrategy;
use crate::template::TemplateConfigManager;

use self::autoscaling_group::AutoScalingGroupHandler;
use self::ec2_fleet::Ec2FleetHandler;
use self::handler_factory::{select_handler, HandlerKind, ProvisioningHandler};
use self::run_instances::RunInstancesHandler;
use self::spot_fleet::SpotFleetHandler;

pub struct AwsStrategy {
    name: String,
    run_instances: RunInstancesHandler,
    ec2_fleet: Ec2FleetHandler,
    spot_fleet: SpotFleetHandler,
    autoscaling_group: AutoScalingGroupHandler,
    templates: Arc<TemplateConfigManager>,
}

impl AwsStrategy {
    pub async fn bootstrap(name: impl Into<String>, templates: Arc<TemplateConfigManager>) -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let ec2_client = Ec2Client::new(&config);
        let asg_client = AutoScalingClient::new(&config);

        Self {
            name: name.into(),
            run_instances: RunInstancesHandler::new(ec2_client.clone()),
            ec2_fleet: Ec2FleetHandler::new(ec2_client.clone(), None),
            spot_fleet: SpotFleetHandler::new(ec2_client.clone()),
            autoscaling_group: AutoScalingGroupHandler::new(asg_client, ec2_client),
            templates,
        }
    }

    fn handler_for(&self, kind: HandlerKind) -> &dyn ProvisioningHandler {
        match kind {
            HandlerKind::RunInstances => &self.run_instances,
            HandlerKind::Ec2Fleet => &self.ec2_fleet,
            HandlerKind::SpotFleet => &self.spot_fleet,
            HandlerKind::AutoScalingGroup => &self.autoscaling_group,
        }
    }
}

#[async_trait]
impl ProviderStrategy for AwsStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn provision_machines(&self, request_id: &str, template: &Template, count: u32) -> Result<Vec<Machine>> {
        let handler = self.handler_for(select_handler(template));
        handler.provision_instances(request_id, template, count).await
    }

    async fn terminate_machines(&self, instance_ids: &[String]) -> Result<bool> {
        // Any handler's terminate path is equivalent: all route through
        // `TerminateInstances` (the ASG handler decrements capacity too).
        self.run_instances.terminate_instances(instance_ids).await
    }

    async fn get_machine_status(&self, instance_ids: &[String]) -> Result<HashMap<String, MachineStatus>> {
        self.run_instances.get_instance_status(instance_ids).await
    }

    async fn validate_template(&self, template: &Template) -> Result<Vec<String>> {
        let handler = self.handler_for(select_handler(template));
        handler.validate_template(template).await
    }

    async fn get_available_templates(&self) -> Result<Vec<Template>> {
        self.templates.list_templates("aws").await
    }

    async fn health_check(&self) -> Result<bool> {
        let result = self.run_instances.get_instance_status(&[]).await;
        Ok(result.is_ok())
    }
}
