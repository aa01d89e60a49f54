//! EC2Fleet handler: the default mechanism for templates that don't ask for
//! spot, an auto-scaling group, or plain RunInstances (spec §4.5). Builds a
//! `LaunchTemplateConfigs` + `TargetCapacitySpecification` fleet request of
//! type `instant`, honoring heterogeneous instance-type weighting.

use async_trait::async_trait;
use aws_sdk_ec2::Client as Ec2Client;
use std::collections::HashMap;

use crate::domain::{Machine, MachineStatus, Template};
use crate::error::{BrokerError, Result};
use crate::provider::aws::handler_factory::ProvisioningHandler;
use crate::provider::aws::util::{classify_sdk_error, machine_from_instance, normalize_instance_state};

pub struct Ec2FleetHandler {
    client: Ec2Client,
    /// Launch template that fleet requests reference; provisioned out of
    /// band (e.g. by infrastructure-as-code), not created per-request.
    launch_template_id: Option<String>,
}

impl Ec2FleetHandler {
    pub fn new(client: Ec2Client, launch_template_id: Option<String>) -> Self {
        Self {
            client,
            launch_template_id,
        }
    }

    fn launch_template_configs(&self, template: &Template) -> Vec<aws_sdk_ec2::types::FleetLaunchTemplateConfigRequest> {
        let template_id = self
            .launch_template_id
            .clone()
            .or_else(|| template.spot.launch_template_id.clone());

        let mut overrides = Vec::new();
        if let Some(types) = &template.instance_types {
            for (instance_type, weight) in types {
                let mut o = aws_sdk_ec2::types::FleetLaunchTemplateOverridesRequest::builder()
                    .instance_type(aws_sdk_ec2::types::InstanceType::from(instance_type.as_str()))
                    .weighted_capacity(*weight as f64);
                if let Some(subnet) = template.subnet_ids.first() {
                    o = o.subnet_id(subnet);
                }
                overrides.push(o.build());
            }
        } else if let Some(instance_type) = &template.instance_type {
            let mut o = aws_sdk_ec2::types::FleetLaunchTemplateOverridesRequest::builder()
                .instance_type(aws_sdk_ec2::types::InstanceType::from(instance_type.as_str()));
            if let Some(subnet) = template.subnet_ids.first() {
                o = o.subnet_id(subnet);
            }
            overrides.push(o.build());
        }

        let spec = aws_sdk_ec2::types::FleetLaunchTemplateSpecificationRequest::builder()
            .set_launch_template_id(template_id)
            .version("$Latest")
            .build();

        vec![aws_sdk_ec2::types::FleetLaunchTemplateConfigRequest::builder()
            .launch_template_specification(spec)
            .set_overrides(Some(overrides))
            .build()]
    }
}

#[async_trait]
impl ProvisioningHandler for Ec2FleetHandler {
    fn name(&self) -> &'static str {
        "ec2_fleet"
    }

    async fn provision_instances(&self, request_id: &str, template: &Template, count: u32) -> Result<Vec<Machine>> {
        let target_capacity = aws_sdk_ec2::types::TargetCapacitySpecificationRequest::builder()
            .total_target_capacity(count as i32)
            .default_target_capacity_type(aws_sdk_ec2::types::DefaultTargetCapacityType::OnDemand)
            .build();

        let response = self
            .client
            .create_fleet()
            .r#type(aws_sdk_ec2::types::FleetType::Instant)
            .set_launch_template_configs(Some(self.launch_template_configs(template)))
            .target_capacity_specification(target_capacity)
            .send()
            .await
            .map_err(|e| {
                let code = e.as_service_error().and_then(|s| s.meta().code());
                classify_sdk_error("aws", e.to_string(), code)
            })?;

        let instance_ids: Vec<String> = response
            .instances()
            .iter()
            .flat_map(|i| i.instance_ids())
            .map(|id| id.to_string())
            .collect();

        if instance_ids.is_empty() {
            return Err(BrokerError::provider_transient(
                "aws",
                "fleet request returned zero instances",
            ));
        }

        let described = self
            .client
            .describe_instances()
            .set_instance_ids(Some(instance_ids))
            .send()
            .await
            .map_err(|e| {
                let code = e.as_service_error().and_then(|s| s.meta().code());
                classify_sdk_error("aws", e.to_string(), code)
            })?;

        let machines = described
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(|instance| machine_from_instance(request_id, &template.template_id, instance))
            .collect();

        Ok(machines)
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<bool> {
        if instance_ids.is_empty() {
            return Ok(true);
        }
        self.client
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(|e| {
                let code = e.as_service_error().and_then(|s| s.meta().code());
                classify_sdk_error("aws", e.to_string(), code)
            })?;
        Ok(true)
    }

    async fn get_instance_status(&self, instance_ids: &[String]) -> Result<HashMap<String, MachineStatus>> {
        if instance_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let response = self
            .client
            .describe_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(|e| {
                let code = e.as_service_error().and_then(|s| s.meta().code());
                classify_sdk_error("aws", e.to_string(), code)
            })?;

        let mut statuses = HashMap::new();
        for reservation in response.reservations() {
            for instance in reservation.instances() {
                if let Some(id) = instance.instance_id() {
                    let state_name = instance
                        .state()
                        .and_then(|s| s.name())
                        .map(|n| n.as_str().to_string())
                        .unwrap_or_default();
                    statuses.insert(id.to_string(), normalize_instance_state(&state_name));
                }
            }
        }
        Ok(statuses)
    }

    async fn validate_template(&self, template: &Template) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        if template.instance_type.is_none() && template.instance_types.is_none() {
            errors.push("instance_type or instance_types is required for ec2_fleet".to_string());
        }
        if self.launch_template_id.is_none() && template.spot.launch_template_id.is_none() {
            errors.push("launch_template_id is required for ec2_fleet".to_string());
        }
        Ok(errors)
    }
}
