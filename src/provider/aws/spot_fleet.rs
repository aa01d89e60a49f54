//! SpotFleet handler: used when a template requests spot pricing (spec
//! §4.5). Builds a spot fleet request honoring `allocation_strategy` and
//! `max_spot_price`, then polls until the requested capacity is fulfilled.

use async_trait::async_trait;
use aws_sdk_ec2::Client as Ec2Client;
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::{Machine, MachineStatus, Template};
use crate::error::{BrokerError, Result};
use crate::provider::aws::handler_factory::ProvisioningHandler;
use crate::provider::aws::util::{classify_sdk_error, machine_from_instance, normalize_instance_state};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_POLLS: u32 = 60;

pub struct SpotFleetHandler {
    client: Ec2Client,
}

impl SpotFleetHandler {
    pub fn new(client: Ec2Client) -> Self {
        Self { client }
    }

    fn allocation_strategy(template: &Template) -> aws_sdk_ec2::types::SpotAllocationStrategy {
        match template.spot.allocation_strategy.as_deref() {
            Some("diversified") => aws_sdk_ec2::types::SpotAllocationStrategy::Diversified,
            Some("capacity-optimized") => aws_sdk_ec2::types::SpotAllocationStrategy::CapacityOptimized,
            _ => aws_sdk_ec2::types::SpotAllocationStrategy::LowestPrice,
        }
    }

    fn launch_specs(&self, template: &Template) -> Vec<aws_sdk_ec2::types::SpotFleetLaunchSpecification> {
        let instance_types: Vec<&String> = match &template.instance_types {
            Some(types) => types.keys().collect(),
            None => template.instance_type.iter().collect(),
        };

        instance_types
            .into_iter()
            .map(|instance_type| {
                let mut spec = aws_sdk_ec2::types::SpotFleetLaunchSpecification::builder()
                    .image_id(&template.image_id)
                    .instance_type(aws_sdk_ec2::types::InstanceType::from(instance_type.as_str()));
                if let Some(subnet) = template.subnet_ids.first() {
                    spec = spec.subnet_id(subnet);
                }
                if !template.security_group_ids.is_empty() {
                    spec = spec.set_security_groups(Some(
                        template
                            .security_group_ids
                            .iter()
                            .map(|id| aws_sdk_ec2::types::GroupIdentifier::builder().group_id(id).build())
                            .collect(),
                    ));
                }
                spec.build()
            })
            .collect()
    }
}

#[async_trait]
impl ProvisioningHandler for SpotFleetHandler {
    fn name(&self) -> &'static str {
        "spot_fleet"
    }

    async fn provision_instances(&self, request_id: &str, template: &Template, count: u32) -> Result<Vec<Machine>> {
        let mut config = aws_sdk_ec2::types::SpotFleetRequestConfigData::builder()
            .target_capacity(count as i32)
            .allocation_strategy(Self::allocation_strategy(template))
            .set_launch_specifications(Some(self.launch_specs(template)))
            .r#type(aws_sdk_ec2::types::FleetType::Request);

        if let Some(price) = &template.spot.max_spot_price {
            config = config.spot_price(price);
        }
        if let Some(role) = &template.spot.fleet_role {
            config = config.iam_fleet_role(role);
        }

        let response = self
            .client
            .request_spot_fleet()
            .spot_fleet_request_config(config.build().map_err(|e| {
                BrokerError::Internal(format!("invalid spot fleet config: {e}"))
            })?)
            .send()
            .await
            .map_err(|e| {
                let code = e.as_service_error().and_then(|s| s.meta().code());
                classify_sdk_error("aws", e.to_string(), code)
            })?;

        let fleet_request_id = response
            .spot_fleet_request_id()
            .ok_or_else(|| BrokerError::provider_transient("aws", "no spot fleet request id in response"))?
            .to_string();

        let mut instance_ids = Vec::new();
        for _ in 0..MAX_POLLS {
            let active = self
                .client
                .describe_spot_fleet_instances()
                .spot_fleet_request_id(&fleet_request_id)
                .send()
                .await
                .map_err(|e| {
                    let code = e.as_service_error().and_then(|s| s.meta().code());
                    classify_sdk_error("aws", e.to_string(), code)
                })?;

            instance_ids = active
                .active_instances()
                .iter()
                .filter_map(|i| i.instance_id().map(|s| s.to_string()))
                .collect();

            if instance_ids.len() as u32 >= count {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if instance_ids.is_empty() {
            return Err(BrokerError::provider_transient(
                "aws",
                "spot fleet request was not fulfilled within the polling window",
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

        Ok(described
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(|instance| machine_from_instance(request_id, &template.template_id, instance))
            .collect())
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
            errors.push("instance_type or instance_types is required for spot_fleet".to_string());
        }
        if template.spot.fleet_role.is_none() {
            errors.push("fleet_role is required for spot_fleet".to_string());
        }
        Ok(errors)
    }
}
