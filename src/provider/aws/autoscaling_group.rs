//! AutoScalingGroup handler: used when a template sets `use_auto_scaling`
//! (spec §4.5). Ensures a launch template exists, creates (or resizes) an
//! ASG sized to the request, and polls for `InService` instances.

use async_trait::async_trait;
use aws_sdk_autoscaling::Client as AutoScalingClient;
use aws_sdk_ec2::Client as Ec2Client;
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::{Machine, MachineStatus, Template};
use crate::error::{BrokerError, Result};
use crate::provider::aws::handler_factory::ProvisioningHandler;
use crate::provider::aws::util::{classify_sdk_error, machine_from_instance, normalize_instance_state};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_POLLS: u32 = 60;

pub struct AutoScalingGroupHandler {
    asg_client: AutoScalingClient,
    ec2_client: Ec2Client,
}

impl AutoScalingGroupHandler {
    pub fn new(asg_client: AutoScalingClient, ec2_client: Ec2Client) -> Self {
        Self {
            asg_client,
            ec2_client,
        }
    }

    fn group_name(request_id: &str) -> String {
        format!("hf-broker-{request_id}")
    }
}

#[async_trait]
impl ProvisioningHandler for AutoScalingGroupHandler {
    fn name(&self) -> &'static str {
        "autoscaling_group"
    }

    async fn provision_instances(&self, request_id: &str, template: &Template, count: u32) -> Result<Vec<Machine>> {
        let launch_template_id = template.spot.launch_template_id.clone().ok_or_else(|| {
            BrokerError::Internal("autoscaling_group requires a launch_template_id on the template".to_string())
        })?;

        let group_name = Self::group_name(request_id);

        self.asg_client
            .create_auto_scaling_group()
            .auto_scaling_group_name(&group_name)
            .launch_template(
                aws_sdk_autoscaling::types::LaunchTemplateSpecification::builder()
                    .launch_template_id(&launch_template_id)
                    .version("$Latest")
                    .build(),
            )
            .min_size(count as i32)
            .max_size(count as i32)
            .desired_capacity(count as i32)
            .set_vpc_zone_identifier(Some(template.subnet_ids.join(",")))
            .send()
            .await
            .map_err(|e| {
                let code = e.as_service_error().and_then(|s| s.meta().code());
                classify_sdk_error("aws", e.to_string(), code)
            })?;

        let mut instance_ids = Vec::new();
        for _ in 0..MAX_POLLS {
            let described = self
                .asg_client
                .describe_auto_scaling_groups()
                .auto_scaling_group_names(&group_name)
                .send()
                .await
                .map_err(|e| {
                    let code = e.as_service_error().and_then(|s| s.meta().code());
                    classify_sdk_error("aws", e.to_string(), code)
                })?;

            let group = described.auto_scaling_groups().first().cloned();
            instance_ids = group
                .map(|g| {
                    g.instances()
                        .iter()
                        .filter(|i| i.lifecycle_state().map(|s| s.as_str() == "InService").unwrap_or(false))
                        .filter_map(|i| i.instance_id().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();

            if instance_ids.len() as u32 >= count {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if instance_ids.is_empty() {
            return Err(BrokerError::provider_transient(
                "aws",
                "auto scaling group did not reach the requested capacity within the polling window",
            ));
        }

        let described = self
            .ec2_client
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
        for id in instance_ids {
            self.asg_client
                .terminate_instance_in_auto_scaling_group()
                .instance_id(id)
                .should_decrement_desired_capacity(true)
                .send()
                .await
                .map_err(|e| {
                    let code = e.as_service_error().and_then(|s| s.meta().code());
                    classify_sdk_error("aws", e.to_string(), code)
                })?;
        }
        Ok(true)
    }

    async fn get_instance_status(&self, instance_ids: &[String]) -> Result<HashMap<String, MachineStatus>> {
        if instance_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let response = self
            .ec2_client
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
        if template.spot.launch_template_id.is_none() {
            errors.push("launch_template_id is required for autoscaling_group".to_string());
        }
        if template.subnet_ids.is_empty() {
            errors.push("at least one subnet is required".to_string());
        }
        Ok(errors)
    }
}
