//! RunInstances handler: the simplest provisioning mechanism, used when a
//! template requests neither spot, fleet, nor an auto-scaling group (spec
//! §4.5).

use async_trait::async_trait;
use aws_sdk_ec2::Client as Ec2Client;
use std::collections::HashMap;

use crate::domain::{Machine, MachineStatus, Template};
use crate::error::{BrokerError, Result};
use crate::provider::aws::handler_factory::ProvisioningHandler;
use crate::provider::aws::util::{classify_sdk_error, machine_from_instance, normalize_instance_state, tag_specification};

/// AWS bounds a single `RunInstances` call; larger requests are split across
/// multiple calls.
const MAX_INSTANCES_PER_CALL: i32 = 20;

pub struct RunInstancesHandler {
    client: Ec2Client,
}

impl RunInstancesHandler {
    pub fn new(client: Ec2Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProvisioningHandler for RunInstancesHandler {
    fn name(&self) -> &'static str {
        "run_instances"
    }

    async fn provision_instances(&self, request_id: &str, template: &Template, count: u32) -> Result<Vec<Machine>> {
        let instance_type = template.instance_type.as_deref().ok_or_else(|| {
            BrokerError::Internal("template has no resolved instance_type".to_string())
        })?;

        let mut machines = Vec::with_capacity(count as usize);
        let mut remaining = count as i32;

        while remaining > 0 {
            let batch = remaining.min(MAX_INSTANCES_PER_CALL);

            let mut request = self
                .client
                .run_instances()
                .image_id(&template.image_id)
                .instance_type(aws_sdk_ec2::types::InstanceType::from(instance_type))
                .min_count(batch)
                .max_count(batch)
                .tag_specifications(tag_specification(request_id, self.name(), template));

            if let Some(subnet) = template.subnet_ids.first() {
                request = request.subnet_id(subnet);
            }
            if !template.security_group_ids.is_empty() {
                request = request.set_security_group_ids(Some(template.security_group_ids.clone()));
            }
            if let Some(profile) = &template.instance_profile {
                request = request.iam_instance_profile(
                    aws_sdk_ec2::types::IamInstanceProfileSpecification::builder()
                        .name(profile)
                        .build(),
                );
            }
            if let Some(user_data) = &template.user_data {
                request = request.user_data(user_data);
            }

            let response = request.send().await.map_err(|e| {
                let code = e.as_service_error().and_then(|s| s.meta().code());
                classify_sdk_error("aws", e.to_string(), code)
            })?;

            for instance in response.instances() {
                machines.push(machine_from_instance(request_id, &template.template_id, instance));
            }

            remaining -= batch;
        }

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
        if template.instance_type.is_none() {
            errors.push("instance_type is required for run_instances".to_string());
        }
        if template.subnet_ids.is_empty() {
            errors.push("at least one subnet is required".to_string());
        }
        Ok(errors)
    }
}
