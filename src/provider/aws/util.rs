//! Shared utilities for the AWS provisioning handlers (spec §4.5): tag
//! building, response parsing, and SDK error classification.

use std::collections::HashMap;

use crate::domain::{Machine, MachineStatus, Template};
use crate::error::BrokerError;
use crate::resilience::retry::is_aws_code_retryable;

/// Build the standard tag set every handler attaches to launched instances:
/// `RequestId`, `Handler`, plus whatever the template itself carries.
pub fn build_tags(request_id: &str, handler: &str, template: &Template) -> Vec<aws_sdk_ec2::types::Tag> {
    let mut tags = vec![
        aws_sdk_ec2::types::Tag::builder()
            .key("RequestId")
            .value(request_id)
            .build(),
        aws_sdk_ec2::types::Tag::builder()
            .key("Handler")
            .value(handler)
            .build(),
    ];
    for (k, v) in &template.tags {
        tags.push(aws_sdk_ec2::types::Tag::builder().key(k).value(v).build());
    }
    tags
}

pub fn tag_specification(request_id: &str, handler: &str, template: &Template) -> aws_sdk_ec2::types::TagSpecification {
    aws_sdk_ec2::types::TagSpecification::builder()
        .resource_type(aws_sdk_ec2::types::ResourceType::Instance)
        .set_tags(Some(build_tags(request_id, handler, template)))
        .build()
}

/// Translate an EC2 instance-state name into our internal [`MachineStatus`].
pub fn normalize_instance_state(state_name: &str) -> MachineStatus {
    match state_name {
        "pending" => MachineStatus::Pending,
        "running" => MachineStatus::Running,
        "stopping" | "shutting-down" => MachineStatus::Stopping,
        "terminated" | "stopped" => MachineStatus::Terminated,
        _ => MachineStatus::Unknown,
    }
}

/// Build a [`Machine`] from a described EC2 instance.
pub fn machine_from_instance(
    request_id: &str,
    template_id: &str,
    instance: &aws_sdk_ec2::types::Instance,
) -> Machine {
    let instance_id = instance.instance_id().unwrap_or_default().to_string();
    let mut machine = Machine::new(
        format!("m-{}", uuid::Uuid::new_v4()),
        request_id.to_string(),
        template_id.to_string(),
    );
    let _ = machine.assign_provider_instance(instance_id);

    machine.instance_type = instance.instance_type().map(|t| t.as_str().to_string());
    machine.private_ip = instance.private_ip_address().map(|s| s.to_string());
    machine.public_ip = instance.public_ip_address().map(|s| s.to_string());
    machine.launch_time = instance
        .launch_time()
        .and_then(|lt| lt.to_millis().ok())
        .and_then(|ms| chrono::DateTime::from_timestamp(ms / 1000, 0));

    let mut provider_data = HashMap::new();
    if let Some(az) = instance.placement().and_then(|p| p.availability_zone()) {
        provider_data.insert("availability_zone".to_string(), az.to_string());
    }
    machine.provider_data = provider_data;

    let state_name = instance
        .state()
        .and_then(|s| s.name())
        .map(|n| n.as_str().to_string())
        .unwrap_or_default();
    let target = normalize_instance_state(&state_name);
    if target != MachineStatus::Pending {
        let _ = machine.transition_to(target);
    }

    machine
}

/// Classify an AWS SDK error into the broker's taxonomy (spec §7), based on
/// the error code AWS reports.
pub fn classify_sdk_error<E: std::fmt::Display>(provider: &str, err: E, code: Option<&str>) -> BrokerError {
    let message = err.to_string();
    match code {
        Some(c) if is_aws_code_retryable(c) => BrokerError::provider_transient(provider, message),
        _ => BrokerError::provider_permanent(provider, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_ec2_states() {
        assert_eq!(normalize_instance_state("running"), MachineStatus::Running);
        assert_eq!(normalize_instance_state("shutting-down"), MachineStatus::Stopping);
        assert_eq!(normalize_instance_state("bogus"), MachineStatus::Unknown);
    }

    #[test]
    fn classify_sdk_error_routes_known_retryable_codes_to_transient() {
        let err = classify_sdk_error("aws", "boom", Some("ThrottlingException"));
        assert!(matches!(err, BrokerError::ProviderTransient { .. }));

        let err = classify_sdk_error("aws", "boom", Some("UnauthorizedOperation"));
        assert!(matches!(err, BrokerError::ProviderPermanent { .. }));
    }
}
