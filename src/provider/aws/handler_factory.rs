//! Handler selection from template attributes (spec §4.5).

use async_trait::async_trait;
use std::collections::HashMap;

use crate::domain::{Machine, MachineStatus, PriceType, Template};
use crate::error::Result;

/// The internal contract every provisioning mechanism implements.
#[async_trait]
pub trait ProvisioningHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn provision_instances(&self, request_id: &str, template: &Template, count: u32) -> Result<Vec<Machine>>;

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<bool>;

    async fn get_instance_status(&self, instance_ids: &[String]) -> Result<HashMap<String, MachineStatus>>;

    async fn validate_template(&self, template: &Template) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    SpotFleet,
    AutoScalingGroup,
    Ec2Fleet,
    RunInstances,
}

/// Pick the provisioning mechanism for a template, per spec §4.5's table.
///
/// `use_fleet` defaults to `true` (see DESIGN.md's open-question decision),
/// so EC2Fleet is the fallback mechanism rather than RunInstances.
pub fn select_handler(template: &Template) -> HandlerKind {
    if template.use_spot_instances || template.price_type == PriceType::Spot {
        return HandlerKind::SpotFleet;
    }
    if template.use_auto_scaling {
        return HandlerKind::AutoScalingGroup;
    }
    if template.use_fleet || template.price_type == PriceType::Heterogeneous {
        return HandlerKind::Ec2Fleet;
    }
    HandlerKind::RunInstances
}
