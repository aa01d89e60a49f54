//! The `Machine` aggregate (spec §3, §4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    Pending,
    Running,
    Stopping,
    Terminated,
    Failed,
    Unknown,
}

impl MachineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MachineStatus::Terminated | MachineStatus::Failed)
    }
}

/// A single provisioned unit tracked by the broker; maps 1:1 to a cloud
/// instance (spec glossary).
///
/// Once `TERMINATED` or `FAILED`, the machine is immutable: `transition_to`
/// refuses any further change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: String,
    pub provider_instance_id: Option<String>,
    pub request_id: String,
    pub template_id: String,
    pub status: MachineStatus,
    pub instance_type: Option<String>,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
    pub provider_data: HashMap<String, String>,
    pub tags: HashMap<String, String>,
}

impl Machine {
    /// Create a new machine in `PENDING`, before the provider has allocated a
    /// concrete instance (spec §4.3: "(init) -> handler allocates -> PENDING").
    pub fn new(machine_id: String, request_id: String, template_id: String) -> Self {
        Self {
            machine_id,
            provider_instance_id: None,
            request_id,
            template_id,
            status: MachineStatus::Pending,
            instance_type: None,
            private_ip: None,
            public_ip: None,
            launch_time: None,
            provider_data: HashMap::new(),
            tags: HashMap::new(),
        }
    }

    /// Attach the provider-assigned instance id. Must happen before the
    /// machine leaves `PENDING` (spec §3 invariant).
    pub fn assign_provider_instance(&mut self, provider_instance_id: String) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BrokerError::Conflict(format!(
                "machine {} is terminal, cannot assign instance id",
                self.machine_id
            )));
        }
        self.provider_instance_id = Some(provider_instance_id);
        Ok(())
    }

    /// Apply a provider-reported status transition, validating it against the
    /// allowed edges in spec §4.3's machine transition table.
    pub fn transition_to(&mut self, next: MachineStatus) -> Result<bool> {
        if self.status.is_terminal() {
            return Err(BrokerError::Conflict(format!(
                "machine {} is already terminal ({:?})",
                self.machine_id, self.status
            )));
        }

        if next != MachineStatus::Unknown
            && next != MachineStatus::Failed
            && !matches!(self.status, MachineStatus::Unknown)
            && !Self::allowed_edge(self.status, next)
        {
            return Err(BrokerError::Conflict(format!(
                "illegal machine transition {:?} -> {:?}",
                self.status, next
            )));
        }

        if next != MachineStatus::Pending && self.provider_instance_id.is_none() {
            return Err(BrokerError::Internal(
                "machine left PENDING without a provider_instance_id".to_string(),
            ));
        }

        let changed = self.status != next;
        self.status = next;
        Ok(changed)
    }

    fn allowed_edge(from: MachineStatus, to: MachineStatus) -> bool {
        use MachineStatus::*;
        matches!(
            (from, to),
            (Pending, Pending)
                | (Pending, Running)
                | (Running, Running)
                | (Running, Stopping)
                | (Stopping, Terminated)
                | (Stopping, Stopping)
        )
    }

    pub fn request_return(&mut self) -> Result<()> {
        match self.status {
            MachineStatus::Running => {
                self.status = MachineStatus::Stopping;
                Ok(())
            }
            MachineStatus::Stopping => Ok(()),
            other => Err(BrokerError::Conflict(format!(
                "cannot return machine in state {other:?}"
            ))),
        }
    }
}
