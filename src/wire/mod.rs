//! Scheduler wire format and entry adapter (spec §6).
//!
//! This is the one layer of the engine that is explicitly in scope *as a
//! data model* despite the transport around it (HTTP/REST, MCP, CLI output
//! formatting) being out of scope (spec §1). The shapes below are exactly
//! the external (camelCase) JSON the scheduler sends and expects back; the
//! `EntryAdapter` is the translation boundary that rewrites those field
//! names to/from the internal (snake_case) ones via
//! `crate::template::remap` before handing work to [`crate::handlers::core::BrokerCore`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{Machine, MachineStatus, Request, RequestStatus, RequestType};
use crate::error::Result;
use crate::handlers::core::BrokerCore;

/// `requestMachines` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestMachinesPayload {
    #[serde(rename = "templateId")]
    pub template_id: String,
    #[serde(rename = "maxNumber", alias = "machine_count")]
    pub max_number: u32,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestMachinesResponse {
    #[serde(rename = "requestId")]
    pub request_id: String,
}

/// `getRequestStatus` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct GetRequestStatusPayload {
    #[serde(rename = "requestId")]
    pub request_id: String,
}

/// One machine entry inside a `getRequestStatus` response (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct MachineStatusEntry {
    #[serde(rename = "machineId")]
    pub machine_id: String,
    #[serde(rename = "privateIp")]
    pub private_ip: Option<String>,
    #[serde(rename = "publicIp")]
    pub public_ip: Option<String>,
    pub status: String,
    #[serde(rename = "launchTime")]
    pub launch_time: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetRequestStatusResponse {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub status: String,
    #[serde(rename = "machineCount")]
    pub machine_count: u32,
    pub machines: Vec<MachineStatusEntry>,
    pub message: Option<String>,
}

/// `returnMachines` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ReturnMachinesPayload {
    #[serde(rename = "machineIds")]
    pub machine_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReturnMachinesResponse {
    #[serde(rename = "requestId")]
    pub request_id: String,
}

/// The scheduler's double-array attribute form: `{"type": ["String", value]}`
/// (spec §6, required for scheduler compatibility). Represented as a tagged
/// tuple so serde emits exactly `["String", "X86_64"]` / `["Numeric", 4]`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TemplateAttributeValue {
    Text(String, String),
    Numeric(String, i64),
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailableTemplate {
    #[serde(rename = "templateId")]
    pub template_id: String,
    #[serde(rename = "maxNumber")]
    pub max_number: u32,
    pub attributes: HashMap<String, TemplateAttributeValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetAvailableTemplatesResponse {
    pub templates: Vec<AvailableTemplate>,
}

/// Render an internal [`RequestStatus`] + machine set into one of the
/// scheduler's status strings (spec §6: `running|pending|complete|
/// complete_with_error|failed`).
///
/// Per the Open Question in spec.md §9 (see DESIGN.md decision 1):
/// `complete_with_error` is a wire-only rendering of a `FAILED`
/// `PROVISION` request that has at least one successfully-provisioned
/// machine. A `FAILED` request with zero successes renders as `failed`.
/// The internal state machine is unaffected; this function is purely a view.
pub fn status_for(request: &Request, machines: &[Machine]) -> &'static str {
    match request.status {
        RequestStatus::Pending => "pending",
        RequestStatus::InProgress => "running",
        RequestStatus::Cancelled => "failed",
        RequestStatus::Completed => "complete",
        RequestStatus::Failed => {
            if request.request_type == RequestType::Provision
                && machines.iter().any(|m| m.status == MachineStatus::Running)
            {
                "complete_with_error"
            } else {
                "failed"
            }
        }
    }
}

fn machine_status_to_wire(status: MachineStatus) -> &'static str {
    match status {
        MachineStatus::Pending => "pending",
        MachineStatus::Running => "running",
        MachineStatus::Stopping => "stopping",
        MachineStatus::Terminated => "terminated",
        MachineStatus::Failed => "failed",
        MachineStatus::Unknown => "unknown",
    }
}

/// Translates external scheduler operations into [`BrokerCore`] calls and
/// internal results back into the wire shapes above (spec §2's "entry
/// adapter" layer, §6's data model).
pub struct EntryAdapter {
    core: std::sync::Arc<BrokerCore>,
}

impl EntryAdapter {
    pub fn new(core: std::sync::Arc<BrokerCore>) -> Self {
        Self { core }
    }

    pub async fn request_machines(&self, payload: RequestMachinesPayload) -> Result<RequestMachinesResponse> {
        let request = self
            .core
            .create_provision_request(&payload.template_id, payload.max_number, payload.tags, payload.priority)
            .await?;
        Ok(RequestMachinesResponse {
            request_id: request.request_id,
        })
    }

    pub async fn get_request_status(&self, payload: GetRequestStatusPayload) -> Result<GetRequestStatusResponse> {
        let request = self.core.update_request_status(&payload.request_id).await?;
        let machines = self.core.list_machines_by_request(&request.request_id).await?;

        let status = status_for(&request, &machines).to_string();
        let message = request.error.as_ref().map(|e| e.message.clone());

        Ok(GetRequestStatusResponse {
            request_id: request.request_id.clone(),
            status,
            machine_count: request.machine_count,
            machines: machines
                .iter()
                .map(|m| MachineStatusEntry {
                    machine_id: m.machine_id.clone(),
                    private_ip: m.private_ip.clone(),
                    public_ip: m.public_ip.clone(),
                    status: machine_status_to_wire(m.status).to_string(),
                    launch_time: m.launch_time.map(|t| t.to_rfc3339()),
                })
                .collect(),
            message,
        })
    }

    pub async fn return_machines(&self, payload: ReturnMachinesPayload) -> Result<ReturnMachinesResponse> {
        let request = self
            .core
            .create_return_request(payload.machine_ids, HashMap::new(), 0)
            .await?;
        Ok(ReturnMachinesResponse {
            request_id: request.request_id,
        })
    }

    pub async fn get_available_templates(&self) -> Result<GetAvailableTemplatesResponse> {
        let templates = self.core.list_templates().await?;
        let templates = templates
            .into_iter()
            .map(|t| {
                let mut attributes = HashMap::new();
                attributes.insert(
                    "type".to_string(),
                    TemplateAttributeValue::Text("String".to_string(), "X86_64".to_string()),
                );
                if let Some(ncpus) = estimate_ncpus(t.instance_type.as_deref()) {
                    attributes.insert("ncpus".to_string(), TemplateAttributeValue::Numeric("Numeric".to_string(), ncpus));
                }
                AvailableTemplate {
                    template_id: t.template_id,
                    max_number: t.max_number,
                    attributes,
                }
            })
            .collect();
        Ok(GetAvailableTemplatesResponse { templates })
    }
}

/// Rough instance-type -> vCPU lookup for the `ncpus` attribute. Scheduler
/// compatibility only needs a plausible value, not a byte-for-byte AWS
/// instance catalog; unknown types fall back to `None` rather than a guess.
fn estimate_ncpus(instance_type: Option<&str>) -> Option<i64> {
    match instance_type? {
        "t3.medium" | "t2.medium" => Some(2),
        "t3.large" | "t2.large" => Some(2),
        "t3.xlarge" => Some(4),
        "m5.large" => Some(2),
        "m5.xlarge" => Some(4),
        "m5.2xlarge" => Some(8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RequestType;

    #[test]
    fn pending_request_renders_as_pending() {
        let request = Request::new_provision("req-1".into(), "t1".into(), 1, HashMap::new(), 0);
        assert_eq!(status_for(&request, &[]), "pending");
    }

    #[test]
    fn failed_provision_with_zero_successes_renders_as_failed() {
        let mut request = Request::new_provision("req-1".into(), "t1".into(), 1, HashMap::new(), 0);
        request.fail("capacity denied", HashMap::new()).unwrap();
        assert_eq!(status_for(&request, &[]), "failed");
    }

    #[test]
    fn failed_provision_with_one_success_renders_as_complete_with_error() {
        let mut request = Request::new_provision("req-1".into(), "t1".into(), 2, HashMap::new(), 0);
        request.start_provisioning(vec!["m-1".into(), "m-2".into()]).unwrap();
        request.fail("one machine failed", HashMap::new()).unwrap();

        let mut running = Machine::new("m-1".into(), "req-1".into(), "t1".into());
        running.assign_provider_instance("i-1".into()).unwrap();
        running.transition_to(MachineStatus::Running).unwrap();
        let failed = Machine::new("m-2".into(), "req-1".into(), "t1".into());

        assert_eq!(status_for(&request, &[running, failed]), "complete_with_error");
    }

    #[test]
    fn failed_return_request_still_renders_as_failed_not_complete_with_error() {
        let mut request = Request::new_return("ret-1".into(), vec!["m-1".into()], HashMap::new(), 0);
        assert_eq!(request.request_type, RequestType::Return);
        request.start_provisioning(vec!["m-1".into()]).unwrap();
        request.fail("termination failed", HashMap::new()).unwrap();
        assert_eq!(status_for(&request, &[]), "failed");
    }

    #[test]
    fn request_machines_payload_accepts_machine_count_alias() {
        let json = r#"{"templateId": "t1", "machine_count": 3}"#;
        let payload: RequestMachinesPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.max_number, 3);
    }
}
