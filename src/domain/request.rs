//! The `Request` aggregate and its state machine (spec §3, §4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::events::DomainEvent;
use crate::error::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Provision,
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub message: String,
    pub machine_errors: HashMap<String, String>,
}

/// A unit of work submitted to the broker: provision N machines of a
/// template, or return a specific set of machines (spec glossary).
///
/// Mutated only through the methods below, each of which appends exactly one
/// [`DomainEvent`] to the aggregate's pending event buffer — callers drain it
/// with [`Request::take_events`] after every mutation and hand it to the
/// publisher, preserving per-aggregate emission order (spec §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub template_id: String,
    pub request_type: RequestType,
    pub machine_count: u32,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tags: HashMap<String, String>,
    pub priority: i32,
    pub machine_ids: Vec<String>,
    pub error: Option<ErrorSummary>,

    #[serde(skip)]
    pending_events: Vec<DomainEvent>,
}

impl Request {
    pub fn new_provision(
        request_id: String,
        template_id: String,
        machine_count: u32,
        tags: HashMap<String, String>,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        let mut request = Self {
            request_id: request_id.clone(),
            template_id: template_id.clone(),
            request_type: RequestType::Provision,
            machine_count,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            tags,
            priority,
            machine_ids: Vec::new(),
            error: None,
            pending_events: Vec::new(),
        };
        request.pending_events.push(DomainEvent::RequestCreated {
            request_id,
            template_id,
            machine_count,
            at: now,
        });
        request
    }

    /// Return requests carry their full machine set at creation time (spec
    /// §3: "for RETURN, machine_ids.length == machine_count at creation").
    pub fn new_return(
        request_id: String,
        machine_ids: Vec<String>,
        tags: HashMap<String, String>,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        let machine_count = machine_ids.len() as u32;
        let mut request = Self {
            request_id: request_id.clone(),
            template_id: String::new(),
            request_type: RequestType::Return,
            machine_count,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            tags,
            priority,
            machine_ids,
            error: None,
            pending_events: Vec::new(),
        };
        request.pending_events.push(DomainEvent::RequestCreated {
            request_id,
            template_id: String::new(),
            machine_count,
            at: now,
        });
        request
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending_events)
    }

    fn guard_not_terminal(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BrokerError::Conflict(format!(
                "request {} is already terminal ({:?})",
                self.request_id, self.status
            )));
        }
        Ok(())
    }

    fn set_status(&mut self, next: RequestStatus) {
        let from = self.status;
        if from == next {
            return;
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        self.pending_events.push(DomainEvent::RequestStatusChanged {
            request_id: self.request_id.clone(),
            from,
            to: next,
            at: self.updated_at,
        });
    }

    /// PENDING -> IN_PROGRESS, guarded on a provider having been selected.
    pub fn start_provisioning(&mut self, machine_ids: Vec<String>) -> Result<()> {
        self.guard_not_terminal()?;
        if self.status != RequestStatus::Pending {
            return Err(BrokerError::Conflict(format!(
                "request {} must be PENDING to start provisioning, was {:?}",
                self.request_id, self.status
            )));
        }
        if machine_ids.len() as u32 > self.machine_count {
            return Err(BrokerError::Internal(
                "cannot start provisioning with more machines than requested".to_string(),
            ));
        }
        self.machine_ids = machine_ids;
        self.set_status(RequestStatus::InProgress);
        Ok(())
    }

    /// PENDING -> FAILED (validation failed / capacity denied) or
    /// IN_PROGRESS -> FAILED (timeout, or less-than-full provisioning).
    pub fn fail(&mut self, reason: impl Into<String>, machine_errors: HashMap<String, String>) -> Result<()> {
        self.guard_not_terminal()?;
        let reason = reason.into();
        self.error = Some(ErrorSummary {
            message: reason.clone(),
            machine_errors,
        });
        self.set_status(RequestStatus::Failed);
        self.pending_events.push(DomainEvent::RequestFailed {
            request_id: self.request_id.clone(),
            reason,
            at: self.updated_at,
        });
        Ok(())
    }

    /// PENDING -> CANCELLED (client cancel before provisioning started).
    pub fn cancel(&mut self) -> Result<()> {
        if self.status != RequestStatus::Pending {
            return Err(BrokerError::Conflict(format!(
                "request {} can only be cancelled while PENDING, was {:?}",
                self.request_id, self.status
            )));
        }
        self.set_status(RequestStatus::Cancelled);
        Ok(())
    }

    /// IN_PROGRESS -> COMPLETED, once every allocated machine has reached a
    /// terminal launch state and the full count is satisfied (spec §4.3).
    pub fn complete(&mut self) -> Result<()> {
        self.guard_not_terminal()?;
        if self.status != RequestStatus::InProgress {
            return Err(BrokerError::Conflict(format!(
                "request {} must be IN_PROGRESS to complete, was {:?}",
                self.request_id, self.status
            )));
        }
        if self.machine_ids.len() as u32 != self.machine_count {
            return Err(BrokerError::Internal(format!(
                "request {} cannot complete: {} of {} machines allocated",
                self.request_id,
                self.machine_ids.len(),
                self.machine_count
            )));
        }
        self.set_status(RequestStatus::Completed);
        Ok(())
    }

    /// True if this is a repeat of an already-resolved request — callers use
    /// this for the at-most-once guard (spec §4.3/§4.1).
    pub fn is_already_resolved(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_at_is_never_before_created_at() {
        let mut request = Request::new_provision(
            "req-1".into(),
            "t1".into(),
            2,
            HashMap::new(),
            0,
        );
        request.start_provisioning(vec!["m-1".into(), "m-2".into()]).unwrap();
        request.complete().unwrap();
        assert!(request.completed_at.unwrap() >= request.created_at);
    }

    #[test]
    fn complete_requires_full_machine_count() {
        let mut request = Request::new_provision("req-1".into(), "t1".into(), 2, HashMap::new(), 0);
        request.start_provisioning(vec!["m-1".into()]).unwrap();
        assert!(request.complete().is_err());
    }

    #[test]
    fn terminal_requests_reject_further_transitions() {
        let mut request = Request::new_provision("req-1".into(), "t1".into(), 1, HashMap::new(), 0);
        request.fail("capacity denied", HashMap::new()).unwrap();
        assert!(request.start_provisioning(vec![]).is_err());
        assert!(request.cancel().is_err());
    }

    #[test]
    fn cancel_only_allowed_while_pending() {
        let mut request = Request::new_provision("req-1".into(), "t1".into(), 1, HashMap::new(), 0);
        request.start_provisioning(vec!["m-1".into()]).unwrap();
        assert!(request.cancel().is_err());
    }

    #[test]
    fn events_recorded_in_transition_order() {
        let mut request = Request::new_provision("req-1".into(), "t1".into(), 1, HashMap::new(), 0);
        request.start_provisioning(vec!["m-1".into()]).unwrap();
        request.complete().unwrap();

        let events = request.take_events();
        assert_eq!(events.len(), 3); // created, pending->in_progress, in_progress->completed
        assert!(matches!(events[0], DomainEvent::RequestCreated { .. }));
        assert!(matches!(events[1], DomainEvent::RequestStatusChanged { .. }));
        assert!(matches!(events[2], DomainEvent::RequestStatusChanged { .. }));
    }

    #[test]
    fn repeat_command_against_terminal_request_is_detected() {
        let mut request = Request::new_provision("req-1".into(), "t1".into(), 1, HashMap::new(), 0);
        request.start_provisioning(vec!["m-1".into()]).unwrap();
        request.complete().unwrap();
        assert!(request.is_already_resolved());
    }

    #[test]
    fn return_request_carries_full_machine_set_at_creation() {
        let request = Request::new_return(
            "ret-1".into(),
            vec!["m-1".into(), "m-2".into()],
            HashMap::new(),
            0,
        );
        assert_eq!(request.machine_ids.len(), request.machine_count as usize);
    }
}
