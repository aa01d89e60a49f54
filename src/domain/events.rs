//! Domain events and the in-process publisher.
//!
//! Events are emitted by aggregates in transition order and delivered to
//! subscribers in that order (spec §5). Persistence of the event log is
//! optional (spec §1 non-goals) — the publisher here is purely in-process,
//! backed by a broadcast channel the way `tokio::sync::broadcast` is
//! typically used for fan-out notification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::machine::MachineStatus;
use crate::domain::request::RequestStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    RequestCreated {
        request_id: String,
        template_id: String,
        machine_count: u32,
        at: DateTime<Utc>,
    },
    RequestStatusChanged {
        request_id: String,
        from: RequestStatus,
        to: RequestStatus,
        at: DateTime<Utc>,
    },
    RequestFailed {
        request_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    MachineCreated {
        machine_id: String,
        request_id: String,
        at: DateTime<Utc>,
    },
    MachineStatusChanged {
        machine_id: String,
        from: MachineStatus,
        to: MachineStatus,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// The aggregate id this event belongs to (used to prove per-aggregate
    /// ordering in tests — events for one id are never reordered).
    pub fn aggregate_id(&self) -> &str {
        match self {
            DomainEvent::RequestCreated { request_id, .. } => request_id,
            DomainEvent::RequestStatusChanged { request_id, .. } => request_id,
            DomainEvent::RequestFailed { request_id, .. } => request_id,
            DomainEvent::MachineCreated { machine_id, .. } => machine_id,
            DomainEvent::MachineStatusChanged { machine_id, .. } => machine_id,
        }
    }
}

/// Fan-out publisher for domain events.
///
/// Cloning an `EventPublisher` shares the same underlying channel — cheap,
/// like cloning a `tokio::sync::broadcast::Sender`.
#[derive(Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns without error even if there are currently no
    /// subscribers — event delivery is best-effort, matching spec §1's
    /// "domain events are emitted and consumed in-process" wording.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_for_one_aggregate_arrive_in_order() {
        let publisher = EventPublisher::default();
        let mut rx = publisher.subscribe();

        let now = Utc::now();
        publisher.publish(DomainEvent::RequestCreated {
            request_id: "req-1".into(),
            template_id: "t1".into(),
            machine_count: 2,
            at: now,
        });
        publisher.publish(DomainEvent::RequestStatusChanged {
            request_id: "req-1".into(),
            from: RequestStatus::Pending,
            to: RequestStatus::InProgress,
            at: now,
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, DomainEvent::RequestCreated { .. }));
        assert!(matches!(second, DomainEvent::RequestStatusChanged { .. }));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let publisher = EventPublisher::default();
        publisher.publish(DomainEvent::RequestFailed {
            request_id: "req-1".into(),
            reason: "boom".into(),
            at: Utc::now(),
        });
    }
}
