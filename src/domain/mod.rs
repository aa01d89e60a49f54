//! Core aggregates and value objects (spec §3).
//!
//! Each submodule owns one aggregate's invariants; mutation happens only
//! through the methods they expose, never by reaching into the fields from
//! outside the crate.

pub mod events;
pub mod machine;
pub mod request;
pub mod template;

pub use events::{DomainEvent, EventPublisher};
pub use machine::{Machine, MachineStatus};
pub use request::{ErrorSummary, Request, RequestStatus, RequestType};
pub use template::{PriceType, RootVolumeSpec, SpotFleetParams, Template, TemplateBuilder};
