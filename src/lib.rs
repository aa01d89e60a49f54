//! `hf-broker`: a cloud-agnostic resource broker mediating between Spectrum
//! Symphony Host Factory (and compatible schedulers) and cloud providers.
//!
//! ## Layout
//!
//! The crate is a layered pipeline, outer to inner (spec §2):
//!
//! 1. [`wire`] — the scheduler's external JSON shapes and the entry adapter
//!    that translates them into commands/queries and back.
//! 2. [`bus`] — the typed command/query dispatcher and its DI-style handler
//!    registry.
//! 3. [`handlers`] — [`handlers::core::BrokerCore`], the application layer:
//!    validates input, loads aggregates, invokes the provider context,
//!    persists changes, publishes events.
//! 4. [`provider`] — the provider context, selection policies, and the AWS
//!    strategy with its handler factory.
//! 5. [`repository`] — typed persistence ports with in-memory, file-backed,
//!    and DynamoDB-style implementations.
//! 6. [`template`] — the template configuration manager: discovery, field
//!    remapping, TTL caching, validation.
//!
//! [`domain`] holds the Template/Request/Machine aggregates and domain
//! events that flow through all of the above; [`error`] is the shared error
//! taxonomy; [`resilience`] is the retry/circuit-breaker/timeout stack every
//! outbound provider call goes through; [`config`] is ambient configuration.

pub mod bus;
pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod provider;
pub mod repository;
pub mod resilience;
pub mod template;
pub mod wire;
