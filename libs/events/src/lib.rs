//! # mlplane-events
//!
//! Status-update events exchanged between serving replicas, the scheduler and
//! the status controller.
//!
//! ## Rules
//!
//! - Events are immutable observations; they never carry desired state
//! - Every event names exactly one resource of exactly one kind
//! - Aggregated kinds (models, pipelines) carry the reporter that observed the
//!   status and the iteration the observation belongs to
//! - Every event carries the generation of the desired state it was produced for
//! - Only `event_version` 1 is accepted
//!
//! ## Envelope
//!
//! Every event travels in an [`EventEnvelope`] carrying:
//! - A correlation id (`event_id`) and occurrence time
//! - The resource kind, which selects the consuming loop
//! - The event type and schema version
//!
//! ## Event type names
//!
//! - `model.status_updated`
//! - `pipeline.status_updated`
//! - `experiment.status_updated`
//! - `server.status_updated`

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
