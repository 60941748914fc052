//! # mlplane-id
//!
//! Names and IDs used across the mlplane control plane.
//!
//! ## Names vs IDs
//!
//! - **Names** are owner-chosen labels: the name of a model, pipeline, experiment or
//!   server, and the identifier of the replica (reporter) that emits status for it.
//!   They are validated strings and are the keys the status aggregator works with.
//! - **IDs** are system-generated, prefixed ULIDs (`evt_01HV4Z2WQXKJNM8GPQY6VBKC3D`).
//!   They are only used to correlate log lines and events.
//!
//! Both kinds roundtrip through `Display`/`FromStr` and serde, and both refuse to
//! deserialize invalid input.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Underlying ULID type of [`EventId`].
pub use ulid::Ulid;
