use thiserror::Error;

use crate::ResourceKind;

/// Why an event could not be decoded or encoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event type '{0}' is not recognised")]
    UnknownEventType(String),

    #[error("{event_type} v{version} is not supported")]
    UnsupportedVersion { event_type: String, version: i32 },

    /// A consumer for one kind was handed another kind's event.
    #[error("expected a {expected} event, got {actual}")]
    KindMismatch {
        expected: ResourceKind,
        actual: ResourceKind,
    },

    #[error("payload rejected: {0}")]
    InvalidPayload(String),

    /// The bytes are not a JSON envelope.
    #[error("malformed envelope: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
