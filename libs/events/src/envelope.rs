//! Header shared by every status event on the wire.

use chrono::{DateTime, Utc};
use mlplane_id::EventId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{EventError, EventPayload, ResourceKind};

/// Schema version written by this build and the only one it accepts.
pub const CURRENT_EVENT_VERSION: i32 = 1;

/// One status event: routing header plus a kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Carried into log spans for correlation.
    pub event_id: EventId,

    /// When the reporter observed the status.
    pub occurred_at: DateTime<Utc>,

    /// Selects the consuming loop.
    pub kind: ResourceKind,

    /// Must be the kind's status event type, e.g. `model.status_updated`.
    pub event_type: String,

    pub event_version: i32,

    pub payload: P,
}

/// An envelope whose payload has not been interpreted yet.
///
/// Routers decode this once to pick the consuming loop; the loop then
/// narrows it with [`RawEnvelope::into_typed`].
pub type RawEnvelope = EventEnvelope<serde_json::Value>;

impl<P: EventPayload> EventEnvelope<P> {
    /// Wrap a payload with a fresh id, the current time and its kind's event type.
    pub fn wrap(payload: P) -> Self {
        Self {
            event_id: EventId::new(),
            occurred_at: Utc::now(),
            kind: P::KIND,
            event_type: P::KIND.status_event_type().to_string(),
            event_version: CURRENT_EVENT_VERSION,
            payload,
        }
    }

    /// Keep a publisher-assigned id instead of a fresh one.
    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    /// Stamp the time the status was observed.
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

impl<P: Serialize> EventEnvelope<P> {
    /// Encode as a single JSON line (no trailing newline).
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl RawEnvelope {
    /// Decode and validate the envelope header.
    ///
    /// Rejects malformed JSON, unknown event types, event types that belong
    /// to a different kind than the header claims, and unsupported versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;

        let owner = ResourceKind::from_event_type(&raw.event_type)
            .ok_or_else(|| EventError::UnknownEventType(raw.event_type.clone()))?;
        if owner != raw.kind {
            return Err(EventError::KindMismatch {
                expected: owner,
                actual: raw.kind,
            });
        }
        if raw.event_version != CURRENT_EVENT_VERSION {
            return Err(EventError::UnsupportedVersion {
                event_type: raw.event_type,
                version: raw.event_version,
            });
        }

        Ok(raw)
    }

    /// Interpret the payload as `P`, checking that `P` is consumed by this kind.
    pub fn into_typed<P>(self) -> Result<EventEnvelope<P>, EventError>
    where
        P: EventPayload + DeserializeOwned,
    {
        if self.kind != P::KIND {
            return Err(EventError::KindMismatch {
                expected: P::KIND,
                actual: self.kind,
            });
        }

        let payload = serde_json::from_value(self.payload)
            .map_err(|e| EventError::InvalidPayload(e.to_string()))?;

        Ok(EventEnvelope {
            event_id: self.event_id,
            occurred_at: self.occurred_at,
            kind: self.kind,
            event_type: self.event_type,
            event_version: self.event_version,
            payload,
        })
    }
}

/// Decode an envelope and its payload in one step.
pub fn decode_envelope<P>(bytes: &[u8]) -> Result<EventEnvelope<P>, EventError>
where
    P: EventPayload + DeserializeOwned,
{
    RawEnvelope::decode(bytes)?.into_typed()
}
