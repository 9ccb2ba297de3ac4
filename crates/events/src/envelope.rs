use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use orderflow_core::AggregateId;

use crate::{Event, EventRegistry};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("invalid sequence: {0}")]
    InvalidSequence(u64),

    #[error("payload could not be serialized: {0}")]
    Serialize(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("payload does not match event type {event_type}: {reason}")]
    Payload { event_type: String, reason: String },
}

/// Envelope for one event on the broker.
///
/// This is the unit the command side publishes and the query side consumes.
///
/// Notes:
/// - `aggregate_id` is the ordering key: every envelope of one aggregate lands
///   in the same ordering domain.
/// - `sequence` is the ordering signal used by the idempotence guard. It is
///   assigned when the envelope is sealed and only changes when the log fences
///   it, so a republished envelope is a recognisable duplicate.
/// - `event_id` is diagnostic only; it takes no part in duplicate detection.
/// - `occurred_at` is the domain time of the event; `produced_at` is when the
///   envelope was sealed. Neither is used for ordering.
/// - `payload` is the domain event, self-describing JSON on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    event_type: String,
    schema_version: u32,

    aggregate_id: AggregateId,

    /// Strictly increasing per producer; compared against `last_applied_sequence`.
    sequence: u64,

    occurred_at: DateTime<Utc>,
    produced_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl EventEnvelope<JsonValue> {
    /// Build the envelope for a validated event.
    ///
    /// Fails if the event type is not registered or the payload cannot be
    /// represented as JSON. The aggregate id is non-blank by construction.
    pub fn seal<E>(
        registry: &EventRegistry,
        aggregate_id: AggregateId,
        sequence: u64,
        event: &E,
    ) -> Result<Self, EnvelopeError>
    where
        E: Event + Serialize,
    {
        let event_type = event.event_type();
        if !registry.contains(event_type) {
            return Err(EnvelopeError::UnknownEventType(event_type.to_string()));
        }
        if sequence == 0 {
            return Err(EnvelopeError::InvalidSequence(sequence));
        }

        let payload =
            serde_json::to_value(event).map_err(|e| EnvelopeError::Serialize(e.to_string()))?;

        Ok(Self {
            event_id: Uuid::now_v7(),
            event_type: event_type.to_string(),
            schema_version: event.version(),
            aggregate_id,
            sequence,
            occurred_at: event.occurred_at(),
            produced_at: Utc::now(),
            payload,
        })
    }

    /// The same envelope under a new ordering signal.
    ///
    /// Used when the log fenced the original sequence; identity and payload
    /// are kept.
    pub fn resequence(self, sequence: u64) -> Result<Self, EnvelopeError> {
        if sequence == 0 {
            return Err(EnvelopeError::InvalidSequence(sequence));
        }
        Ok(Self { sequence, ..self })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialize(e.to_string()))
    }

    /// Decode and validate an envelope received from the broker.
    ///
    /// Any error here means the record is a poison message.
    pub fn from_bytes(bytes: &[u8], registry: &EventRegistry) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        if !registry.contains(&envelope.event_type) {
            return Err(EnvelopeError::UnknownEventType(envelope.event_type));
        }
        if envelope.sequence == 0 {
            return Err(EnvelopeError::InvalidSequence(envelope.sequence));
        }

        Ok(envelope)
    }

    /// Decode the payload into the typed event it claims to be.
    pub fn decode_payload<E>(&self) -> Result<EventEnvelope<E>, EnvelopeError>
    where
        E: Event + DeserializeOwned,
    {
        let payload: E =
            serde_json::from_value(self.payload.clone()).map_err(|e| EnvelopeError::Payload {
                event_type: self.event_type.clone(),
                reason: e.to_string(),
            })?;

        if payload.event_type() != self.event_type {
            return Err(EnvelopeError::Payload {
                event_type: self.event_type.clone(),
                reason: format!("payload is a {}", payload.event_type()),
            });
        }

        Ok(EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            schema_version: self.schema_version,
            aggregate_id: self.aggregate_id.clone(),
            sequence: self.sequence,
            occurred_at: self.occurred_at,
            produced_at: self.produced_at,
            payload,
        })
    }
}
