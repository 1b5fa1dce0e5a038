use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{EventAction, EventType};

/// A stored change notification. Append-only; never mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Store-assigned sequence number, breaks ties between equal timestamps.
    pub id: i64,
    pub organization_id: String,
    /// Assigned by the store inside the publish transaction. Strictly
    /// increasing per organization.
    pub processed_timestamp: DateTime<Utc>,
    /// Supplied by the publisher.
    pub originated_timestamp: DateTime<Utc>,
    pub event_type: String,
    pub action: String,
    pub entity_id: String,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Event {
    /// Typed view of `event_type`, `None` for kinds this build doesn't know.
    pub fn kind(&self) -> Option<EventType> {
        self.event_type.parse().ok()
    }

    /// Typed view of `action`.
    pub fn action_kind(&self) -> Option<EventAction> {
        self.action.parse().ok()
    }

    /// Decode the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Caller side of a publish: everything except the store-assigned fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub originated_timestamp: DateTime<Utc>,
    pub event_type: String,
    pub action: String,
    pub entity_id: String,
    pub correlation_id: Option<String>,
    pub payload: Vec<u8>,
}

impl NewEvent {
    /// Start an event originating now with an empty payload.
    pub fn new(
        event_type: impl Into<String>,
        action: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            originated_timestamp: Utc::now(),
            event_type: event_type.into(),
            action: action.into(),
            entity_id: entity_id.into(),
            correlation_id: None,
            payload: Vec::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Serialize `value` as the JSON payload.
    pub fn with_json_payload<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_vec(value)?;
        Ok(self)
    }

    pub fn with_originated_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.originated_timestamp = at;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
