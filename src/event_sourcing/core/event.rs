use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

// ============================================================================
// Stored Event - Immutable Record in the Event Log
// ============================================================================
//
// The event log is domain-agnostic: it stores an event type string and an
// opaque JSON payload. Domain code (src/domain/) decides how to interpret
// them, so events written by newer clients survive older readers.
//
// ============================================================================

/// An event as it exists in the log, with its store-assigned sequence.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    /// Unique event id. Doubles as the idempotency key of the append.
    pub id: Uuid,
    pub stream_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Monotonic per stream, starting at 1.
    pub sequence: i64,
    pub occurred_at: DateTime<Utc>,
}

/// An event that has not been appended yet. The store assigns `sequence`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NewEvent {
    pub id: Uuid,
    pub stream_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream_id: stream_id.into(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Attach the sequence the store assigned.
    pub fn into_event(self, sequence: i64) -> Event {
        Event {
            id: self.id,
            stream_id: self.stream_id,
            event_type: self.event_type,
            payload: self.payload,
            sequence,
            occurred_at: self.occurred_at,
        }
    }

    /// Whether `stored` is a retry of this append.
    ///
    /// `occurred_at` is excluded: a retried call stamps a fresh timestamp.
    /// Payloads are compared by value, so `50` and `50.0` are the same amount.
    pub fn same_content(&self, stored: &Event) -> bool {
        self.id == stored.id
            && self.stream_id == stored.stream_id
            && self.event_type == stored.event_type
            && payload_eq(&self.payload, &stored.payload)
    }
}

fn payload_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    use serde_json::Value;

    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_f64() || y.is_f64() => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| payload_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(key, a)| y.get(key).is_some_and(|b| payload_eq(a, b)))
        }
        _ => a == b,
    }
}

// ============================================================================
// Event Serialization Helpers
// ============================================================================

pub fn serialize_payload(payload: &serde_json::Value) -> serde_json::Result<String> {
    serde_json::to_string(payload)
}

pub fn deserialize_payload(json: &str) -> serde_json::Result<serde_json::Value> {
    serde_json::from_str(json)
}

// ============================================================================
// Tests
// ============================================================================
