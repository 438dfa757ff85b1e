use serde::{Deserialize, Serialize};

use crate::event_sourcing::core::Event;
use super::errors::ValidationError;

// ============================================================================
// Meter Events - Domain Events for a Meter Stream
// ============================================================================

pub const READING_RECORDED: &str = "reading-recorded";
pub const TOKEN_PURCHASED: &str = "token-purchased";
pub const TOP_UP: &str = "top-up";

/// Meter Event - union of every event type this build understands.
///
/// Types written by newer clients are not represented here; see
/// [`MeterEvent::from_stored`].
#[derive(Debug, Clone, PartialEq)]
pub enum MeterEvent {
    ReadingRecorded(ReadingRecorded),
    TokenPurchased(TokenPurchased),
    TopUp(TopUp),
}

/// Reading Recorded - the customer read the meter display
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReadingRecorded {
    pub value: f64,
    pub unit: String,
}

/// Token Purchased - a prepaid electricity token was bought
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TokenPurchased {
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Top Up - credit added to the account without a token
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TopUp {
    pub amount: f64,
}

impl MeterEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            MeterEvent::ReadingRecorded(_) => READING_RECORDED,
            MeterEvent::TokenPurchased(_) => TOKEN_PURCHASED,
            MeterEvent::TopUp(_) => TOP_UP,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            MeterEvent::ReadingRecorded(e) => serde_json::to_value(e),
            MeterEvent::TokenPurchased(e) => serde_json::to_value(e),
            MeterEvent::TopUp(e) => serde_json::to_value(e),
        };
        // Plain structs with string keys; serialization cannot fail.
        value.unwrap_or_default()
    }

    /// Decode and validate a payload for a known event type.
    pub fn parse(event_type: &str, payload: &serde_json::Value) -> Result<Self, ValidationError> {
        let event = match event_type {
            READING_RECORDED => MeterEvent::ReadingRecorded(decode(event_type, payload)?),
            TOKEN_PURCHASED => MeterEvent::TokenPurchased(decode(event_type, payload)?),
            TOP_UP => MeterEvent::TopUp(decode(event_type, payload)?),
            other => return Err(ValidationError::UnsupportedEventType(other.to_string())),
        };

        event.validate()?;
        Ok(event)
    }

    /// Interpret a stored event. `None` means the type is unknown to this build.
    pub fn from_stored(event: &Event) -> Option<Result<Self, ValidationError>> {
        match event.event_type.as_str() {
            READING_RECORDED | TOKEN_PURCHASED | TOP_UP => {
                Some(Self::parse(&event.event_type, &event.payload))
            }
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            MeterEvent::ReadingRecorded(e) => {
                if !e.value.is_finite() || e.value < 0.0 {
                    return Err(ValidationError::InvalidReading(e.value));
                }
                if e.unit.trim().is_empty() {
                    return Err(ValidationError::EmptyUnit);
                }
            }
            MeterEvent::TokenPurchased(TokenPurchased { amount, .. })
            | MeterEvent::TopUp(TopUp { amount }) => {
                if !amount.is_finite() || *amount <= 0.0 {
                    return Err(ValidationError::InvalidAmount(*amount));
                }
            }
        }
        Ok(())
    }
}

fn decode<T: for<'de> Deserialize<'de>>(
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<T, ValidationError> {
    T::deserialize(payload).map_err(|e| ValidationError::MalformedPayload {
        event_type: event_type.to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// Unit Tests
// ============================================================================
