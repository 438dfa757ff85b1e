use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::event_sourcing::core::Event;
use super::events::MeterEvent;

// ============================================================================
// Meter Read Model - Current State Derived from the Event Log
// ============================================================================
//
// One row per stream (meter/account id). The row is never the source of
// truth: it can always be rebuilt by folding the stream's events from
// sequence 0.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadModelRow {
    pub stream_id: String,
    pub latest_reading: Option<f64>,
    pub balance: f64,
    /// Timestamp of the last applied event, so replays reproduce it exactly.
    pub updated_at: Option<DateTime<Utc>>,
    /// 0 means no event has been applied.
    pub last_applied_sequence: i64,
}

impl ReadModelRow {
    pub fn empty(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            latest_reading: None,
            balance: 0.0,
            updated_at: None,
            last_applied_sequence: 0,
        }
    }

    /// Fold one event into the row.
    ///
    /// Only the event at `last_applied_sequence + 1` on this stream is
    /// applied. Anything else (already applied, past a gap, another stream)
    /// leaves the row untouched; a gap needs a rebuild from the log.
    /// Unknown and undecodable event types only advance the cursor.
    pub fn apply_event(&self, event: &Event) -> Self {
        if event.stream_id != self.stream_id || event.sequence <= self.last_applied_sequence {
            return self.clone();
        }

        if event.sequence != self.last_applied_sequence + 1 {
            tracing::warn!(
                stream_id = %event.stream_id,
                last_applied_sequence = self.last_applied_sequence,
                sequence = event.sequence,
                "Refusing to apply event past a gap"
            );
            return self.clone();
        }

        let mut next = self.clone();
        next.last_applied_sequence = event.sequence;
        next.updated_at = Some(event.occurred_at);

        match MeterEvent::from_stored(event) {
            Some(Ok(MeterEvent::ReadingRecorded(e))) => {
                next.latest_reading = Some(e.value);
            }
            Some(Ok(MeterEvent::TokenPurchased(e))) => {
                next.balance += e.amount;
            }
            Some(Ok(MeterEvent::TopUp(e))) => {
                next.balance += e.amount;
            }
            Some(Err(error)) => {
                tracing::warn!(
                    stream_id = %event.stream_id,
                    sequence = event.sequence,
                    event_type = %event.event_type,
                    error = %error,
                    "Skipping undecodable event during projection"
                );
            }
            None => {
                tracing::debug!(
                    stream_id = %event.stream_id,
                    sequence = event.sequence,
                    event_type = %event.event_type,
                    "Ignoring unknown event type"
                );
            }
        }

        next
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
