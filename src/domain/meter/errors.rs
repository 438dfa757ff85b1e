// ============================================================================
// Meter Payload Validation Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Stream id cannot be empty")]
    EmptyStreamId,

    #[error("Unsupported event type: {0}")]
    UnsupportedEventType(String),

    #[error("Malformed {event_type} payload: {reason}")]
    MalformedPayload { event_type: String, reason: String },

    #[error("Invalid meter reading: {0}")]
    InvalidReading(f64),

    #[error("Reading unit cannot be empty")]
    EmptyUnit,

    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),
}
