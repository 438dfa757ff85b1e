// ============================================================================
// Event Sourcing Core - Generic Event Types
// ============================================================================
//
// No meter-specific code lives here. The log stores event types as strings
// and payloads as JSON; src/domain/ gives them meaning.
//
// ============================================================================

pub mod event;

pub use event::{Event, NewEvent, serialize_payload, deserialize_payload};
