// ============================================================================
// Event Sourcing Store - Persistence of the Event Log
// ============================================================================

pub mod event_store;

pub use event_store::{Appended, EventStore, DEFAULT_PAGE_SIZE};
