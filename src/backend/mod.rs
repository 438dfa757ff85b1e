use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::meter::ReadModelRow;
use crate::event_sourcing::core::{Event, NewEvent};
use crate::utils::IsTransient;

mod memory;
mod postgres;

#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

// ============================================================================
// Backend - Remote Table Store Abstraction
// ============================================================================
//
// The write path only needs a handful of primitives from the remote store.
// None of them spans both tables, so the coordinator cannot rely on a
// cross-table transaction:
//
// - insert an event with a store-generated per-stream sequence
// - read a stream's events ordered by sequence
// - conditionally upsert a read-model row by stream id
//
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The request never reached the backend (pool exhausted, circuit open,
    /// connection refused). Safe to retry.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// No response within the deadline. The request may or may not have
    /// been applied.
    #[error("Backend timed out: {0}")]
    Timeout(String),

    #[error("Backend rejected request: {0}")]
    Rejected(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl BackendError {
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, BackendError::Timeout(_))
    }
}

impl IsTransient for BackendError {
    fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Timeout(_))
    }
}

/// Result of inserting an event.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// Written with a freshly assigned sequence.
    Inserted(Event),
    /// An event with the same id already exists; nothing was written.
    Existing(Event),
}

/// Result of a conditional read-model upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Written,
    /// The stored row already covers this sequence. Carries the stored row.
    Stale(ReadModelRow),
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Insert `event` with the next sequence of its stream.
    ///
    /// Appends to one stream are serialized; no two events get the same
    /// sequence. An existing id is reported, not overwritten.
    async fn insert_event(&self, event: &NewEvent) -> Result<InsertOutcome, BackendError>;

    /// Events with `sequence > after`, ascending, at most `limit`.
    async fn read_events(
        &self,
        stream_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Event>, BackendError>;

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>, BackendError>;

    /// Highest sequence in the stream, 0 when empty.
    async fn stream_head(&self, stream_id: &str) -> Result<i64, BackendError>;

    async fn get_row(&self, stream_id: &str) -> Result<Option<ReadModelRow>, BackendError>;

    /// Write `row` unless the stored row has `last_applied_sequence` at or
    /// above it.
    async fn upsert_row(&self, row: &ReadModelRow) -> Result<UpsertOutcome, BackendError>;

    /// Streams whose read model is behind the log.
    async fn lagging_streams(&self, limit: usize) -> Result<Vec<String>, BackendError>;
}
