use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::backend::{Backend, InsertOutcome};
use crate::errors::LedgerError;
use crate::event_sourcing::core::{Event, NewEvent};
use crate::metrics::Metrics;

// ============================================================================
// Event Store - Append-Only Log of Meter Events
// ============================================================================
//
// Responsibilities:
// 1. Append events; the backend assigns the per-stream sequence
// 2. Detect idempotent retries (same id, same content) and conflicts
//    (same id, different content)
// 3. Read a stream lazily in sequence order, refusing to skip gaps
//
// ============================================================================

pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Result of an append.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    pub event: Event,
    /// The id was already in the log with identical content; nothing new was written.
    pub replayed: bool,
}

pub struct EventStore {
    backend: Arc<dyn Backend>,
    page_size: usize,
    metrics: Arc<Metrics>,
}

impl EventStore {
    pub fn new(backend: Arc<dyn Backend>, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            page_size: DEFAULT_PAGE_SIZE,
            metrics,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Append an event and return its sequence.
    pub async fn append(&self, event: NewEvent) -> Result<i64, LedgerError> {
        Ok(self.append_event(event).await?.event.sequence)
    }

    /// Append an event, reporting whether it was an idempotent replay.
    pub async fn append_event(&self, event: NewEvent) -> Result<Appended, LedgerError> {
        let started = Instant::now();

        let outcome = self
            .backend
            .insert_event(&event)
            .await
            .map_err(|e| LedgerError::from_append(e, event.id))?;

        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            InsertOutcome::Inserted(stored) => {
                self.metrics.record_append(&stored.event_type, elapsed, false);
                tracing::info!(
                    stream_id = %stored.stream_id,
                    event_id = %stored.id,
                    event_type = %stored.event_type,
                    sequence = stored.sequence,
                    "✅ Appended event to log"
                );
                Ok(Appended { event: stored, replayed: false })
            }
            InsertOutcome::Existing(stored) if event.same_content(&stored) => {
                self.metrics.record_append(&stored.event_type, elapsed, true);
                tracing::info!(
                    stream_id = %stored.stream_id,
                    event_id = %stored.id,
                    sequence = stored.sequence,
                    "Idempotent retry, returning original sequence"
                );
                Ok(Appended { event: stored, replayed: true })
            }
            InsertOutcome::Existing(stored) => {
                self.metrics.record_conflict();
                tracing::warn!(
                    stream_id = %event.stream_id,
                    event_id = %event.id,
                    original_sequence = stored.sequence,
                    "Idempotency key reused with a different payload"
                );
                Err(LedgerError::Conflict {
                    idempotency_key: event.id,
                    sequence: stored.sequence,
                })
            }
        }
    }

    /// Lazily read events with `sequence > from_sequence`, in order.
    ///
    /// Fetches one page at a time. The stream ends at the current head; to
    /// resume, call again with the last sequence seen. A hole in the
    /// sequence yields `SequenceGap` instead of skipping ahead.
    pub fn read(&self, stream_id: &str, from_sequence: i64) -> BoxStream<'static, Result<Event, LedgerError>> {
        let cursor = ReadCursor {
            backend: self.backend.clone(),
            stream_id: stream_id.to_string(),
            page_size: self.page_size,
            last_sequence: from_sequence.max(0),
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::try_unfold(cursor, |mut cursor| async move {
            let next = cursor.next_event().await?;
            Ok::<_, LedgerError>(next.map(|event| (event, cursor)))
        })
        .boxed()
    }

    /// Collect a stream's full history.
    pub async fn load(&self, stream_id: &str) -> Result<Vec<Event>, LedgerError> {
        self.read(stream_id, 0).try_collect().await
    }

    /// Look up an event by its idempotency key.
    pub async fn find_by_key(&self, idempotency_key: Uuid) -> Result<Option<Event>, LedgerError> {
        self.backend
            .find_event(idempotency_key)
            .await
            .map_err(LedgerError::from_backend)
    }

    /// Highest sequence in the stream, 0 when empty.
    pub async fn head(&self, stream_id: &str) -> Result<i64, LedgerError> {
        self.backend
            .stream_head(stream_id)
            .await
            .map_err(LedgerError::from_backend)
    }
}

struct ReadCursor {
    backend: Arc<dyn Backend>,
    stream_id: String,
    page_size: usize,
    last_sequence: i64,
    buffer: VecDeque<Event>,
    exhausted: bool,
}

impl ReadCursor {
    async fn next_event(&mut self) -> Result<Option<Event>, LedgerError> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .backend
                .read_events(&self.stream_id, self.last_sequence, self.page_size)
                .await
                .map_err(LedgerError::from_backend)?;

            tracing::debug!(
                stream_id = %self.stream_id,
                after = self.last_sequence,
                fetched = page.len(),
                "Fetched event page"
            );

            self.exhausted = page.len() < self.page_size;
            self.buffer.extend(page);
        }

        let Some(event) = self.buffer.pop_front() else {
            return Ok(None);
        };

        let expected = self.last_sequence + 1;
        if event.sequence != expected {
            return Err(LedgerError::SequenceGap {
                stream_id: self.stream_id.clone(),
                expected,
                found: event.sequence,
            });
        }

        self.last_sequence = event.sequence;
        Ok(Some(event))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
