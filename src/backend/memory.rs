use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::meter::ReadModelRow;
use crate::event_sourcing::core::{Event, NewEvent};
use super::{Backend, BackendError, InsertOutcome, UpsertOutcome};

// ============================================================================
// In-Memory Backend
// ============================================================================
//
// Same contract as the Postgres backend, held in process. Used when no
// DATABASE_URL is configured and as the base of the unit tests. A single
// mutex serializes appends, which is what the per-stream counter row does
// in Postgres.
//
// ============================================================================

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    streams: HashMap<String, Vec<Event>>,
    /// event id -> (stream id, index in stream)
    by_id: HashMap<Uuid, (String, usize)>,
    rows: HashMap<String, ReadModelRow>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn insert_event(&self, event: &NewEvent) -> Result<InsertOutcome, BackendError> {
        let mut state = self.state.lock().await;

        if let Some((stream_id, index)) = state.by_id.get(&event.id) {
            let existing = state.streams[stream_id][*index].clone();
            return Ok(InsertOutcome::Existing(existing));
        }

        let stream = state.streams.entry(event.stream_id.clone()).or_default();
        let sequence = stream.last().map(|e| e.sequence).unwrap_or(0) + 1;
        let stored = event.clone().into_event(sequence);
        stream.push(stored.clone());
        let index = stream.len() - 1;

        state.by_id.insert(event.id, (event.stream_id.clone(), index));

        Ok(InsertOutcome::Inserted(stored))
    }

    async fn read_events(
        &self,
        stream_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Event>, BackendError> {
        let state = self.state.lock().await;

        Ok(state
            .streams
            .get(stream_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>, BackendError> {
        let state = self.state.lock().await;

        Ok(state
            .by_id
            .get(&id)
            .map(|(stream_id, index)| state.streams[stream_id][*index].clone()))
    }

    async fn stream_head(&self, stream_id: &str) -> Result<i64, BackendError> {
        let state = self.state.lock().await;

        Ok(state
            .streams
            .get(stream_id)
            .and_then(|events| events.last())
            .map(|e| e.sequence)
            .unwrap_or(0))
    }

    async fn get_row(&self, stream_id: &str) -> Result<Option<ReadModelRow>, BackendError> {
        let state = self.state.lock().await;
        Ok(state.rows.get(stream_id).cloned())
    }

    async fn upsert_row(&self, row: &ReadModelRow) -> Result<UpsertOutcome, BackendError> {
        let mut state = self.state.lock().await;

        if let Some(stored) = state.rows.get(&row.stream_id) {
            if stored.last_applied_sequence >= row.last_applied_sequence {
                return Ok(UpsertOutcome::Stale(stored.clone()));
            }
        }

        state.rows.insert(row.stream_id.clone(), row.clone());
        Ok(UpsertOutcome::Written)
    }

    async fn lagging_streams(&self, limit: usize) -> Result<Vec<String>, BackendError> {
        let state = self.state.lock().await;

        let mut lagging: Vec<String> = state
            .streams
            .iter()
            .filter(|(stream_id, events)| {
                let head = events.last().map(|e| e.sequence).unwrap_or(0);
                let applied = state
                    .rows
                    .get(*stream_id)
                    .map(|r| r.last_applied_sequence)
                    .unwrap_or(0);
                applied < head
            })
            .map(|(stream_id, _)| stream_id.clone())
            .collect();

        lagging.sort();
        lagging.truncate(limit);
        Ok(lagging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sequences_are_per_stream() {
        let backend = MemoryBackend::new();

        for stream in ["A", "B", "A"] {
            backend
                .insert_event(&NewEvent::new(stream, "top-up", json!({"amount": 1})))
                .await
                .unwrap();
        }

        assert_eq!(backend.stream_head("A").await.unwrap(), 2);
        assert_eq!(backend.stream_head("B").await.unwrap(), 1);
        assert_eq!(backend.stream_head("C").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_existing_id_is_not_rewritten() {
        let backend = MemoryBackend::new();
        let event = NewEvent::new("A", "top-up", json!({"amount": 1}));

        let first = backend.insert_event(&event).await.unwrap();
        let second = backend.insert_event(&event).await.unwrap();

        let InsertOutcome::Inserted(stored) = first else {
            panic!("first insert should write");
        };
        assert_eq!(second, InsertOutcome::Existing(stored));
        assert_eq!(backend.stream_head("A").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_never_moves_backwards() {
        let backend = MemoryBackend::new();

        let mut newer = ReadModelRow::empty("A");
        newer.last_applied_sequence = 3;
        let mut older = ReadModelRow::empty("A");
        older.last_applied_sequence = 2;

        assert_eq!(backend.upsert_row(&newer).await.unwrap(), UpsertOutcome::Written);
        assert_eq!(backend.upsert_row(&older).await.unwrap(), UpsertOutcome::Stale(newer.clone()));
        assert_eq!(backend.get_row("A").await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_lagging_streams() {
        let backend = MemoryBackend::new();
        backend
            .insert_event(&NewEvent::new("A", "top-up", json!({"amount": 1})))
            .await
            .unwrap();
        backend
            .insert_event(&NewEvent::new("B", "top-up", json!({"amount": 1})))
            .await
            .unwrap();

        let mut caught_up = ReadModelRow::empty("B");
        caught_up.last_applied_sequence = 1;
        backend.upsert_row(&caught_up).await.unwrap();

        assert_eq!(backend.lagging_streams(10).await.unwrap(), vec!["A".to_string()]);
    }
}
