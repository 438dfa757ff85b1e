use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::domain::meter::ReadModelRow;
use crate::event_sourcing::core::{Event, NewEvent};
use super::{Backend, BackendError, InsertOutcome, MemoryBackend, UpsertOutcome};

// ============================================================================
// Fault-Injecting Backend (tests only)
// ============================================================================

/// Scripted failure for the next `insert_event` call.
#[derive(Debug, Clone)]
pub enum InsertFault {
    /// Fail without writing.
    Before(BackendError),
    /// Write the event, then report the error (lost acknowledgement).
    After(BackendError),
}

/// Wraps a [`MemoryBackend`] and fails calls according to a script.
#[derive(Default)]
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    insert_faults: Mutex<VecDeque<InsertFault>>,
    upsert_faults: Mutex<VecDeque<BackendError>>,
    read_faults: Mutex<VecDeque<BackendError>>,
    pub insert_calls: AtomicU32,
    pub upsert_calls: AtomicU32,
}

impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_insert(&self, fault: InsertFault) {
        self.insert_faults.lock().unwrap().push_back(fault);
    }

    pub fn fail_next_upserts(&self, count: usize, error: BackendError) {
        let mut faults = self.upsert_faults.lock().unwrap();
        for _ in 0..count {
            faults.push_back(error.clone());
        }
    }

    pub fn fail_next_read(&self, error: BackendError) {
        self.read_faults.lock().unwrap().push_back(error);
    }

    pub fn inserts(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn upserts(&self) -> u32 {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn insert_event(&self, event: &NewEvent) -> Result<InsertOutcome, BackendError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.insert_faults.lock().unwrap().pop_front();

        match fault {
            Some(InsertFault::Before(error)) => Err(error),
            Some(InsertFault::After(error)) => {
                self.inner.insert_event(event).await?;
                Err(error)
            }
            None => self.inner.insert_event(event).await,
        }
    }

    async fn read_events(
        &self,
        stream_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Event>, BackendError> {
        let fault = self.read_faults.lock().unwrap().pop_front();
        if let Some(error) = fault {
            return Err(error);
        }
        self.inner.read_events(stream_id, after, limit).await
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>, BackendError> {
        self.inner.find_event(id).await
    }

    async fn stream_head(&self, stream_id: &str) -> Result<i64, BackendError> {
        self.inner.stream_head(stream_id).await
    }

    async fn get_row(&self, stream_id: &str) -> Result<Option<ReadModelRow>, BackendError> {
        self.inner.get_row(stream_id).await
    }

    async fn upsert_row(&self, row: &ReadModelRow) -> Result<UpsertOutcome, BackendError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.upsert_faults.lock().unwrap().pop_front();
        if let Some(error) = fault {
            return Err(error);
        }
        self.inner.upsert_row(row).await
    }

    async fn lagging_streams(&self, limit: usize) -> Result<Vec<String>, BackendError> {
        self.inner.lagging_streams(limit).await
    }
}
