use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::meter::{MeterEvent, ReadModelRow, ValidationError};
use crate::errors::LedgerError;
use crate::event_sourcing::core::NewEvent;
use crate::event_sourcing::projection::ReadModelProjector;
use crate::event_sourcing::store::{Appended, EventStore};
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

use super::reconciler::{PendingRepair, RepairQueue};

// ============================================================================
// Dual-Write Coordinator
// ============================================================================
//
// One logical record = append to the log + update the read model. The two
// writes cannot share a transaction, so:
//
// 1. The append is the durability boundary. Once it succeeds the record
//    exists, whatever happens next.
// 2. Projection is retried with backoff. If it still fails the caller gets
//    PartialWrite (with the durable sequence) and the stream is queued for
//    the reconciler. The append is never repeated at that point.
// 3. Append retries are limited to failures that never reached the backend.
//    A timeout is ambiguous: it is reported with the idempotency key so the
//    caller can retry with the same key and get the original sequence back.
//
// State machine:
//
//   Pending -> EventWritten -> Projected
//                           -> ProjectionFailed
//
// ============================================================================

/// Request to record one event on a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRequest {
    pub stream_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Reuse the key from a previous attempt to make the retry idempotent.
    pub idempotency_key: Option<Uuid>,
}

impl RecordRequest {
    pub fn new(
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            event_type: event_type.into(),
            payload,
            idempotency_key: None,
        }
    }

    pub fn from_event(stream_id: impl Into<String>, event: &MeterEvent) -> Self {
        Self::new(stream_id, event.event_type(), event.payload())
    }

    pub fn with_idempotency_key(mut self, key: Uuid) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub sequence: i64,
    pub row: ReadModelRow,
    /// The key was already recorded; no new event was written.
    pub replayed: bool,
    pub idempotency_key: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Pending,
    EventWritten { sequence: i64 },
    Projected { sequence: i64 },
    ProjectionFailed { sequence: i64 },
}

pub struct DualWriteCoordinator {
    store: Arc<EventStore>,
    projector: Arc<ReadModelProjector>,
    append_retry: RetryConfig,
    repairs: Option<RepairQueue>,
    metrics: Arc<Metrics>,
}

impl DualWriteCoordinator {
    pub fn new(
        store: Arc<EventStore>,
        projector: Arc<ReadModelProjector>,
        append_retry: RetryConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            projector,
            append_retry,
            repairs: None,
            metrics,
        }
    }

    /// Hand partial writes to a reconciler.
    pub fn with_repair_queue(mut self, queue: RepairQueue) -> Self {
        self.repairs = Some(queue);
        self
    }

    /// Validate, append, project.
    ///
    /// The append runs on its own task, so dropping this future after the
    /// request reached the backend does not abort it.
    pub async fn record(&self, request: RecordRequest) -> Result<RecordOutcome, LedgerError> {
        let event = validate(request)?;
        let idempotency_key = event.id;
        let stream_id = event.stream_id.clone();

        let mut state = WriteState::Pending;
        tracing::debug!(
            stream_id = %stream_id,
            idempotency_key = %idempotency_key,
            event_type = %event.event_type,
            state = ?state,
            "Recording event"
        );

        let store = self.store.clone();
        let retry = self.append_retry.clone();
        let metrics = self.metrics.clone();
        let appended = tokio::spawn(append_with_retry(store, retry, metrics, event))
            .await
            .map_err(|e| LedgerError::TaskFailed(e.to_string()))??;

        let sequence = appended.event.sequence;
        state = transition(&stream_id, state, WriteState::EventWritten { sequence });

        match self.projector.project(&appended.event).await {
            Ok(projection) => {
                transition(&stream_id, state, WriteState::Projected { sequence });
                Ok(RecordOutcome {
                    sequence,
                    row: projection.row,
                    replayed: appended.replayed,
                    idempotency_key,
                })
            }
            Err(error) => {
                transition(&stream_id, state, WriteState::ProjectionFailed { sequence });
                self.metrics.record_partial_write();
                tracing::error!(
                    stream_id = %stream_id,
                    sequence = sequence,
                    error = %error,
                    "⚠️ Event saved but read model not updated"
                );

                if let Some(queue) = &self.repairs {
                    queue.enqueue(PendingRepair { stream_id: stream_id.clone(), sequence });
                }

                Err(LedgerError::PartialWrite {
                    stream_id,
                    sequence,
                    source: Box::new(error),
                })
            }
        }
    }

    /// Run `record` on its own task. Dropping the handle detaches it; the
    /// record still completes.
    pub fn submit(self: &Arc<Self>, request: RecordRequest) -> RecordHandle {
        let coordinator = Arc::clone(self);
        RecordHandle {
            inner: tokio::spawn(async move { coordinator.record(request).await }),
        }
    }
}

fn validate(request: RecordRequest) -> Result<NewEvent, ValidationError> {
    if request.stream_id.trim().is_empty() {
        return Err(ValidationError::EmptyStreamId);
    }

    MeterEvent::parse(&request.event_type, &request.payload)?;

    let event = NewEvent::new(request.stream_id, request.event_type, request.payload);
    Ok(match request.idempotency_key {
        Some(key) => event.with_id(key),
        None => event,
    })
}

async fn append_with_retry(
    store: Arc<EventStore>,
    retry: RetryConfig,
    metrics: Arc<Metrics>,
    event: NewEvent,
) -> Result<Appended, LedgerError> {
    let result = retry_on_transient(&retry, "append", |attempt| {
        let store = store.clone();
        let metrics = metrics.clone();
        let event = event.clone();
        async move {
            if attempt > 1 {
                metrics.record_retry_attempt("append", attempt);
            }
            store.append_event(event).await
        }
    })
    .await;

    match result {
        RetryResult::Success { value: appended, attempts } => {
            if attempts > 1 {
                metrics.record_retry_outcome("append", true);
            }
            Ok(appended)
        }
        RetryResult::Exhausted { error, attempts } => {
            metrics.record_retry_outcome("append", false);
            Err(error.with_attempts(attempts))
        }
        RetryResult::PermanentFailure(error) => Err(error),
    }
}

fn transition(stream_id: &str, from: WriteState, to: WriteState) -> WriteState {
    tracing::debug!(stream_id = %stream_id, from = ?from, to = ?to, "Write state transition");
    to
}

/// Handle to a submitted record.
pub struct RecordHandle {
    inner: JoinHandle<Result<RecordOutcome, LedgerError>>,
}

impl RecordHandle {
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl Future for RecordHandle {
    type Output = Result<RecordOutcome, LedgerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(LedgerError::TaskFailed(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{FlakyBackend, InsertFault};
    use crate::backend::BackendError;
    use crate::coordinator::reconciler::{Reconciler, ReconcilerConfig};
    use crate::domain::meter::{ReadingRecorded, TokenPurchased};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        backend: Arc<FlakyBackend>,
        store: Arc<EventStore>,
        projector: Arc<ReadModelProjector>,
        coordinator: Arc<DualWriteCoordinator>,
        reconciler: Reconciler,
        metrics: Arc<Metrics>,
    }

    fn fixture() -> Fixture {
        let backend = FlakyBackend::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let retry = RetryConfig::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(1));

        let store = Arc::new(EventStore::new(backend.clone(), metrics.clone()));
        let projector = Arc::new(ReadModelProjector::new(
            store.clone(),
            backend.clone(),
            retry.clone(),
            metrics.clone(),
        ));
        let (reconciler, queue) = Reconciler::new(
            projector.clone(),
            backend.clone(),
            ReconcilerConfig::default(),
            metrics.clone(),
        );
        let coordinator = Arc::new(
            DualWriteCoordinator::new(store.clone(), projector.clone(), retry, metrics.clone())
                .with_repair_queue(queue),
        );

        Fixture { backend, store, projector, coordinator, reconciler, metrics }
    }

    fn reading(value: f64) -> RecordRequest {
        RecordRequest::new("M123", "reading-recorded", json!({ "value": value, "unit": "kWh" }))
    }

    fn token(amount: f64) -> RecordRequest {
        RecordRequest::new("M123", "token-purchased", json!({ "amount": amount }))
    }

    #[tokio::test]
    async fn test_reading_then_token_purchase() {
        let f = fixture();

        let first = f.coordinator.record(reading(102.5)).await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.row.latest_reading, Some(102.5));
        assert_eq!(first.row.balance, 0.0);

        let second = f.coordinator.record(token(50.0)).await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.row.latest_reading, Some(102.5));
        assert_eq!(second.row.balance, 50.0);
        assert_eq!(second.row.last_applied_sequence, 2);

        assert_eq!(f.projector.rebuild("M123").await.unwrap(), second.row);
    }

    #[tokio::test]
    async fn test_record_from_typed_event() {
        let f = fixture();
        let event = MeterEvent::TokenPurchased(TokenPurchased {
            amount: 20.0,
            token: Some("0123-4567".into()),
        });

        let outcome = f.coordinator.record(RecordRequest::from_event("M9", &event)).await.unwrap();

        assert_eq!(outcome.row.balance, 20.0);
        let stored = f.store.load("M9").await.unwrap();
        assert_eq!(MeterEvent::from_stored(&stored[0]), Some(Ok(event)));
    }

    #[tokio::test]
    async fn test_retry_with_same_key_is_idempotent() {
        let f = fixture();
        let key = Uuid::new_v4();

        let first = f.coordinator.record(token(50.0).with_idempotency_key(key)).await.unwrap();
        let retry = f.coordinator.record(token(50.0).with_idempotency_key(key)).await.unwrap();

        assert!(!first.replayed);
        assert!(retry.replayed);
        assert_eq!(retry.sequence, first.sequence);
        assert_eq!(retry.row.balance, 50.0);
        assert_eq!(f.store.load("M123").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_with_reformatted_amount_is_idempotent() {
        let f = fixture();
        let key = Uuid::new_v4();

        let first = f
            .coordinator
            .record(RecordRequest::new("M123", "token-purchased", json!({"amount": 50})).with_idempotency_key(key))
            .await
            .unwrap();
        let retry = f
            .coordinator
            .record(RecordRequest::new("M123", "token-purchased", json!({"amount": 50.0})).with_idempotency_key(key))
            .await
            .unwrap();

        assert!(retry.replayed);
        assert_eq!(retry.sequence, first.sequence);
        assert_eq!(retry.row.balance, 50.0);
    }

    #[tokio::test]
    async fn test_append_retry_success_is_counted() {
        let f = fixture();
        f.backend.fail_next_insert(InsertFault::Before(BackendError::Unavailable("refused".into())));

        f.coordinator.record(reading(1.0)).await.unwrap();

        assert_eq!(f.metrics.retry_success.with_label_values(&["append"]).get(), 1);
    }

    #[tokio::test]
    async fn test_same_key_different_payload_conflicts() {
        let f = fixture();
        let key = Uuid::new_v4();
        f.coordinator.record(token(50.0).with_idempotency_key(key)).await.unwrap();

        let result = f.coordinator.record(token(75.0).with_idempotency_key(key)).await;

        assert!(matches!(result, Err(LedgerError::Conflict { sequence: 1, .. })));
        assert_eq!(f.projector.current("M123").await.unwrap().balance, 50.0);
    }

    #[tokio::test]
    async fn test_projection_failure_is_partial_write() {
        let f = fixture();
        f.backend.fail_next_upserts(3, BackendError::Unavailable("read model down".into()));

        let result = f.coordinator.record(reading(88.0)).await;

        let error = result.unwrap_err();
        assert!(error.is_partial());
        assert_eq!(error.written_sequence(), Some(1));
        assert_eq!(f.backend.inserts(), 1);

        // Event is durable, read model is behind.
        assert_eq!(f.store.head("M123").await.unwrap(), 1);
        assert_eq!(f.projector.current("M123").await.unwrap().last_applied_sequence, 0);

        let stats = f.reconciler.run_once().await.unwrap();
        assert_eq!(stats.repaired, 1);

        let row = f.projector.current("M123").await.unwrap();
        assert_eq!(row.last_applied_sequence, 1);
        assert_eq!(row.latest_reading, Some(88.0));
    }

    #[tokio::test]
    async fn test_next_record_catches_up_after_partial_write() {
        let f = fixture();
        f.backend.fail_next_upserts(3, BackendError::Unavailable("down".into()));
        assert!(f.coordinator.record(token(10.0)).await.unwrap_err().is_partial());

        let outcome = f.coordinator.record(token(5.0)).await.unwrap();

        assert_eq!(outcome.sequence, 2);
        assert_eq!(outcome.row.balance, 15.0);
        assert_eq!(outcome.row.last_applied_sequence, 2);
    }

    #[tokio::test]
    async fn test_invalid_request_writes_nothing() {
        let f = fixture();

        let negative = f.coordinator.record(reading(-3.0)).await;
        let unknown = f
            .coordinator
            .record(RecordRequest::new("M123", "meter-swapped", json!({})))
            .await;
        let no_stream = f.coordinator.record(RecordRequest::new(" ", "top-up", json!({"amount": 1}))).await;

        assert!(matches!(negative, Err(LedgerError::Validation(ValidationError::InvalidReading(_)))));
        assert!(matches!(unknown, Err(LedgerError::Validation(ValidationError::UnsupportedEventType(_)))));
        assert!(matches!(no_stream, Err(LedgerError::Validation(ValidationError::EmptyStreamId))));
        assert_eq!(f.backend.inserts(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_append_is_retried() {
        let f = fixture();
        f.backend.fail_next_insert(InsertFault::Before(BackendError::Unavailable("refused".into())));

        let outcome = f.coordinator.record(reading(1.0)).await.unwrap();

        assert_eq!(outcome.sequence, 1);
        assert_eq!(f.backend.inserts(), 2);
    }

    #[tokio::test]
    async fn test_append_gives_up_after_bound() {
        let f = fixture();
        for _ in 0..3 {
            f.backend.fail_next_insert(InsertFault::Before(BackendError::Unavailable("refused".into())));
        }

        let result = f.coordinator.record(reading(1.0)).await;

        assert!(matches!(result, Err(LedgerError::Transient { attempts: 3, ambiguous: false, .. })));
        assert_eq!(f.store.head("M123").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ambiguous_timeout_is_not_retried() {
        let f = fixture();
        f.backend.fail_next_insert(InsertFault::After(BackendError::Timeout("no ack".into())));
        let request = reading(42.0);

        let key = match f.coordinator.record(request.clone()).await {
            Err(LedgerError::Transient { ambiguous: true, idempotency_key: Some(key), .. }) => key,
            other => panic!("Expected ambiguous timeout, got {:?}", other),
        };
        assert_eq!(f.backend.inserts(), 1);

        // Caller retries with the reported key and gets the original write back.
        let outcome = f.coordinator.record(request.with_idempotency_key(key)).await.unwrap();
        assert!(outcome.replayed);
        assert_eq!(outcome.sequence, 1);
        assert_eq!(outcome.row.latest_reading, Some(42.0));
        assert_eq!(f.store.load("M123").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_submit_still_completes() {
        let f = fixture();

        let handle = f.coordinator.submit(reading(12.0));
        drop(handle);

        let mut head = 0;
        for _ in 0..100 {
            head = f.store.head("M123").await.unwrap();
            if head == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(head, 1);
    }

    #[tokio::test]
    async fn test_submit_resolves_to_outcome() {
        let f = fixture();

        let outcome = f.coordinator.submit(token(9.5)).await.unwrap();

        assert_eq!(outcome.row.balance, 9.5);
    }

    #[tokio::test]
    async fn test_concurrent_records_converge() {
        let f = fixture();

        let handles: Vec<RecordHandle> = (0..20).map(|_| f.coordinator.submit(token(1.0))).collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let row = f.projector.current("M123").await.unwrap();
        assert_eq!(row.last_applied_sequence, 20);
        assert_eq!(row.balance, 20.0);

        let sequences: Vec<i64> = f.store.load("M123").await.unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let f = fixture();

        let a = f.coordinator.record(RecordRequest::from_event(
            "A",
            &MeterEvent::ReadingRecorded(ReadingRecorded { value: 1.0, unit: "kWh".into() }),
        ));
        let b = f.coordinator.record(RecordRequest::new("B", "top-up", json!({"amount": 3})));
        let (a, b) = tokio::join!(a, b);

        assert_eq!(a.unwrap().sequence, 1);
        assert_eq!(b.unwrap().sequence, 1);
    }
}
