use futures_util::TryStreamExt;
use std::sync::Arc;

use crate::backend::{Backend, UpsertOutcome};
use crate::domain::meter::ReadModelRow;
use crate::errors::LedgerError;
use crate::event_sourcing::core::Event;
use crate::event_sourcing::store::EventStore;
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Read Model Projector
// ============================================================================
//
// Folds events into the per-stream ReadModelRow and persists it.
//
// - apply:   pure (row, event) -> row
// - rebuild: replay the whole stream from sequence 0
// - project: load stored row, apply (or rebuild on a gap), persist
//
// The stored row only ever moves forward: persistence is a conditional
// upsert on last_applied_sequence, so concurrent projections of the same
// stream converge on the newest row.
//
// ============================================================================

/// How a projection reached its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionKind {
    /// Event applied on top of the stored row.
    Applied,
    /// Stored row was behind by more than one event; replayed from the log.
    Rebuilt,
    /// Stored row already covered the event.
    AlreadyApplied,
}

impl ProjectionKind {
    fn label(self) -> &'static str {
        match self {
            ProjectionKind::Applied => "applied",
            ProjectionKind::Rebuilt => "rebuilt",
            ProjectionKind::AlreadyApplied => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub row: ReadModelRow,
    pub kind: ProjectionKind,
}

pub struct ReadModelProjector {
    store: Arc<EventStore>,
    backend: Arc<dyn Backend>,
    retry: RetryConfig,
    metrics: Arc<Metrics>,
}

impl ReadModelProjector {
    pub fn new(
        store: Arc<EventStore>,
        backend: Arc<dyn Backend>,
        retry: RetryConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, backend, retry, metrics }
    }

    /// Fold one event into `row`. Deterministic and side-effect free.
    ///
    /// Returns `row` unchanged unless `event` is the next sequence.
    pub fn apply(row: &ReadModelRow, event: &Event) -> ReadModelRow {
        row.apply_event(event)
    }

    /// Replay the stream's full history into a fresh row. Nothing is persisted.
    pub async fn rebuild(&self, stream_id: &str) -> Result<ReadModelRow, LedgerError> {
        let row = self
            .store
            .read(stream_id, 0)
            .try_fold(ReadModelRow::empty(stream_id), |row, event| async move {
                Ok(Self::apply(&row, &event))
            })
            .await?;

        tracing::debug!(
            stream_id = %stream_id,
            last_applied_sequence = row.last_applied_sequence,
            "Rebuilt read model from log"
        );

        Ok(row)
    }

    /// The stored row, or an empty one if the stream was never projected.
    pub async fn current(&self, stream_id: &str) -> Result<ReadModelRow, LedgerError> {
        let stored = self
            .backend
            .get_row(stream_id)
            .await
            .map_err(LedgerError::from_backend)?;

        Ok(stored.unwrap_or_else(|| ReadModelRow::empty(stream_id)))
    }

    /// Bring the stored row up to `event`, retrying transient failures.
    pub async fn project(&self, event: &Event) -> Result<Projection, LedgerError> {
        let result = retry_on_transient(&self.retry, "project", |attempt| async move {
            if attempt > 1 {
                self.metrics.record_retry_attempt("project", attempt);
            }
            self.project_once(event).await
        })
        .await;

        self.finish("project", result)
    }

    /// Rebuild a stream from the log and persist it.
    pub async fn repair(&self, stream_id: &str) -> Result<ReadModelRow, LedgerError> {
        let result = retry_on_transient(&self.retry, "repair", |attempt| async move {
            if attempt > 1 {
                self.metrics.record_retry_attempt("repair", attempt);
            }
            let row = self.rebuild(stream_id).await?;
            self.persist(row).await
        })
        .await;

        let row = self.finish("repair", result)?.row;
        tracing::info!(
            stream_id = %stream_id,
            last_applied_sequence = row.last_applied_sequence,
            "🔧 Repaired read model"
        );
        Ok(row)
    }

    async fn project_once(&self, event: &Event) -> Result<Projection, LedgerError> {
        let current = self.current(&event.stream_id).await?;

        if event.sequence <= current.last_applied_sequence {
            return Ok(Projection { row: current, kind: ProjectionKind::AlreadyApplied });
        }

        let (row, kind) = if event.sequence == current.last_applied_sequence + 1 {
            (Self::apply(&current, event), ProjectionKind::Applied)
        } else {
            tracing::warn!(
                stream_id = %event.stream_id,
                last_applied_sequence = current.last_applied_sequence,
                sequence = event.sequence,
                "Read model is behind by more than one event, rebuilding from log"
            );
            (self.rebuild(&event.stream_id).await?, ProjectionKind::Rebuilt)
        };

        let persisted = self.persist(row).await?;
        Ok(match persisted.kind {
            ProjectionKind::AlreadyApplied => persisted,
            _ => Projection { row: persisted.row, kind },
        })
    }

    async fn persist(&self, row: ReadModelRow) -> Result<Projection, LedgerError> {
        match self.backend.upsert_row(&row).await.map_err(LedgerError::from_backend)? {
            UpsertOutcome::Written => Ok(Projection { row, kind: ProjectionKind::Applied }),
            UpsertOutcome::Stale(stored) => {
                tracing::debug!(
                    stream_id = %row.stream_id,
                    ours = row.last_applied_sequence,
                    stored = stored.last_applied_sequence,
                    "Stored read model already ahead"
                );
                Ok(Projection { row: stored, kind: ProjectionKind::AlreadyApplied })
            }
        }
    }

    fn finish(
        &self,
        operation: &str,
        result: RetryResult<Projection, LedgerError>,
    ) -> Result<Projection, LedgerError> {
        match result {
            RetryResult::Success { value: projection, attempts } => {
                if attempts > 1 {
                    self.metrics.record_retry_outcome(operation, true);
                }
                self.metrics.record_projection(projection.kind.label());
                Ok(projection)
            }
            RetryResult::Exhausted { error, attempts } => {
                self.metrics.record_projection("failed");
                self.metrics.record_retry_outcome(operation, false);
                Err(error.with_attempts(attempts))
            }
            RetryResult::PermanentFailure(error) => {
                self.metrics.record_projection("failed");
                Err(error)
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
