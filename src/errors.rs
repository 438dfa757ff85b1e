use uuid::Uuid;

use crate::backend::BackendError;
use crate::domain::meter::ValidationError;
use crate::utils::IsTransient;

// ============================================================================
// Ledger Errors
// ============================================================================
//
// What a caller of the write path can observe:
// - Conflict:     idempotency key reused with a different payload
// - Transient:    backend unreachable or timed out (retry bound exhausted,
//                 or the failure was ambiguous and must not be retried blindly)
// - PartialWrite: event is durable, projection is not (UI: "saved, syncing")
// - Validation:   malformed request, never retried
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Idempotency key {idempotency_key} already used for a different event (sequence {sequence})")]
    Conflict { idempotency_key: Uuid, sequence: i64 },

    #[error("Transient backend failure after {attempts} attempt(s): {source}")]
    Transient {
        attempts: u32,
        /// The request may have reached the backend. Look the key up before retrying.
        ambiguous: bool,
        idempotency_key: Option<Uuid>,
        #[source]
        source: BackendError,
    },

    #[error("Event {sequence} on stream {stream_id} was written but projection failed: {source}")]
    PartialWrite {
        stream_id: String,
        sequence: i64,
        #[source]
        source: Box<LedgerError>,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Sequence gap on stream {stream_id}: expected {expected}, found {found}")]
    SequenceGap { stream_id: String, expected: i64, found: i64 },

    #[error("Backend error: {0}")]
    Backend(#[source] BackendError),

    #[error("Record task failed: {0}")]
    TaskFailed(String),
}

impl LedgerError {
    /// Map a failure of an idempotent backend call (read, conditional upsert).
    pub fn from_backend(error: BackendError) -> Self {
        if error.is_transient() {
            LedgerError::Transient {
                attempts: 1,
                ambiguous: false,
                idempotency_key: None,
                source: error,
            }
        } else {
            LedgerError::Backend(error)
        }
    }

    /// Map a failure of an event append. A timeout leaves the outcome unknown.
    pub fn from_append(error: BackendError, idempotency_key: Uuid) -> Self {
        if error.is_transient() {
            LedgerError::Transient {
                attempts: 1,
                ambiguous: error.is_ambiguous(),
                idempotency_key: Some(idempotency_key),
                source: error,
            }
        } else {
            LedgerError::Backend(error)
        }
    }

    /// The event is durable; only the read model is behind.
    pub fn is_partial(&self) -> bool {
        matches!(self, LedgerError::PartialWrite { .. })
    }

    /// Sequence of the durable event, when there is one.
    pub fn written_sequence(&self) -> Option<i64> {
        match self {
            LedgerError::PartialWrite { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }

    pub(crate) fn with_attempts(self, total: u32) -> Self {
        match self {
            LedgerError::Transient { ambiguous, idempotency_key, source, .. } => {
                LedgerError::Transient { attempts: total, ambiguous, idempotency_key, source }
            }
            other => other,
        }
    }
}

impl IsTransient for LedgerError {
    /// Only failures known not to have been applied are retried automatically.
    fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient { ambiguous: false, .. })
    }
}
