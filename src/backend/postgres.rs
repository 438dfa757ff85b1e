use async_trait::async_trait;
use chrono::SubsecRound;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::meter::ReadModelRow;
use crate::event_sourcing::core::{deserialize_payload, serialize_payload, Event, NewEvent};
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use super::{Backend, BackendError, InsertOutcome, UpsertOutcome};

// ============================================================================
// Postgres Backend
// ============================================================================
//
// Tables:
// - events:       append-only log, unique (stream_id, sequence)
// - stream_heads: one counter row per stream; locking it serializes appends
// - read_models:  projected current state per stream
//
// Every call runs behind a request timeout and a circuit breaker.
//
// ============================================================================

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        id          UUID         PRIMARY KEY,
        stream_id   TEXT         NOT NULL,
        event_type  TEXT         NOT NULL,
        payload     TEXT         NOT NULL,
        sequence    BIGINT       NOT NULL,
        occurred_at TIMESTAMPTZ  NOT NULL,
        UNIQUE (stream_id, sequence)
    )",
    "CREATE TABLE IF NOT EXISTS stream_heads (
        stream_id   TEXT    PRIMARY KEY,
        head        BIGINT  NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS read_models (
        stream_id             TEXT              PRIMARY KEY,
        latest_reading        DOUBLE PRECISION,
        balance               DOUBLE PRECISION  NOT NULL,
        updated_at            TIMESTAMPTZ,
        last_applied_sequence BIGINT            NOT NULL
    )",
];

const EVENT_COLUMNS: &str = "id, stream_id, event_type, payload, sequence, occurred_at";

pub struct PostgresBackend {
    pool: PgPool,
    request_timeout: Duration,
    breaker: CircuitBreaker,
}

impl PostgresBackend {
    pub fn new(pool: PgPool, request_timeout: Duration) -> Self {
        Self {
            pool,
            request_timeout,
            breaker: CircuitBreaker::new("postgres", CircuitBreakerConfig::default()),
        }
    }

    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(request_timeout)
            .connect(url)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        tracing::info!("Connected to Postgres backend");
        Ok(Self::new(pool, request_timeout))
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.breaker = self.breaker.with_metrics(metrics);
        self
    }

    /// Create the tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), BackendError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Event and read model tables ready");
        Ok(())
    }

    async fn guarded<T, F>(&self, operation: F) -> Result<T, BackendError>
    where
        F: std::future::Future<Output = Result<T, BackendError>>,
    {
        let timeout = self.request_timeout;
        let result = self
            .breaker
            .call(async move {
                match tokio::time::timeout(timeout, operation).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout(format!("no response after {:?}", timeout))),
                }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::CircuitOpen) => {
                Err(BackendError::Unavailable("circuit breaker open".to_string()))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => Err(e),
        }
    }

    async fn fetch_event(&self, id: Uuid) -> Result<Option<Event>, BackendError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_event).transpose()
    }

    async fn fetch_row(&self, stream_id: &str) -> Result<Option<ReadModelRow>, BackendError> {
        let row = sqlx::query(
            "SELECT stream_id, latest_reading, balance, updated_at, last_applied_sequence
             FROM read_models WHERE stream_id = $1",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_row).transpose()
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn insert_event(&self, event: &NewEvent) -> Result<InsertOutcome, BackendError> {
        let payload = serialize_payload(&event.payload)
            .map_err(|e| BackendError::Rejected(format!("unserializable payload: {}", e)))?;

        self.guarded(self.insert_in_tx(event, &payload)).await
    }

    async fn read_events(
        &self,
        stream_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Event>, BackendError> {
        self.guarded(self.select_events(stream_id, after, limit)).await
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>, BackendError> {
        self.guarded(self.fetch_event(id)).await
    }

    async fn stream_head(&self, stream_id: &str) -> Result<i64, BackendError> {
        self.guarded(self.select_head(stream_id)).await
    }

    async fn get_row(&self, stream_id: &str) -> Result<Option<ReadModelRow>, BackendError> {
        self.guarded(self.fetch_row(stream_id)).await
    }

    async fn upsert_row(&self, row: &ReadModelRow) -> Result<UpsertOutcome, BackendError> {
        self.guarded(self.write_row(row)).await
    }

    async fn lagging_streams(&self, limit: usize) -> Result<Vec<String>, BackendError> {
        self.guarded(self.select_lagging(limit)).await
    }
}

// ============================================================================
// Queries
// ============================================================================

impl PostgresBackend {
    async fn insert_in_tx(&self, event: &NewEvent, payload: &str) -> Result<InsertOutcome, BackendError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(event.id)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = existing {
            tx.rollback().await?;
            return Ok(InsertOutcome::Existing(decode_event(&row)?));
        }

        // Postgres keeps microseconds; return exactly what a later read will see.
        let occurred_at = event.occurred_at.trunc_subsecs(6);

        // Row lock on the counter is held until commit.
        let (sequence,): (i64,) = sqlx::query_as(
            "INSERT INTO stream_heads (stream_id, head) VALUES ($1, 1)
             ON CONFLICT (stream_id) DO UPDATE SET head = stream_heads.head + 1
             RETURNING head",
        )
        .bind(&event.stream_id)
        .fetch_one(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            "INSERT INTO events (id, stream_id, event_type, payload, sequence, occurred_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.id)
        .bind(&event.stream_id)
        .bind(&event.event_type)
        .bind(payload)
        .bind(sequence)
        .bind(occurred_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                let stored = event.clone().with_occurred_at(occurred_at).into_event(sequence);
                Ok(InsertOutcome::Inserted(stored))
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                // A concurrent append with the same id won the race.
                drop(tx);
                match self.fetch_event(event.id).await? {
                    Some(stored) => Ok(InsertOutcome::Existing(stored)),
                    None => Err(BackendError::Rejected(db.to_string())),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn select_events(
        &self,
        stream_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Event>, BackendError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE stream_id = $1 AND sequence > $2
             ORDER BY sequence ASC
             LIMIT $3"
        ))
        .bind(stream_id)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_event).collect()
    }

    async fn select_head(&self, stream_id: &str) -> Result<i64, BackendError> {
        let head: Option<(i64,)> = sqlx::query_as("SELECT head FROM stream_heads WHERE stream_id = $1")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(head.map(|(h,)| h).unwrap_or(0))
    }

    async fn write_row(&self, row: &ReadModelRow) -> Result<UpsertOutcome, BackendError> {
        let result = sqlx::query(
            "INSERT INTO read_models (stream_id, latest_reading, balance, updated_at, last_applied_sequence)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (stream_id) DO UPDATE SET
                latest_reading = EXCLUDED.latest_reading,
                balance = EXCLUDED.balance,
                updated_at = EXCLUDED.updated_at,
                last_applied_sequence = EXCLUDED.last_applied_sequence
             WHERE read_models.last_applied_sequence < EXCLUDED.last_applied_sequence",
        )
        .bind(&row.stream_id)
        .bind(row.latest_reading)
        .bind(row.balance)
        .bind(row.updated_at)
        .bind(row.last_applied_sequence)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(UpsertOutcome::Written);
        }

        match self.fetch_row(&row.stream_id).await? {
            Some(stored) => Ok(UpsertOutcome::Stale(stored)),
            None => Err(BackendError::Rejected(format!(
                "upsert of {} affected no rows",
                row.stream_id
            ))),
        }
    }

    async fn select_lagging(&self, limit: usize) -> Result<Vec<String>, BackendError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT h.stream_id
             FROM stream_heads h
             LEFT JOIN read_models r ON r.stream_id = h.stream_id
             WHERE h.head > COALESCE(r.last_applied_sequence, 0)
             ORDER BY h.stream_id
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(stream_id,)| stream_id).collect())
    }
}

// ============================================================================
// Row Decoding & Error Mapping
// ============================================================================

fn decode_event(row: &PgRow) -> Result<Event, BackendError> {
    let payload: String = row.try_get("payload")?;

    Ok(Event {
        id: row.try_get("id")?,
        stream_id: row.try_get("stream_id")?,
        event_type: row.try_get("event_type")?,
        payload: deserialize_payload(&payload)
            .map_err(|e| BackendError::Corrupt(format!("event payload: {}", e)))?,
        sequence: row.try_get("sequence")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

fn decode_row(row: &PgRow) -> Result<ReadModelRow, BackendError> {
    Ok(ReadModelRow {
        stream_id: row.try_get("stream_id")?,
        latest_reading: row.try_get("latest_reading")?,
        balance: row.try_get("balance")?,
        updated_at: row.try_get("updated_at")?,
        last_applied_sequence: row.try_get("last_applied_sequence")?,
    })
}

impl From<sqlx::Error> for BackendError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                BackendError::Unavailable(error.to_string())
            }
            // Connection lost mid-request: the statement may have committed.
            sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed => {
                BackendError::Timeout(error.to_string())
            }
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected: rolled back, safe to retry
                Some("40001") | Some("40P01") => BackendError::Unavailable(error.to_string()),
                _ => BackendError::Rejected(error.to_string()),
            },
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => BackendError::Corrupt(error.to_string()),
            _ => BackendError::Rejected(error.to_string()),
        }
    }
}
