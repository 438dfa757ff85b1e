// ============================================================================
// meter_ledger - Dual-Write Event Sourcing for Meter Readings
// ============================================================================
//
// Every record is appended to an event log, then folded into a per-meter
// read model (latest reading, balance). The two writes go to separate
// tables without a shared transaction; the coordinator and reconciler keep
// them consistent.
//
// ============================================================================

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod errors;
pub mod event_sourcing;
pub mod ledger;
pub mod metrics;
pub mod utils;

pub use backend::{Backend, BackendError, MemoryBackend, PostgresBackend};
pub use config::Config;
pub use coordinator::{DualWriteCoordinator, RecordHandle, RecordOutcome, RecordRequest, Reconciler, WriteState};
pub use domain::meter::{MeterEvent, ReadModelRow, ValidationError};
pub use errors::LedgerError;
pub use event_sourcing::{Event, EventStore, NewEvent, ReadModelProjector};
pub use ledger::Ledger;
pub use metrics::Metrics;
