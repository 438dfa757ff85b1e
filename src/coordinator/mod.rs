// ============================================================================
// Coordinator - Dual-Write Orchestration and Reconciliation
// ============================================================================

pub mod dual_write;
pub mod reconciler;

pub use dual_write::{DualWriteCoordinator, RecordHandle, RecordOutcome, RecordRequest, WriteState};
pub use reconciler::{PendingRepair, ReconcileStats, Reconciler, ReconcilerConfig, RepairQueue};
