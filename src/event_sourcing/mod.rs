// ============================================================================
// Event Sourcing Infrastructure
// ============================================================================
//
// Append-only event log and the projector that folds it into read models.
// Meter-specific event semantics are in src/domain/
//
// ============================================================================

pub mod core;
pub mod store;
pub mod projection;

pub use self::core::*;
pub use store::*;
pub use projection::*;
