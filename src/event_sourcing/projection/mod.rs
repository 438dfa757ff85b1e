// ============================================================================
// Projection - Folding the Log into Read Models
// ============================================================================

pub mod projector;

pub use projector::{Projection, ProjectionKind, ReadModelProjector};
