// ============================================================================
// Domain Layer - Meter Business Rules
// ============================================================================
//
// Payload schemas, validation and the fold rules for the meter read model.
// Kept separate from the generic event sourcing infrastructure.
//
// ============================================================================

pub mod meter;
