// ============================================================================
// Meter Domain - Readings, Token Purchases and Top-ups
// ============================================================================
//
// This module contains ALL meter-specific code:
// - Events (ReadingRecorded, TokenPurchased, TopUp)
// - Errors (ValidationError)
// - Read model (ReadModelRow and its fold rules)
//
// ============================================================================

pub mod events;
pub mod errors;
pub mod read_model;

pub use events::*;
pub use errors::*;
pub use read_model::*;
