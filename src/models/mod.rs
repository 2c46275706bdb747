//! Data models for signals, positions, and webhook outcomes.

mod position;
mod signal;

pub use position::{Leg, Position, PositionError, PositionStatus};
pub use signal::{EodConditions, OutcomeStatus, Signal, SignalKind, SignalOutcome};
