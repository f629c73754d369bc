//! Trading decisions and their execution.
//!
//! - `signal`: funding snapshot scoring, entry filters and sizing
//! - `executor`: two-leg open/close protocols with unwind and escalation

mod executor;
mod signal;

pub use executor::{CloseOutcome, ExecutionCoordinator, OpenOutcome};
pub use signal::{
    size_position, EntryRejection, NoSignalReason, OpportunityScore, SignalEvaluator, SignalOutcome, Sizing,
};
