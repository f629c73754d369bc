//! Risk management for the arbitrage engine.
//!
//! - Entry gate: position count, notional ceilings, drawdown stop, balance
//! - Exit conditions for open positions

mod exit;
mod gate;

pub use exit::{ExitEvaluator, ExitReason};
pub use gate::{EntryProposal, GateDecision, RejectReason, RiskGate, RiskState, Verdict};
