//! Entry approval against exposure, drawdown and balance limits.
//!
//! The gate never mutates anything: the same `RiskState` and proposal always
//! produce the same decision.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::config::RiskConfig;
use crate::exchange::AccountBalance;

/// Exposure figures derived from the ledger on every evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskState {
    pub total_notional_exposure: Decimal,
    pub open_position_count: u32,
    /// Positions opened so far on the current UTC day
    pub entries_today: u32,
    /// Decline from the P&L high-water mark, as a fraction of baseline capital
    pub running_drawdown: Decimal,
    pub per_pair_exposure: HashMap<String, Decimal>,
}

impl RiskState {
    pub fn pair_exposure(&self, pair: &str) -> Decimal {
        self.per_pair_exposure.get(pair).copied().unwrap_or_default()
    }
}

/// A proposed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryProposal {
    pub pair: String,
    pub notional: Decimal,
    pub leverage: u8,
    pub balance: AccountBalance,
}

/// Why the gate refused an entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum RejectReason {
    MaxOpenPositions { open: u32, max: u32 },
    DailyEntryLimit { entries: u32, max: u32 },
    TotalNotional { projected: Decimal, max: Decimal },
    PairNotional { projected: Decimal, max: Decimal },
    Drawdown { drawdown: Decimal, max: Decimal },
    InsufficientBalance { required: Decimal, available: Decimal },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MaxOpenPositions { open, max } => {
                write!(f, "max open positions reached ({}/{})", open, max)
            }
            RejectReason::DailyEntryLimit { entries, max } => {
                write!(f, "daily entry limit reached ({}/{})", entries, max)
            }
            RejectReason::TotalNotional { projected, max } => {
                write!(f, "total notional {} would exceed {}", projected, max)
            }
            RejectReason::PairNotional { projected, max } => {
                write!(f, "pair notional {} would exceed {}", projected, max)
            }
            RejectReason::Drawdown { drawdown, max } => {
                write!(f, "drawdown {} breached stop {}", drawdown, max)
            }
            RejectReason::InsufficientBalance { required, available } => {
                write!(f, "insufficient balance: need {}, have {}", required, available)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Approve,
    Reject(RejectReason),
}

/// Gate output. `force_close_all` is raised whenever drawdown is breached.
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub verdict: Verdict,
    pub force_close_all: bool,
}

impl GateDecision {
    fn approve() -> Self {
        Self {
            verdict: Verdict::Approve,
            force_close_all: false,
        }
    }

    fn reject(reason: RejectReason) -> Self {
        let force_close_all = matches!(reason, RejectReason::Drawdown { .. });
        Self {
            verdict: Verdict::Reject(reason),
            force_close_all,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approve
    }
}

/// Ordered chain of entry checks; the first failure wins.
#[derive(Debug, Clone)]
pub struct RiskGate {
    config: RiskConfig,
}

impl RiskGate {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, state: &RiskState, proposal: &EntryProposal) -> GateDecision {
        if state.open_position_count >= self.config.max_open_positions {
            return GateDecision::reject(RejectReason::MaxOpenPositions {
                open: state.open_position_count,
                max: self.config.max_open_positions,
            });
        }

        let daily_max = self.config.max_daily_entries;
        if daily_max > 0 && state.entries_today >= daily_max {
            return GateDecision::reject(RejectReason::DailyEntryLimit {
                entries: state.entries_today,
                max: daily_max,
            });
        }

        let projected_total = state.total_notional_exposure + proposal.notional;
        if projected_total > self.config.max_total_notional {
            return GateDecision::reject(RejectReason::TotalNotional {
                projected: projected_total,
                max: self.config.max_total_notional,
            });
        }

        let projected_pair = state.pair_exposure(&proposal.pair) + proposal.notional;
        if projected_pair > self.config.max_pair_notional {
            return GateDecision::reject(RejectReason::PairNotional {
                projected: projected_pair,
                max: self.config.max_pair_notional,
            });
        }

        if self.drawdown_breached(state) {
            return GateDecision::reject(RejectReason::Drawdown {
                drawdown: state.running_drawdown,
                max: self.config.max_drawdown,
            });
        }

        let required = self.required_balance(proposal);
        let available = proposal.balance.total_free();
        if available < required {
            return GateDecision::reject(RejectReason::InsufficientBalance { required, available });
        }

        GateDecision::approve()
    }

    /// Drawdown at or beyond the stop threshold.
    pub fn drawdown_breached(&self, state: &RiskState) -> bool {
        state.running_drawdown >= self.config.max_drawdown
    }

    /// Spot notional plus perp margin, with the safety buffer on top.
    pub fn required_balance(&self, proposal: &EntryProposal) -> Decimal {
        let leverage = Decimal::from(proposal.leverage.max(1));
        let margin = proposal.notional / leverage;
        (proposal.notional + margin) * (Decimal::ONE + self.config.balance_safety_buffer)
    }
}
