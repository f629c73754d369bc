//! Signal evaluation: funding snapshots to opportunity scores.
//!
//! For positive funding: long spot + short perp (shorts receive funding).
//! For negative funding: short spot + long perp (longs receive funding).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

use crate::config::{ExecutionConfig, SignalConfig, YieldBasis};
use crate::exchange::{FundingSnapshot, TradingPair};
use crate::ledger::Direction;
use crate::utils::{round_down_to_lot, safe_div, to_basis_points};

/// Normalized opportunity for one pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpportunityScore {
    pub pair: String,
    pub direction: Direction,
    pub funding_rate: Decimal,
    /// Funding income on the target notional, per period or annualized
    pub expected_periodic_yield: Decimal,
    /// Same income relative to deployed capital (spot notional + perp margin)
    pub yield_on_capital: Decimal,
    pub yield_basis: YieldBasis,
    /// Perp minus spot
    pub basis: Decimal,
    pub basis_ratio: Decimal,
    /// 1 for a snapshot observed now, falling to 0 at the staleness limit
    pub confidence: Decimal,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NoSignalReason {
    Stale { age_secs: i64, max_age_secs: u64 },
    BelowThreshold { funding_rate: Decimal, threshold: Decimal },
}

impl fmt::Display for NoSignalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoSignalReason::Stale { age_secs, max_age_secs } => {
                write!(f, "snapshot {}s old (max {}s)", age_secs, max_age_secs)
            }
            NoSignalReason::BelowThreshold { funding_rate, threshold } => {
                write!(f, "|{}| below threshold {}", funding_rate, threshold)
            }
        }
    }
}

/// Result of evaluating one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Opportunity(OpportunityScore),
    NoSignal(NoSignalReason),
}

/// Opportunity refused by an entry filter before reaching the risk gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum EntryRejection {
    BasisOutOfTolerance { basis_ratio: Decimal, tolerance: Decimal },
    Unprofitable { expected_funding: Decimal, round_trip_fees: Decimal },
    BelowMinNotional { notional: Decimal, min_notional: Decimal },
}

impl fmt::Display for EntryRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryRejection::BasisOutOfTolerance { basis_ratio, tolerance } => write!(
                f,
                "basis {}bp outside tolerance {}bp",
                to_basis_points(*basis_ratio).round_dp(2),
                to_basis_points(*tolerance).round_dp(2)
            ),
            EntryRejection::Unprofitable { expected_funding, round_trip_fees } => write!(
                f,
                "expected funding {} does not cover fees {}",
                expected_funding, round_trip_fees
            ),
            EntryRejection::BelowMinNotional { notional, min_notional } => {
                write!(f, "notional {} below minimum {}", notional, min_notional)
            }
        }
    }
}

/// Position size for an approved opportunity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sizing {
    pub quantity: Decimal,
    pub notional: Decimal,
}

/// Turns funding snapshots into opportunity scores.
#[derive(Debug, Clone)]
pub struct SignalEvaluator {
    config: SignalConfig,
    leverage: u8,
    spot_fee_rate: Decimal,
    perp_fee_rate: Decimal,
}

impl SignalEvaluator {
    pub fn new(config: SignalConfig, execution: &ExecutionConfig) -> Self {
        Self {
            config,
            leverage: execution.leverage,
            spot_fee_rate: execution.spot_fee_rate,
            perp_fee_rate: execution.perp_fee_rate,
        }
    }

    /// Entry threshold for a pair, honouring its override.
    pub fn threshold(&self, pair: &TradingPair) -> Decimal {
        pair.min_funding_rate.unwrap_or(self.config.min_funding_rate)
    }

    /// True when the snapshot is no older than the configured maximum age.
    pub fn is_fresh(&self, snapshot: &FundingSnapshot, now: DateTime<Utc>) -> bool {
        (now - snapshot.observed_at).num_seconds() <= self.config.max_snapshot_age_secs as i64
    }

    /// Exactly one score for a fresh snapshot at or above threshold, otherwise no signal.
    pub fn evaluate(&self, pair: &TradingPair, snapshot: &FundingSnapshot, now: DateTime<Utc>) -> SignalOutcome {
        let age_secs = (now - snapshot.observed_at).num_seconds();
        let max_age = self.config.max_snapshot_age_secs;
        if age_secs > max_age as i64 {
            return SignalOutcome::NoSignal(NoSignalReason::Stale {
                age_secs,
                max_age_secs: max_age,
            });
        }

        let threshold = self.threshold(pair);
        let rate = snapshot.funding_rate;
        let direction = match Direction::receiving(rate) {
            Some(d) if rate.abs() >= threshold => d,
            _ => {
                return SignalOutcome::NoSignal(NoSignalReason::BelowThreshold {
                    funding_rate: rate,
                    threshold,
                })
            }
        };

        let notional = pair.target_notional;
        let per_period = rate.abs() * notional;
        let expected_periodic_yield = match self.config.yield_basis {
            YieldBasis::PerPeriod => per_period,
            YieldBasis::Annualized => per_period * self.periods_per_year(),
        };
        let capital = notional + safe_div(notional, Decimal::from(self.leverage.max(1)));

        let fresh_secs = age_secs.max(0);
        let confidence = (Decimal::ONE - safe_div(Decimal::from(fresh_secs), Decimal::from(max_age)))
            .max(Decimal::ZERO);

        SignalOutcome::Opportunity(OpportunityScore {
            pair: pair.symbol.clone(),
            direction,
            funding_rate: rate,
            expected_periodic_yield,
            yield_on_capital: safe_div(expected_periodic_yield, capital),
            yield_basis: self.config.yield_basis,
            basis: snapshot.basis(),
            basis_ratio: snapshot.basis_ratio(),
            confidence,
            observed_at: snapshot.observed_at,
        })
    }

    /// Entry filters applied after a signal: basis tolerance, then fee break-even.
    pub fn check_entry(
        &self,
        pair: &TradingPair,
        score: &OpportunityScore,
        notional: Decimal,
    ) -> Result<(), EntryRejection> {
        let tolerance = pair.basis_tolerance.unwrap_or(self.config.basis_tolerance);
        if score.basis_ratio.abs() > tolerance {
            return Err(EntryRejection::BasisOutOfTolerance {
                basis_ratio: score.basis_ratio,
                tolerance,
            });
        }

        let expected_funding =
            score.funding_rate.abs() * notional * Decimal::from(self.config.breakeven_periods);
        let round_trip_fees = notional * (self.spot_fee_rate + self.perp_fee_rate) * Decimal::TWO;
        if expected_funding <= round_trip_fees {
            return Err(EntryRejection::Unprofitable {
                expected_funding,
                round_trip_fees,
            });
        }

        Ok(())
    }

    fn periods_per_year(&self) -> Decimal {
        let per_day = safe_div(Decimal::from(24), Decimal::from(self.config.funding_interval_hours));
        per_day * Decimal::from(365)
    }
}

/// Size a new position: the pair target, capped by a share of free balance,
/// rounded down to the lot size.
pub fn size_position(
    pair: &TradingPair,
    spot_price: Decimal,
    free_balance: Decimal,
    execution: &ExecutionConfig,
) -> Result<Sizing, EntryRejection> {
    let budget = pair
        .target_notional
        .min(free_balance * execution.max_balance_fraction);
    let quantity = round_down_to_lot(safe_div(budget, spot_price), pair.lot_size);
    let notional = quantity * spot_price;

    if quantity.is_zero() || notional < execution.min_notional {
        return Err(EntryRejection::BelowMinNotional {
            notional,
            min_notional: execution.min_notional,
        });
    }

    Ok(Sizing { quantity, notional })
}
