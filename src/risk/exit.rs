//! Exit-condition evaluation for open positions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

use crate::config::{RiskConfig, SignalConfig};
use crate::exchange::FundingSnapshot;
use crate::ledger::Position;

/// Why a position is being closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum ExitReason {
    FundingFlipped { funding_rate: Decimal },
    FundingBelowHold { funding_rate: Decimal, min_hold_rate: Decimal },
    BasisStopLoss { loss: Decimal, limit: Decimal },
    ForceCloseAll,
    MaxHoldingTime { hours: i64 },
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::FundingFlipped { funding_rate } => {
                write!(f, "funding rate flipped to {}", funding_rate)
            }
            ExitReason::FundingBelowHold { funding_rate, min_hold_rate } => {
                write!(f, "funding rate {} below hold threshold {}", funding_rate, min_hold_rate)
            }
            ExitReason::BasisStopLoss { loss, limit } => {
                write!(f, "basis loss {} exceeds stop {}", loss, limit)
            }
            ExitReason::ForceCloseAll => write!(f, "force close all"),
            ExitReason::MaxHoldingTime { hours } => write!(f, "held {}h", hours),
            ExitReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Decides whether an OPEN position should start closing.
#[derive(Debug, Clone)]
pub struct ExitEvaluator {
    min_hold_rate: Decimal,
    max_snapshot_age_secs: u64,
    basis_stop_loss: Decimal,
    max_holding_hours: u32,
}

impl ExitEvaluator {
    pub fn new(signal: &SignalConfig, risk: &RiskConfig) -> Self {
        Self {
            min_hold_rate: signal.min_hold_rate,
            max_snapshot_age_secs: signal.max_snapshot_age_secs,
            basis_stop_loss: risk.basis_stop_loss,
            max_holding_hours: risk.max_holding_hours,
        }
    }

    /// First exit condition that holds, if any.
    ///
    /// Missing or stale snapshots only skip the market-driven checks;
    /// force-close and holding time still apply.
    pub fn evaluate(
        &self,
        position: &Position,
        snapshot: Option<&FundingSnapshot>,
        force_close_all: bool,
        now: DateTime<Utc>,
    ) -> Option<ExitReason> {
        if force_close_all {
            return Some(ExitReason::ForceCloseAll);
        }

        let hours = position.age_hours(now);
        if self.max_holding_hours > 0 && hours >= i64::from(self.max_holding_hours) {
            return Some(ExitReason::MaxHoldingTime { hours });
        }

        let snapshot = snapshot.filter(|s| self.is_fresh(s, now))?;
        let rate = snapshot.funding_rate;

        if !rate.is_zero() && !position.direction.is_paid_by(rate) {
            return Some(ExitReason::FundingFlipped { funding_rate: rate });
        }
        if rate.abs() < self.min_hold_rate {
            return Some(ExitReason::FundingBelowHold {
                funding_rate: rate,
                min_hold_rate: self.min_hold_rate,
            });
        }

        let limit = self.basis_stop_loss * position.notional;
        let basis_pnl = position.basis_pnl(snapshot.spot_price, snapshot.mark_price);
        if -basis_pnl > limit {
            return Some(ExitReason::BasisStopLoss {
                loss: -basis_pnl,
                limit,
            });
        }

        None
    }

    fn is_fresh(&self, snapshot: &FundingSnapshot, now: DateTime<Utc>) -> bool {
        (now - snapshot.observed_at).num_seconds() <= self.max_snapshot_age_secs as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Market, OrderSide};
    use crate::ledger::{Direction, Leg, LegStatus, PositionState};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn leg(market: Market, side: OrderSide, price: Decimal) -> Leg {
        let mut leg = Leg::new(market, "BTCUSDT", side, dec!(10));
        leg.filled_qty = dec!(10);
        leg.avg_fill_price = price;
        leg.status = LegStatus::Filled;
        leg
    }

    fn position(now: DateTime<Utc>) -> Position {
        Position {
            position_id: "BTCUSDT-1".into(),
            pair: "BTCUSDT".into(),
            direction: Direction::LongSpotShortPerp,
            state: PositionState::Open,
            spot_leg: leg(Market::Spot, OrderSide::Buy, dec!(100)),
            perp_leg: leg(Market::Perp, OrderSide::Sell, dec!(100.2)),
            exit_spot_leg: None,
            exit_perp_leg: None,
            entry_time: now - Duration::hours(1),
            entry_basis: dec!(0.2),
            entry_funding_rate: dec!(0.0015),
            notional: dec!(1000),
            leverage: 3,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            funding_accrued: Decimal::ZERO,
            last_funding_rate: dec!(0.0015),
            last_funding_accrued: None,
            next_funding_time: now,
            close_time: None,
            exit_reason: None,
            manual_reason: None,
            updated_at: now,
        }
    }

    fn snapshot(now: DateTime<Utc>, rate: Decimal, spot: Decimal, mark: Decimal) -> FundingSnapshot {
        FundingSnapshot {
            pair: "BTCUSDT".into(),
            funding_rate: rate,
            next_funding_time: now,
            mark_price: mark,
            spot_price: spot,
            observed_at: now,
        }
    }

    fn evaluator() -> ExitEvaluator {
        ExitEvaluator::new(&SignalConfig::default(), &RiskConfig::default())
    }

    #[test]
    fn test_holds_while_funding_pays() {
        let now = Utc::now();
        let snap = snapshot(now, dec!(0.001), dec!(100), dec!(100.2));
        assert_eq!(evaluator().evaluate(&position(now), Some(&snap), false, now), None);
    }

    #[test]
    fn test_sign_flip_exits() {
        let now = Utc::now();
        let snap = snapshot(now, dec!(-0.0002), dec!(100), dec!(100.2));
        assert_eq!(
            evaluator().evaluate(&position(now), Some(&snap), false, now),
            Some(ExitReason::FundingFlipped { funding_rate: dec!(-0.0002) })
        );
    }

    #[test]
    fn test_below_hold_threshold_exits() {
        let now = Utc::now();
        let snap = snapshot(now, dec!(0.00005), dec!(100), dec!(100.2));
        assert!(matches!(
            evaluator().evaluate(&position(now), Some(&snap), false, now),
            Some(ExitReason::FundingBelowHold { .. })
        ));
    }

    #[test]
    fn test_basis_stop_loss() {
        let now = Utc::now();
        // Perp +3 against the short: -30 > 20 (2% of 1000)
        let snap = snapshot(now, dec!(0.001), dec!(100), dec!(103.2));
        assert_eq!(
            evaluator().evaluate(&position(now), Some(&snap), false, now),
            Some(ExitReason::BasisStopLoss { loss: dec!(30), limit: dec!(20) })
        );
    }

    #[test]
    fn test_force_close_ignores_signal() {
        let now = Utc::now();
        let snap = snapshot(now, dec!(0.002), dec!(100), dec!(100.2));
        assert_eq!(
            evaluator().evaluate(&position(now), Some(&snap), true, now),
            Some(ExitReason::ForceCloseAll)
        );
    }

    #[test]
    fn test_stale_snapshot_skips_market_checks() {
        let now = Utc::now();
        let mut snap = snapshot(now, dec!(-0.01), dec!(100), dec!(150));
        snap.observed_at = now - Duration::seconds(120);
        assert_eq!(evaluator().evaluate(&position(now), Some(&snap), false, now), None);
    }

    #[test]
    fn test_max_holding_time() {
        let now = Utc::now();
        let mut pos = position(now);
        pos.entry_time = now - Duration::hours(73);
        assert_eq!(
            evaluator().evaluate(&pos, None, false, now),
            Some(ExitReason::MaxHoldingTime { hours: 73 })
        );
    }
}
