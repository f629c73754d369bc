//! Hedged position model: legs, direction, lifecycle state and P&L.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::exchange::{Market, OrderHandle, OrderSide};
use crate::utils::{blended_price, relative_mismatch};

/// Position lifecycle.
///
/// `Opening -> Open -> Closing -> Closed`, with side exits
/// `Opening -> Failed` and `Opening/Open/Closing -> NeedsManualIntervention`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Opening,
    Open,
    Closing,
    Closed,
    Failed,
    NeedsManualIntervention,
}

impl PositionState {
    /// Closed and Failed positions leave the working set once flushed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Closed | PositionState::Failed)
    }

    /// Counts against the one-position-per-pair rule and risk limits.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: PositionState) -> bool {
        use PositionState::*;
        matches!(
            (self, next),
            (Opening, Open)
                | (Opening, Failed)
                | (Opening, NeedsManualIntervention)
                | (Open, Closing)
                | (Open, NeedsManualIntervention)
                | (Closing, Closed)
                | (Closing, NeedsManualIntervention)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Opening => "OPENING",
            PositionState::Open => "OPEN",
            PositionState::Closing => "CLOSING",
            PositionState::Closed => "CLOSED",
            PositionState::Failed => "FAILED",
            PositionState::NeedsManualIntervention => "NEEDS_MANUAL_INTERVENTION",
        }
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the hedge is short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Positive funding: longs pay shorts
    LongSpotShortPerp,
    /// Negative funding: shorts pay longs
    ShortSpotLongPerp,
}

impl Direction {
    /// Direction that receives funding at this rate. Zero pays nobody.
    pub fn receiving(funding_rate: Decimal) -> Option<Self> {
        if funding_rate > Decimal::ZERO {
            Some(Direction::LongSpotShortPerp)
        } else if funding_rate < Decimal::ZERO {
            Some(Direction::ShortSpotLongPerp)
        } else {
            None
        }
    }

    /// Entry order side for one market.
    pub fn entry_side(&self, market: Market) -> OrderSide {
        match (self, market) {
            (Direction::LongSpotShortPerp, Market::Spot) => OrderSide::Buy,
            (Direction::LongSpotShortPerp, Market::Perp) => OrderSide::Sell,
            (Direction::ShortSpotLongPerp, Market::Spot) => OrderSide::Sell,
            (Direction::ShortSpotLongPerp, Market::Perp) => OrderSide::Buy,
        }
    }

    /// Funding received for one settlement (negative when paying).
    pub fn funding_income(&self, funding_rate: Decimal, perp_qty: Decimal, mark_price: Decimal) -> Decimal {
        let payment = funding_rate * perp_qty * mark_price;
        match self {
            Direction::LongSpotShortPerp => payment,
            Direction::ShortSpotLongPerp => -payment,
        }
    }

    /// True when holding this direction is paid at the given rate.
    pub fn is_paid_by(&self, funding_rate: Decimal) -> bool {
        Direction::receiving(funding_rate) == Some(*self)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LongSpotShortPerp => write!(f, "LONG_SPOT_SHORT_PERP"),
            Direction::ShortSpotLongPerp => write!(f, "SHORT_SPOT_LONG_PERP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LegStatus {
    Pending,
    Filled,
    Partial,
    Failed,
}

/// Addresses one of the four legs a position may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegSlot {
    Entry(Market),
    Exit(Market),
}

impl fmt::Display for LegSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegSlot::Entry(m) => write!(f, "entry-{}", m),
            LegSlot::Exit(m) => write!(f, "exit-{}", m),
        }
    }
}

/// Terminal outcome of one order on a leg.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegFill {
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
    pub status: LegStatus,
}

/// One side of a hedged position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub market: Market,
    pub instrument: String,
    pub side: OrderSide,
    /// Quantity the leg is meant to reach
    pub quantity: Decimal,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub fee: Decimal,
    pub order_ids: Vec<String>,
    /// Order placed but not yet confirmed terminal
    pub pending_order: Option<OrderHandle>,
    pub status: LegStatus,
}

impl Leg {
    pub fn new(market: Market, instrument: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            market,
            instrument: instrument.to_string(),
            side,
            quantity,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            fee: Decimal::ZERO,
            order_ids: Vec::new(),
            pending_order: None,
            status: LegStatus::Pending,
        }
    }

    /// Quantity still to fill.
    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled_qty).max(Decimal::ZERO)
    }

    /// Filled quantity signed by side (positive = long).
    pub fn signed_filled(&self) -> Decimal {
        match self.side {
            OrderSide::Buy => self.filled_qty,
            OrderSide::Sell => -self.filled_qty,
        }
    }

    pub(crate) fn record_order(&mut self, handle: OrderHandle) {
        self.order_ids.push(handle.order_id.clone());
        self.pending_order = Some(handle);
    }

    pub(crate) fn apply_fill(&mut self, fill: LegFill) {
        if fill.filled_qty > Decimal::ZERO {
            self.avg_fill_price =
                blended_price(self.filled_qty, self.avg_fill_price, fill.filled_qty, fill.avg_price);
            self.filled_qty += fill.filled_qty;
        }
        self.fee += fill.fee;
        self.pending_order = None;
        self.status = fill.status;
    }
}

/// A hedged spot/perp position owned by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub pair: String,
    pub direction: Direction,
    pub state: PositionState,
    pub spot_leg: Leg,
    pub perp_leg: Leg,
    /// Unwind legs, present once a close or failed-open unwind begins
    pub exit_spot_leg: Option<Leg>,
    pub exit_perp_leg: Option<Leg>,
    pub entry_time: DateTime<Utc>,
    pub entry_basis: Decimal,
    pub entry_funding_rate: Decimal,
    pub notional: Decimal,
    pub leverage: u8,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub funding_accrued: Decimal,
    pub last_funding_rate: Decimal,
    pub last_funding_accrued: Option<DateTime<Utc>>,
    /// Next settlement this position is entitled to
    pub next_funding_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub manual_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn leg(&self, slot: LegSlot) -> Option<&Leg> {
        match slot {
            LegSlot::Entry(Market::Spot) => Some(&self.spot_leg),
            LegSlot::Entry(Market::Perp) => Some(&self.perp_leg),
            LegSlot::Exit(Market::Spot) => self.exit_spot_leg.as_ref(),
            LegSlot::Exit(Market::Perp) => self.exit_perp_leg.as_ref(),
        }
    }

    pub(crate) fn leg_mut(&mut self, slot: LegSlot) -> Option<&mut Leg> {
        match slot {
            LegSlot::Entry(Market::Spot) => Some(&mut self.spot_leg),
            LegSlot::Entry(Market::Perp) => Some(&mut self.perp_leg),
            LegSlot::Exit(Market::Spot) => self.exit_spot_leg.as_mut(),
            LegSlot::Exit(Market::Perp) => self.exit_perp_leg.as_mut(),
        }
    }

    pub fn entry_leg(&self, market: Market) -> &Leg {
        match market {
            Market::Spot => &self.spot_leg,
            Market::Perp => &self.perp_leg,
        }
    }

    pub fn has_exit_legs(&self) -> bool {
        self.exit_spot_leg.is_some() || self.exit_perp_leg.is_some()
    }

    /// Both entry legs filled with quantities within tolerance.
    pub fn is_hedge_consistent(&self, tolerance: Decimal) -> bool {
        self.spot_leg.status == LegStatus::Filled
            && self.perp_leg.status == LegStatus::Filled
            && relative_mismatch(self.spot_leg.filled_qty, self.perp_leg.filled_qty) <= tolerance
    }

    /// Exposure still held on one market after any unwind fills.
    pub fn net_quantity(&self, market: Market) -> Decimal {
        let entry = self.entry_leg(market).signed_filled();
        let exit = self
            .leg(LegSlot::Exit(market))
            .map(Leg::signed_filled)
            .unwrap_or_default();
        entry + exit
    }

    pub fn total_fees(&self) -> Decimal {
        let exit_fees: Decimal = [&self.exit_spot_leg, &self.exit_perp_leg]
            .iter()
            .filter_map(|l| l.as_ref())
            .map(|l| l.fee)
            .sum();
        self.spot_leg.fee + self.perp_leg.fee + exit_fees
    }

    /// Price P&L of the entry legs marked at the given prices.
    pub fn basis_pnl(&self, spot_price: Decimal, mark_price: Decimal) -> Decimal {
        let spot = self.net_quantity(Market::Spot) * (spot_price - self.spot_leg.avg_fill_price);
        let perp = self.net_quantity(Market::Perp) * (mark_price - self.perp_leg.avg_fill_price);
        spot + perp
    }

    /// Price P&L booked by unwind fills.
    pub fn exit_price_pnl(&self) -> Decimal {
        [Market::Spot, Market::Perp]
            .iter()
            .filter_map(|&m| {
                let exit = self.leg(LegSlot::Exit(m))?;
                let entry = self.entry_leg(m);
                // Unwinding a long gains exit - entry; a short gains entry - exit
                Some(-exit.signed_filled() * (exit.avg_fill_price - entry.avg_fill_price))
            })
            .sum()
    }

    /// Realized result of everything unwound so far.
    pub fn settled_pnl(&self) -> Decimal {
        self.exit_price_pnl() + self.funding_accrued - self.total_fees()
    }

    /// Unrealized plus accrued funding net of fees paid.
    pub fn open_pnl(&self) -> Decimal {
        self.unrealized_pnl + self.funding_accrued - self.total_fees()
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_hours()
    }
}
