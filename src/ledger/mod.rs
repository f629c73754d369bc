//! Position ledger: the single owner of every hedged position.
//!
//! Every accepted mutation is flushed to the state store before the call
//! returns. When a flush fails the in-memory change is kept, the position is
//! blocked, and further mutations on it retry the flush first.

mod position;

pub use position::*;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::exchange::{FundingSnapshot, Market, OrderHandle, TradingPair};
use crate::persistence::{DailyEntries, PersistedSnapshot, StateStore, SNAPSHOT_VERSION};
use crate::risk::RiskState;

/// Parameters of a new position.
#[derive(Debug, Clone)]
pub struct OpenRequest<'a> {
    pub pair: &'a TradingPair,
    pub direction: Direction,
    pub quantity: Decimal,
    pub notional: Decimal,
    pub leverage: u8,
    pub snapshot: &'a FundingSnapshot,
}

/// Authoritative record of positions, flushed on every transition.
pub struct PositionLedger<S: StateStore> {
    store: S,
    /// Working set, keyed by position id
    positions: BTreeMap<String, Position>,
    cumulative_realized_pnl: Decimal,
    pnl_high_water: Decimal,
    sequence: u64,
    daily_entries: DailyEntries,
    /// Positions whose last change is not yet durable
    blocked: HashSet<String>,
}

impl<S: StateStore> PositionLedger<S> {
    /// Restore the ledger from the store's last snapshot.
    pub fn load(store: S) -> Result<Self> {
        let mut ledger = Self {
            store,
            positions: BTreeMap::new(),
            cumulative_realized_pnl: Decimal::ZERO,
            pnl_high_water: Decimal::ZERO,
            sequence: 0,
            daily_entries: DailyEntries::default(),
            blocked: HashSet::new(),
        };

        if let Some(snapshot) = ledger.store.load()? {
            ledger.sequence = snapshot.sequence;
            ledger.cumulative_realized_pnl = snapshot.cumulative_realized_pnl;
            ledger.pnl_high_water = snapshot.pnl_high_water;
            ledger.daily_entries = snapshot.daily_entries;
            for pos in snapshot.positions {
                ledger.positions.insert(pos.position_id.clone(), pos);
            }
            info!(
                sequence = ledger.sequence,
                positions = ledger.positions.len(),
                realized_pnl = %ledger.cumulative_realized_pnl,
                "Ledger restored"
            );
        }

        Ok(ledger)
    }

    // ==================== Queries ====================

    pub fn get(&self, position_id: &str) -> Option<&Position> {
        self.positions.get(position_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Positions not yet Closed or Failed.
    pub fn active_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| p.state.is_active())
    }

    pub fn positions_in(&self, state: PositionState) -> Vec<Position> {
        self.positions
            .values()
            .filter(|p| p.state == state)
            .cloned()
            .collect()
    }

    /// The active position on a pair, if any.
    pub fn active_for_pair(&self, pair: &str) -> Option<&Position> {
        self.active_positions().find(|p| p.pair == pair)
    }

    pub fn cumulative_realized_pnl(&self) -> Decimal {
        self.cumulative_realized_pnl
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_blocked(&self, position_id: &str) -> bool {
        self.blocked.contains(position_id)
    }

    pub fn has_unflushed_changes(&self) -> bool {
        !self.blocked.is_empty()
    }

    /// Realized plus open P&L across the working set.
    pub fn total_pnl(&self) -> Decimal {
        self.cumulative_realized_pnl + self.active_positions().map(Position::open_pnl).sum::<Decimal>()
    }

    /// Positions opened on the UTC day of `now`.
    pub fn entries_on(&self, now: DateTime<Utc>) -> u32 {
        self.daily_entries.on(now.date_naive())
    }

    /// Exposure, drawdown and entry-count figures for the risk gate.
    pub fn risk_state(&self, capital_baseline: Decimal, now: DateTime<Utc>) -> RiskState {
        let mut per_pair: HashMap<String, Decimal> = HashMap::new();
        let mut total = Decimal::ZERO;
        let mut count = 0u32;

        for pos in self.active_positions() {
            *per_pair.entry(pos.pair.clone()).or_default() += pos.notional;
            total += pos.notional;
            count += 1;
        }

        let decline = (self.pnl_high_water - self.total_pnl()).max(Decimal::ZERO);

        RiskState {
            total_notional_exposure: total,
            open_position_count: count,
            running_drawdown: crate::utils::safe_div(decline, capital_baseline),
            per_pair_exposure: per_pair,
            entries_today: self.entries_on(now),
        }
    }

    /// Durable image of the working set.
    pub fn snapshot(&self, now: DateTime<Utc>) -> PersistedSnapshot {
        PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            sequence: self.sequence,
            cumulative_realized_pnl: self.cumulative_realized_pnl,
            pnl_high_water: self.pnl_high_water,
            daily_entries: self.daily_entries,
            positions: self.active_positions().cloned().collect(),
            saved_at: now,
        }
    }

    // ==================== Transitions ====================

    /// Create an OPENING position. Fails if the pair already has an active one.
    pub fn begin_open(&mut self, request: OpenRequest<'_>, now: DateTime<Utc>) -> Result<String> {
        let pair = request.pair;
        if let Some(existing) = self.active_for_pair(&pair.symbol) {
            return Err(EngineError::DuplicatePosition {
                pair: pair.symbol.clone(),
                position_id: existing.position_id.clone(),
            });
        }

        let position_id = format!("{}-{}", pair.symbol, self.sequence + 1);
        let leg = |market: Market| {
            Leg::new(
                market,
                pair.instrument(market),
                request.direction.entry_side(market),
                request.quantity,
            )
        };

        let position = Position {
            position_id: position_id.clone(),
            pair: pair.symbol.clone(),
            direction: request.direction,
            state: PositionState::Opening,
            spot_leg: leg(Market::Spot),
            perp_leg: leg(Market::Perp),
            exit_spot_leg: None,
            exit_perp_leg: None,
            entry_time: now,
            entry_basis: request.snapshot.basis(),
            entry_funding_rate: request.snapshot.funding_rate,
            notional: request.notional,
            leverage: request.leverage,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            funding_accrued: Decimal::ZERO,
            last_funding_rate: request.snapshot.funding_rate,
            last_funding_accrued: None,
            next_funding_time: request.snapshot.next_funding_time,
            close_time: None,
            exit_reason: None,
            manual_reason: None,
            updated_at: now,
        };

        info!(
            %position_id,
            direction = %request.direction,
            quantity = %request.quantity,
            notional = %request.notional,
            "Position opening"
        );
        self.positions.insert(position_id.clone(), position);
        let entries_before = self.daily_entries;
        self.daily_entries.record(now.date_naive());
        if let Err(e) = self.commit(&position_id, now) {
            // Nothing was sent to the exchange yet, so the position can be dropped
            self.positions.remove(&position_id);
            self.blocked.remove(&position_id);
            self.daily_entries = entries_before;
            return Err(e);
        }
        Ok(position_id)
    }

    /// Remember an order placed on a leg before its outcome is known.
    pub fn record_leg_order(
        &mut self,
        position_id: &str,
        slot: LegSlot,
        handle: OrderHandle,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_writable(position_id, now)?;
        let leg = self.leg_mut(position_id, slot)?;
        debug!(%position_id, %slot, order_id = %handle.order_id, "Leg order recorded");
        leg.record_order(handle);
        self.touch(position_id, now);
        self.commit(position_id, now)
    }

    /// Apply the terminal outcome of a leg's pending order.
    pub fn record_leg_fill(
        &mut self,
        position_id: &str,
        slot: LegSlot,
        fill: LegFill,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_writable(position_id, now)?;
        let leg = self.leg_mut(position_id, slot)?;
        leg.apply_fill(fill);
        debug!(
            %position_id,
            %slot,
            filled = %leg.filled_qty,
            avg_price = %leg.avg_fill_price,
            status = ?leg.status,
            "Leg fill recorded"
        );
        self.touch(position_id, now);
        self.commit(position_id, now)
    }

    /// OPENING -> OPEN once both legs are filled and hedge-consistent.
    pub fn mark_open(&mut self, position_id: &str, hedge_tolerance: Decimal, now: DateTime<Utc>) -> Result<()> {
        self.ensure_writable(position_id, now)?;
        let pos = self.position(position_id)?;
        Self::check_transition(pos, PositionState::Open)?;
        if !pos.is_hedge_consistent(hedge_tolerance) {
            return Err(EngineError::HedgeMismatch {
                position_id: position_id.to_string(),
                spot_qty: pos.spot_leg.filled_qty,
                perp_qty: pos.perp_leg.filled_qty,
            });
        }

        let pos = self.position_mut(position_id)?;
        pos.state = PositionState::Open;
        pos.notional = pos.spot_leg.filled_qty * pos.spot_leg.avg_fill_price;
        pos.entry_basis = pos.perp_leg.avg_fill_price - pos.spot_leg.avg_fill_price;
        pos.updated_at = now;
        info!(
            %position_id,
            spot_qty = %pos.spot_leg.filled_qty,
            perp_qty = %pos.perp_leg.filled_qty,
            notional = %pos.notional,
            "Position open"
        );
        self.commit(position_id, now)
    }

    /// Create unwind legs for whatever is still held, without changing state.
    pub fn begin_unwind(&mut self, position_id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure_writable(position_id, now)?;
        let pos = self.position_mut(position_id)?;
        if pos.exit_reason.is_none() {
            pos.exit_reason = Some(reason.to_string());
        }
        Self::prepare_exit_legs(pos);
        pos.updated_at = now;
        self.commit(position_id, now)
    }

    /// OPENING -> FAILED. Books whatever P&L the unwind produced.
    pub fn mark_failed(&mut self, position_id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure_writable(position_id, now)?;
        let pos = self.position_mut(position_id)?;
        Self::check_transition(pos, PositionState::Failed)?;

        pos.state = PositionState::Failed;
        pos.realized_pnl = pos.settled_pnl();
        pos.unrealized_pnl = Decimal::ZERO;
        pos.close_time = Some(now);
        pos.exit_reason = Some(reason.to_string());
        pos.updated_at = now;
        let realized = pos.realized_pnl;
        self.cumulative_realized_pnl += realized;

        warn!(%position_id, %reason, %realized, "Position failed");
        self.commit(position_id, now)
    }

    /// OPEN -> CLOSING with unwind legs sized to the held quantities.
    pub fn begin_close(&mut self, position_id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure_writable(position_id, now)?;
        let pos = self.position_mut(position_id)?;
        Self::check_transition(pos, PositionState::Closing)?;

        pos.state = PositionState::Closing;
        pos.exit_reason = Some(reason.to_string());
        Self::prepare_exit_legs(pos);
        pos.updated_at = now;

        info!(%position_id, %reason, "Position closing");
        self.commit(position_id, now)
    }

    /// CLOSING -> CLOSED once both unwind legs are filled.
    pub fn mark_closed(&mut self, position_id: &str, now: DateTime<Utc>) -> Result<Decimal> {
        self.ensure_writable(position_id, now)?;
        let pos = self.position_mut(position_id)?;
        Self::check_transition(pos, PositionState::Closed)?;

        let unwound = [Market::Spot, Market::Perp]
            .iter()
            .all(|&m| pos.net_quantity(m).is_zero());
        if !unwound {
            return Err(EngineError::HedgeMismatch {
                position_id: position_id.to_string(),
                spot_qty: pos.net_quantity(Market::Spot),
                perp_qty: pos.net_quantity(Market::Perp),
            });
        }

        pos.state = PositionState::Closed;
        pos.realized_pnl = pos.settled_pnl();
        pos.unrealized_pnl = Decimal::ZERO;
        pos.close_time = Some(now);
        pos.updated_at = now;
        let realized = pos.realized_pnl;
        info!(
            %position_id,
            %realized,
            funding = %pos.funding_accrued,
            fees = %pos.total_fees(),
            "Position closed"
        );

        self.cumulative_realized_pnl += realized;
        self.commit(position_id, now)?;
        Ok(realized)
    }

    /// Hand a position to an operator. No further automated action follows.
    pub fn escalate(&mut self, position_id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        // Escalation must stick even if an earlier flush is outstanding
        let pos = self.position_mut(position_id)?;
        Self::check_transition(pos, PositionState::NeedsManualIntervention)?;

        pos.state = PositionState::NeedsManualIntervention;
        pos.manual_reason = Some(reason.to_string());
        pos.updated_at = now;

        error!(%position_id, %reason, "Position needs manual intervention");
        self.commit(position_id, now)
    }

    /// Book a funding settlement on an OPEN position.
    pub fn record_funding(
        &mut self,
        position_id: &str,
        amount: Decimal,
        funding_rate: Decimal,
        next_funding_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_writable(position_id, now)?;
        let pos = self.position_mut(position_id)?;
        if pos.state != PositionState::Open {
            return Err(EngineError::IllegalTransition {
                position_id: position_id.to_string(),
                from: pos.state,
                to: PositionState::Open,
            });
        }

        pos.funding_accrued += amount;
        pos.last_funding_rate = funding_rate;
        pos.last_funding_accrued = Some(now);
        pos.next_funding_time = next_funding_time;
        pos.updated_at = now;

        info!(%position_id, %amount, total = %pos.funding_accrued, "Funding accrued");
        self.update_high_water();
        self.commit(position_id, now)
    }

    /// Refresh unrealized P&L from fresh prices. Not flushed on its own.
    pub fn mark_to_market(
        &mut self,
        position_id: &str,
        snapshot: &FundingSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Decimal> {
        let pos = self.position_mut(position_id)?;
        pos.unrealized_pnl = pos.basis_pnl(snapshot.spot_price, snapshot.mark_price);
        pos.last_funding_rate = snapshot.funding_rate;
        pos.updated_at = now;
        let unrealized = pos.unrealized_pnl;
        self.update_high_water();
        Ok(unrealized)
    }

    /// Retry persisting outstanding changes.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.write_snapshot(now).map_err(|e| {
            error!(error = %e, "Ledger flush failed");
            EngineError::PersistenceFailure(e)
        })
    }

    // ==================== Internals ====================

    fn position(&self, position_id: &str) -> Result<&Position> {
        self.positions
            .get(position_id)
            .ok_or_else(|| EngineError::UnknownPosition(position_id.to_string()))
    }

    fn position_mut(&mut self, position_id: &str) -> Result<&mut Position> {
        self.positions
            .get_mut(position_id)
            .ok_or_else(|| EngineError::UnknownPosition(position_id.to_string()))
    }

    fn leg_mut(&mut self, position_id: &str, slot: LegSlot) -> Result<&mut Leg> {
        let pos = self.position_mut(position_id)?;
        if pos.state.is_terminal() {
            return Err(EngineError::IllegalTransition {
                position_id: position_id.to_string(),
                from: pos.state,
                to: pos.state,
            });
        }
        pos.leg_mut(slot).ok_or_else(|| EngineError::PartialHedgeFailure {
            position_id: position_id.to_string(),
            reason: format!("no {} leg", slot),
        })
    }

    fn touch(&mut self, position_id: &str, now: DateTime<Utc>) {
        if let Some(pos) = self.positions.get_mut(position_id) {
            pos.updated_at = now;
        }
    }

    fn check_transition(pos: &Position, to: PositionState) -> Result<()> {
        if pos.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(EngineError::IllegalTransition {
                position_id: pos.position_id.clone(),
                from: pos.state,
                to,
            })
        }
    }

    fn prepare_exit_legs(pos: &mut Position) {
        for market in [Market::Spot, Market::Perp] {
            let held = pos.net_quantity(market);
            let slot = match market {
                Market::Spot => &mut pos.exit_spot_leg,
                Market::Perp => &mut pos.exit_perp_leg,
            };
            // Existing unwind legs keep their fills; only the target moves
            if let Some(leg) = slot.as_mut() {
                leg.quantity = leg.filled_qty + held.abs();
                continue;
            }
            if held.is_zero() {
                continue;
            }
            let entry = match market {
                Market::Spot => &pos.spot_leg,
                Market::Perp => &pos.perp_leg,
            };
            *slot = Some(Leg::new(market, &entry.instrument, entry.side.opposite(), held.abs()));
        }
    }

    fn update_high_water(&mut self) {
        let pnl = self.total_pnl();
        if pnl > self.pnl_high_water {
            self.pnl_high_water = pnl;
        }
    }

    /// Refuse to mutate a blocked position unless a retried flush succeeds.
    /// Retry the flush of a blocked position. Fails with `FlushPending` while
    /// the store keeps refusing writes.
    pub fn ensure_writable(&mut self, position_id: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.blocked.contains(position_id) {
            return Ok(());
        }
        match self.write_snapshot(now) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(%position_id, error = %e, "Flush retry failed");
                Err(EngineError::FlushPending {
                    position_id: position_id.to_string(),
                })
            }
        }
    }

    fn commit(&mut self, position_id: &str, now: DateTime<Utc>) -> Result<()> {
        match self.write_snapshot(now) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(%position_id, error = %e, "State flush failed; position blocked");
                self.blocked.insert(position_id.to_string());
                Err(EngineError::PersistenceFailure(e))
            }
        }
    }

    /// Rewrite the snapshot, archive terminal positions and drop them.
    fn write_snapshot(&mut self, now: DateTime<Utc>) -> std::result::Result<(), crate::error::PersistenceError> {
        self.update_high_water();
        self.sequence += 1;
        let snapshot = self.snapshot(now);
        let archived: Vec<Position> = self
            .positions
            .values()
            .filter(|p| p.state.is_terminal())
            .cloned()
            .collect();

        self.store.save(&snapshot, &archived)?;

        for pos in &archived {
            self.positions.remove(&pos.position_id);
        }
        self.blocked.clear();
        Ok(())
    }
}
