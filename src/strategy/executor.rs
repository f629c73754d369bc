//! Order execution for hedged positions.
//!
//! Open protocol: set leverage, fill the perp (funding-collecting) leg, then
//! the spot leg for the same quantity. Any failure unwinds every filled
//! quantity and marks the position FAILED; a failed unwind escalates to
//! manual intervention. Close protocol: unwind the smaller leg first,
//! confirm both fills, book realized P&L.
//!
//! Every order is confirmed by polling; nothing is assumed filled on placement.
//! A placement whose outcome is unknown (timeout, dropped response) is looked
//! up by its client order id before it is resubmitted.

use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::engine::Clock;
use crate::error::{EngineError, ExchangeError, Result};
use crate::exchange::{
    AccountBalance, ExchangeClient, FundingSnapshot, Market, OrderHandle, OrderRequest, OrderStatus,
    OrderUpdate, TradingPair,
};
use crate::ledger::{
    LegFill, LegSlot, LegStatus, OpenRequest, Position, PositionLedger, PositionState,
};
use crate::persistence::StateStore;

/// Result of an open attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Opened { position_id: String },
    Failed { position_id: String, reason: String },
    ManualIntervention { position_id: String, reason: String },
    /// The pair already has a position that must not be touched by an open
    AlreadyActive { position_id: String, state: PositionState },
}

/// Result of a close attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed { position_id: String, realized_pnl: Decimal },
    ManualIntervention { position_id: String, reason: String },
    /// Not in a closable state
    Skipped { position_id: String, state: PositionState },
}

/// Turns approved decisions into confirmed exchange effects.
pub struct ExecutionCoordinator {
    exchange: Arc<dyn ExchangeClient>,
    clock: Arc<dyn Clock>,
    config: ExecutionConfig,
}

impl ExecutionCoordinator {
    pub fn new(exchange: Arc<dyn ExchangeClient>, clock: Arc<dyn Clock>, config: ExecutionConfig) -> Self {
        Self {
            exchange,
            clock,
            config,
        }
    }

    // ==================== Market Data ====================

    pub async fn fetch_snapshot(&self, pair: &TradingPair) -> std::result::Result<FundingSnapshot, ExchangeError> {
        let exchange = self.exchange.as_ref();
        self.with_retry("funding rate", move || exchange.get_funding_rate(pair))
            .await
    }

    pub async fn fetch_balance(&self) -> std::result::Result<AccountBalance, ExchangeError> {
        let exchange = self.exchange.as_ref();
        self.with_retry("account balance", move || exchange.get_account_balance())
            .await
    }

    // ==================== Open Protocol ====================

    /// Open a hedged position, or resume one already OPENING on the pair.
    pub async fn open<S: StateStore>(
        &self,
        ledger: &mut PositionLedger<S>,
        request: OpenRequest<'_>,
    ) -> Result<OpenOutcome> {
        let pair = request.pair;
        if let Some(existing) = ledger.active_for_pair(&pair.symbol) {
            if existing.state == PositionState::NeedsManualIntervention {
                return Err(Self::manual_required(existing));
            }
            let position_id = existing.position_id.clone();
            let state = existing.state;
            return match state {
                PositionState::Opening => {
                    info!(%position_id, "Resuming interrupted open");
                    self.resume_open(ledger, pair, &position_id).await
                }
                state => Ok(OpenOutcome::AlreadyActive { position_id, state }),
            };
        }

        let exchange = self.exchange.as_ref();
        let leverage = request.leverage;
        self.with_retry("set leverage", move || exchange.set_leverage(pair, leverage))
            .await
            .map_err(|source| EngineError::OrderRejected {
                instrument: pair.perp_instrument.clone(),
                source,
            })?;

        let position_id = ledger.begin_open(request, self.clock.now())?;
        self.complete_open(ledger, pair, &position_id).await
    }

    /// Continue an OPENING position after a restart.
    ///
    /// Outstanding entry orders are settled first. Fully filled, consistent
    /// legs are promoted to OPEN; anything else is unwound.
    pub async fn resume_open<S: StateStore>(
        &self,
        ledger: &mut PositionLedger<S>,
        pair: &TradingPair,
        position_id: &str,
    ) -> Result<OpenOutcome> {
        let pos = Self::position(ledger, position_id)?;
        if pos.state == PositionState::NeedsManualIntervention {
            return Err(Self::manual_required(pos));
        }
        if pos.state != PositionState::Opening {
            return Ok(OpenOutcome::AlreadyActive {
                position_id: position_id.to_string(),
                state: pos.state,
            });
        }
        if pos.has_exit_legs() {
            let reason = pos
                .exit_reason
                .clone()
                .unwrap_or_else(|| "resumed unwind".to_string());
            return self.abort_open(ledger, position_id, &reason).await;
        }

        for market in [Market::Perp, Market::Spot] {
            let slot = LegSlot::Entry(market);
            let pending = Self::position(ledger, position_id)?
                .leg(slot)
                .and_then(|l| l.pending_order.clone());
            if let Some(handle) = pending {
                match self.settle(ledger, position_id, slot, &handle).await {
                    Ok(_) => {}
                    Err(e) if e.is_persistence() => return Err(e),
                    Err(e) => {
                        let reason = format!("cannot settle {} order on resume: {}", slot, e);
                        ledger.escalate(position_id, &reason, self.clock.now())?;
                        return Ok(OpenOutcome::ManualIntervention {
                            position_id: position_id.to_string(),
                            reason,
                        });
                    }
                }
            }
        }

        let pos = Self::position(ledger, position_id)?;
        if pos.is_hedge_consistent(self.config.hedge_tolerance) {
            ledger.mark_open(position_id, self.config.hedge_tolerance, self.clock.now())?;
            return Ok(OpenOutcome::Opened {
                position_id: position_id.to_string(),
            });
        }

        let untouched = pos.spot_leg.filled_qty.is_zero()
            && pos.perp_leg.filled_qty.is_zero()
            && pos.spot_leg.order_ids.is_empty()
            && pos.perp_leg.order_ids.is_empty();
        if untouched {
            // Crashed before the first order; pick up where it stopped
            return self.complete_open(ledger, pair, position_id).await;
        }

        self.abort_open(ledger, position_id, "incomplete open found on resume")
            .await
    }

    async fn complete_open<S: StateStore>(
        &self,
        ledger: &mut PositionLedger<S>,
        pair: &TradingPair,
        position_id: &str,
    ) -> Result<OpenOutcome> {
        // Perp first: the funding-collecting side
        for market in [Market::Perp, Market::Spot] {
            let slot = LegSlot::Entry(market);
            match self.drive_leg(ledger, position_id, slot).await {
                Ok(LegStatus::Filled) => {}
                Ok(status) => {
                    let reason = EngineError::FillTimeout {
                        instrument: pair.instrument(market).to_string(),
                        waited_secs: self.config.fill_timeout_secs,
                    }
                    .to_string();
                    debug!(%position_id, %slot, ?status, "Entry leg incomplete");
                    return self.abort_open(ledger, position_id, &reason).await;
                }
                Err(e) if e.is_persistence() => return Err(e),
                Err(e @ EngineError::OrderStateUnknown { .. }) => {
                    // The order may still fill; leave it to an operator
                    let reason = e.to_string();
                    ledger.escalate(position_id, &reason, self.clock.now())?;
                    return Ok(OpenOutcome::ManualIntervention {
                        position_id: position_id.to_string(),
                        reason,
                    });
                }
                Err(e) => {
                    let reason = e.to_string();
                    return self.abort_open(ledger, position_id, &reason).await;
                }
            }
        }

        match ledger.mark_open(position_id, self.config.hedge_tolerance, self.clock.now()) {
            Ok(()) => Ok(OpenOutcome::Opened {
                position_id: position_id.to_string(),
            }),
            Err(e @ EngineError::HedgeMismatch { .. }) => {
                let reason = e.to_string();
                self.abort_open(ledger, position_id, &reason).await
            }
            Err(e) => Err(e),
        }
    }

    /// Unwind whatever an incomplete open left behind.
    async fn abort_open<S: StateStore>(
        &self,
        ledger: &mut PositionLedger<S>,
        position_id: &str,
        reason: &str,
    ) -> Result<OpenOutcome> {
        let pos = Self::position(ledger, position_id)?;
        let unknown_fill = [Market::Spot, Market::Perp]
            .iter()
            .any(|&m| pos.entry_leg(m).pending_order.is_some());
        if unknown_fill {
            let reason = format!("{}; entry order state unknown", reason);
            ledger.escalate(position_id, &reason, self.clock.now())?;
            return Ok(OpenOutcome::ManualIntervention {
                position_id: position_id.to_string(),
                reason,
            });
        }

        let exposed = pos.net_quantity(Market::Spot) != Decimal::ZERO
            || pos.net_quantity(Market::Perp) != Decimal::ZERO;
        if exposed {
            warn!(%position_id, %reason, "Unwinding incomplete hedge");
            ledger.begin_unwind(position_id, reason, self.clock.now())?;

            for market in [Market::Perp, Market::Spot] {
                if let Some(failure) = self.unwind_leg(ledger, position_id, market).await? {
                    let reason = EngineError::PartialHedgeFailure {
                        position_id: position_id.to_string(),
                        reason: format!("{}; unwind failed: {}", reason, failure),
                    }
                    .to_string();
                    ledger.escalate(position_id, &reason, self.clock.now())?;
                    return Ok(OpenOutcome::ManualIntervention {
                        position_id: position_id.to_string(),
                        reason,
                    });
                }
            }
        }

        ledger.mark_failed(position_id, reason, self.clock.now())?;
        Ok(OpenOutcome::Failed {
            position_id: position_id.to_string(),
            reason: reason.to_string(),
        })
    }

    // ==================== Close Protocol ====================

    /// Close an OPEN position, or resume one already CLOSING.
    pub async fn close<S: StateStore>(
        &self,
        ledger: &mut PositionLedger<S>,
        position_id: &str,
        reason: &str,
    ) -> Result<CloseOutcome> {
        let pos = Self::position(ledger, position_id)?;
        if pos.state == PositionState::NeedsManualIntervention {
            return Err(Self::manual_required(pos));
        }
        let state = pos.state;
        match state {
            PositionState::Open => ledger.begin_close(position_id, reason, self.clock.now())?,
            PositionState::Closing => info!(%position_id, "Resuming interrupted close"),
            state => {
                return Ok(CloseOutcome::Skipped {
                    position_id: position_id.to_string(),
                    state,
                })
            }
        }

        for market in Self::close_order(Self::position(ledger, position_id)?) {
            if let Some(failure) = self.unwind_leg(ledger, position_id, market).await? {
                let reason = EngineError::PartialHedgeFailure {
                    position_id: position_id.to_string(),
                    reason: format!("close failed: {}", failure),
                }
                .to_string();
                ledger.escalate(position_id, &reason, self.clock.now())?;
                return Ok(CloseOutcome::ManualIntervention {
                    position_id: position_id.to_string(),
                    reason,
                });
            }
        }

        match ledger.mark_closed(position_id, self.clock.now()) {
            Ok(realized_pnl) => Ok(CloseOutcome::Closed {
                position_id: position_id.to_string(),
                realized_pnl,
            }),
            Err(e @ EngineError::HedgeMismatch { .. }) => {
                let reason = format!("residual exposure after unwind: {}", e);
                ledger.escalate(position_id, &reason, self.clock.now())?;
                Ok(CloseOutcome::ManualIntervention {
                    position_id: position_id.to_string(),
                    reason,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Smaller remaining exposure first; perp first on a tie.
    fn close_order(pos: &Position) -> [Market; 2] {
        let spot = pos.net_quantity(Market::Spot).abs();
        let perp = pos.net_quantity(Market::Perp).abs();
        if spot < perp {
            [Market::Spot, Market::Perp]
        } else {
            [Market::Perp, Market::Spot]
        }
    }

    /// Drive one unwind leg to completion. Returns a failure description
    /// instead of an error for exchange-side problems.
    async fn unwind_leg<S: StateStore>(
        &self,
        ledger: &mut PositionLedger<S>,
        position_id: &str,
        market: Market,
    ) -> Result<Option<String>> {
        let slot = LegSlot::Exit(market);
        if Self::position(ledger, position_id)?.leg(slot).is_none() {
            return Ok(None);
        }
        match self.drive_leg(ledger, position_id, slot).await {
            Ok(LegStatus::Filled) => Ok(None),
            Ok(status) => Ok(Some(format!("{} leg ended {:?}", slot, status))),
            Err(e) if e.is_persistence() => Err(e),
            Err(e) => Ok(Some(e.to_string())),
        }
    }

    // ==================== Legs ====================

    /// Place (or re-attach to) the leg's order and wait for its outcome.
    async fn drive_leg<S: StateStore>(
        &self,
        ledger: &mut PositionLedger<S>,
        position_id: &str,
        slot: LegSlot,
    ) -> Result<LegStatus> {
        let leg = Self::position(ledger, position_id)?
            .leg(slot)
            .cloned()
            .ok_or_else(|| EngineError::PartialHedgeFailure {
                position_id: position_id.to_string(),
                reason: format!("missing {} leg", slot),
            })?;

        if leg.status == LegStatus::Filled && leg.pending_order.is_none() {
            return Ok(LegStatus::Filled);
        }

        let handle = match leg.pending_order {
            Some(handle) => {
                info!(%position_id, %slot, order_id = %handle.order_id, "Re-attaching to pending order");
                handle
            }
            None => {
                let quantity = leg.remaining();
                if quantity.is_zero() {
                    return Ok(LegStatus::Filled);
                }
                // An order must never go out while its record cannot be persisted
                ledger.ensure_writable(position_id, self.clock.now())?;
                let mut request = OrderRequest::market(leg.market, &leg.instrument, leg.side, quantity)
                    .with_client_id(format!("{}-{}-{}", position_id, slot, leg.order_ids.len() + 1));
                if matches!(slot, LegSlot::Exit(_)) {
                    request = request.reduce_only();
                }

                info!(
                    %position_id,
                    %slot,
                    side = leg.side.as_str(),
                    %quantity,
                    "Placing leg order"
                );
                let handle = self.submit(&request).await?;
                ledger.record_leg_order(position_id, slot, handle.clone(), self.clock.now())?;
                handle
            }
        };

        self.settle(ledger, position_id, slot, &handle).await
    }

    /// Place an order, retrying transient failures under the same client id.
    ///
    /// Once an attempt has failed in a way that may have reached the venue,
    /// every later failure is followed by a lookup of the client id. A found
    /// order is adopted; a failed lookup leaves the order state unknown.
    async fn submit(&self, request: &OrderRequest) -> Result<OrderHandle> {
        let client_order_id = request.client_order_id.clone().unwrap_or_default();
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0u8;
        let mut uncertain = false;

        loop {
            attempt += 1;
            let error = match tokio::time::timeout(self.config.request_timeout(), self.exchange.place_order(request)).await
            {
                Ok(Ok(handle)) => return Ok(handle),
                Ok(Err(e)) => e,
                Err(_) => ExchangeError::Transient("place order timed out".to_string()),
            };
            uncertain |= error.is_retryable();

            if uncertain && !client_order_id.is_empty() {
                if let Some(handle) = self.lookup(request, &client_order_id).await? {
                    warn!(
                        client_order_id = %client_order_id,
                        order_id = %handle.order_id,
                        error = %error,
                        "Placement failed but the order reached the venue"
                    );
                    return Ok(handle);
                }
            }

            if !error.is_retryable() || attempt >= max_attempts {
                error!(
                    instrument = %request.instrument,
                    venue = self.exchange.venue(),
                    attempt,
                    error = %error,
                    "Order placement failed"
                );
                return Err(EngineError::OrderRejected {
                    instrument: request.instrument.clone(),
                    source: error,
                });
            }

            let backoff = Duration::from_millis(self.config.retry_backoff_ms * u64::from(attempt));
            warn!(attempt, error = %error, backoff_ms = backoff.as_millis() as u64, "Order placement failed, retrying");
            self.clock.sleep(backoff).await;
        }
    }

    async fn lookup(&self, request: &OrderRequest, client_order_id: &str) -> Result<Option<OrderHandle>> {
        let exchange = self.exchange.as_ref();
        let (market, instrument) = (request.market, request.instrument.as_str());
        self.with_retry("order lookup", move || {
            exchange.get_order_by_client_id(market, instrument, client_order_id)
        })
        .await
        .map_err(|e| EngineError::OrderStateUnknown {
            instrument: request.instrument.clone(),
            client_order_id: client_order_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Wait for an order to finish and record the result on the leg.
    async fn settle<S: StateStore>(
        &self,
        ledger: &mut PositionLedger<S>,
        position_id: &str,
        slot: LegSlot,
        handle: &OrderHandle,
    ) -> Result<LegStatus> {
        let update = self.await_fill(handle).await?;

        let fee = update
            .fee
            .unwrap_or_else(|| update.filled_qty * update.avg_price * self.fee_rate(handle.market));
        let status = match update.status {
            OrderStatus::Filled => LegStatus::Filled,
            _ if update.filled_qty > Decimal::ZERO => LegStatus::Partial,
            _ => LegStatus::Failed,
        };

        ledger.record_leg_fill(
            position_id,
            slot,
            LegFill {
                filled_qty: update.filled_qty,
                avg_price: update.avg_price,
                fee,
                status,
            },
            self.clock.now(),
        )?;
        Ok(status)
    }

    /// Poll until the order is terminal or the fill timeout passes, then
    /// cancel and read the final fill.
    async fn await_fill(&self, handle: &OrderHandle) -> Result<OrderUpdate> {
        let exchange = self.exchange.as_ref();
        let deadline = self.clock.now()
            + chrono::Duration::from_std(self.config.fill_timeout()).unwrap_or_else(|_| chrono::Duration::seconds(30));

        loop {
            let update = self
                .with_retry("order status", move || exchange.get_order_status(handle))
                .await?;
            if update.status.is_terminal() {
                debug!(order_id = %handle.order_id, status = ?update.status, filled = %update.filled_qty, "Order settled");
                return Ok(update);
            }

            if self.clock.now() >= deadline {
                warn!(
                    order_id = %handle.order_id,
                    instrument = %handle.instrument,
                    filled = %update.filled_qty,
                    "Fill timeout, cancelling"
                );
                self.with_retry("cancel order", move || exchange.cancel_order(handle))
                    .await?;
                let last = self
                    .with_retry("order status", move || exchange.get_order_status(handle))
                    .await?;
                return Ok(OrderUpdate {
                    status: if last.status == OrderStatus::Filled {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::Canceled
                    },
                    ..last
                });
            }

            self.clock.sleep(self.config.poll_interval()).await;
        }
    }

    fn fee_rate(&self, market: Market) -> Decimal {
        match market {
            Market::Spot => self.config.spot_fee_rate,
            Market::Perp => self.config.perp_fee_rate,
        }
    }

    fn manual_required(pos: &Position) -> EngineError {
        EngineError::ManualInterventionRequired {
            position_id: pos.position_id.clone(),
            reason: pos.manual_reason.clone().unwrap_or_default(),
        }
    }

    fn position<'a, S: StateStore>(ledger: &'a PositionLedger<S>, position_id: &str) -> Result<&'a Position> {
        ledger
            .get(position_id)
            .ok_or_else(|| EngineError::UnknownPosition(position_id.to_string()))
    }

    /// Run an exchange call under the request timeout, retrying transient
    /// failures with linear backoff.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> std::result::Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ExchangeError>>,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0u8;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.config.request_timeout(), call()).await {
                Ok(result) => result,
                Err(_) => Err(ExchangeError::Transient(format!("{} timed out", what))),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = Duration::from_millis(self.config.retry_backoff_ms * u64::from(attempt));
                    warn!(what, attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "Transient exchange error, retrying");
                    self.clock.sleep(backoff).await;
                }
                Err(e) => {
                    if !e.is_retryable() {
                        error!(what, venue = self.exchange.venue(), error = %e, "Exchange call failed");
                    }
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ManualClock;
    use crate::exchange::{MockExchangeClient, OrderSide};
    use crate::ledger::Direction;
    use crate::persistence::SqliteStateStore;
    use chrono::Utc;
    use mockall::predicate::always;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn snapshot() -> FundingSnapshot {
        let now = Utc::now();
        FundingSnapshot {
            pair: "BTCUSDT".into(),
            funding_rate: dec!(0.0015),
            next_funding_time: now,
            mark_price: dec!(100.2),
            spot_price: dec!(100),
            observed_at: now,
        }
    }

    fn handle(market: Market, id: &str) -> OrderHandle {
        OrderHandle {
            market,
            instrument: "BTCUSDT".into(),
            order_id: id.into(),
        }
    }

    fn filled(qty: Decimal, price: Decimal) -> OrderUpdate {
        OrderUpdate {
            status: OrderStatus::Filled,
            filled_qty: qty,
            avg_price: price,
            fee: None,
        }
    }

    fn coordinator(mock: MockExchangeClient) -> ExecutionCoordinator {
        let config = ExecutionConfig {
            fill_timeout_secs: 2,
            retry_backoff_ms: 10,
            ..ExecutionConfig::default()
        };
        ExecutionCoordinator::new(Arc::new(mock), Arc::new(ManualClock::new(Utc::now())), config)
    }

    async fn open(
        coordinator: &ExecutionCoordinator,
        ledger: &mut PositionLedger<SqliteStateStore>,
    ) -> OpenOutcome {
        let pair = TradingPair::new("BTCUSDT");
        let snap = snapshot();
        coordinator
            .open(
                ledger,
                OpenRequest {
                    pair: &pair,
                    direction: Direction::LongSpotShortPerp,
                    quantity: dec!(10),
                    notional: dec!(1000),
                    leverage: 3,
                    snapshot: &snap,
                },
            )
            .await
            .unwrap()
    }

    fn ledger() -> PositionLedger<SqliteStateStore> {
        PositionLedger::load(SqliteStateStore::in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_open_places_perp_first_and_falls_back_to_configured_fees() {
        let mut mock = MockExchangeClient::new();
        mock.expect_venue().return_const("mock");
        mock.expect_set_leverage().times(1).returning(|_, _| Ok(()));

        let mut seq = mockall::Sequence::new();
        mock.expect_place_order()
            .withf(|r| r.market == Market::Perp && r.side == OrderSide::Sell && !r.reduce_only)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(handle(Market::Perp, "p-1")));
        mock.expect_place_order()
            .withf(|r| r.market == Market::Spot && r.side == OrderSide::Buy)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(handle(Market::Spot, "s-1")));
        mock.expect_get_order_status().returning(|h| {
            Ok(match h.market {
                Market::Perp => filled(dec!(10), dec!(100.2)),
                Market::Spot => filled(dec!(10), dec!(100)),
            })
        });

        let coordinator = coordinator(mock);
        let mut ledger = ledger();
        let outcome = open(&coordinator, &mut ledger).await;

        let OpenOutcome::Opened { position_id } = outcome else {
            panic!("expected open, got {:?}", outcome);
        };
        let pos = ledger.get(&position_id).unwrap();
        assert_eq!(pos.state, PositionState::Open);
        // 10 * 100 * 0.001 spot, 10 * 100.2 * 0.0004 perp
        assert_eq!(pos.spot_leg.fee, dec!(1));
        assert_eq!(pos.perp_leg.fee, dec!(0.4008));
    }

    #[tokio::test]
    async fn test_rejected_first_leg_fails_without_exposure() {
        let mut mock = MockExchangeClient::new();
        mock.expect_venue().return_const("mock");
        mock.expect_set_leverage().returning(|_, _| Ok(()));
        mock.expect_place_order()
            .times(1)
            .returning(|_| Err(ExchangeError::Rejected("min notional".into())));

        let coordinator = coordinator(mock);
        let mut ledger = ledger();
        let outcome = open(&coordinator, &mut ledger).await;

        assert!(matches!(outcome, OpenOutcome::Failed { .. }));
        assert_eq!(ledger.active_positions().count(), 0);
    }

    #[tokio::test]
    async fn test_second_leg_failure_unwinds_first_leg() {
        let mut mock = MockExchangeClient::new();
        mock.expect_venue().return_const("mock");
        mock.expect_set_leverage().returning(|_, _| Ok(()));
        mock.expect_place_order()
            .withf(|r| r.market == Market::Perp && !r.reduce_only)
            .times(1)
            .returning(|_| Ok(handle(Market::Perp, "p-1")));
        mock.expect_place_order()
            .withf(|r| r.market == Market::Spot)
            .times(1)
            .returning(|_| Err(ExchangeError::Rejected("insufficient balance".into())));
        mock.expect_place_order()
            .withf(|r| r.market == Market::Perp && r.reduce_only && r.side == OrderSide::Buy)
            .times(1)
            .returning(|_| Ok(handle(Market::Perp, "p-2")));
        mock.expect_get_order_status()
            .returning(|_| Ok(filled(dec!(10), dec!(100.2))));

        let coordinator = coordinator(mock);
        let mut ledger = ledger();
        let outcome = open(&coordinator, &mut ledger).await;

        assert!(matches!(outcome, OpenOutcome::Failed { .. }), "{:?}", outcome);
        assert_eq!(ledger.active_positions().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_unwind_escalates() {
        let mut mock = MockExchangeClient::new();
        mock.expect_venue().return_const("mock");
        mock.expect_set_leverage().returning(|_, _| Ok(()));
        mock.expect_place_order()
            .withf(|r| r.market == Market::Perp && !r.reduce_only)
            .times(1)
            .returning(|_| Ok(handle(Market::Perp, "p-1")));
        mock.expect_place_order()
            .withf(|r| r.market == Market::Spot)
            .returning(|_| Err(ExchangeError::Rejected("insufficient balance".into())));
        mock.expect_place_order()
            .withf(|r| r.reduce_only)
            .times(1)
            .returning(|_| Err(ExchangeError::Auth("key revoked".into())));
        mock.expect_get_order_status()
            .returning(|_| Ok(filled(dec!(10), dec!(100.2))));

        let coordinator = coordinator(mock);
        let mut ledger = ledger();
        let outcome = open(&coordinator, &mut ledger).await;

        let OpenOutcome::ManualIntervention { position_id, .. } = outcome else {
            panic!("expected escalation, got {:?}", outcome);
        };
        assert_eq!(
            ledger.get(&position_id).unwrap().state,
            PositionState::NeedsManualIntervention
        );
    }

    #[tokio::test]
    async fn test_resting_order_is_cancelled_after_fill_timeout() {
        let mut mock = MockExchangeClient::new();
        mock.expect_venue().return_const("mock");
        mock.expect_set_leverage().returning(|_, _| Ok(()));
        mock.expect_place_order()
            .times(1)
            .returning(|_| Ok(handle(Market::Perp, "p-1")));

        let cancelled = Arc::new(AtomicU32::new(0));
        let seen = cancelled.clone();
        mock.expect_cancel_order().with(always()).times(1).returning(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let flag = cancelled.clone();
        mock.expect_get_order_status().returning(move |_| {
            Ok(OrderUpdate {
                status: if flag.load(Ordering::SeqCst) > 0 {
                    OrderStatus::Canceled
                } else {
                    OrderStatus::Open
                },
                filled_qty: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                fee: None,
            })
        });

        let coordinator = coordinator(mock);
        let mut ledger = ledger();
        let outcome = open(&coordinator, &mut ledger).await;

        assert!(matches!(outcome, OpenOutcome::Failed { ref reason, .. } if reason.contains("fill timeout")));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mut mock = MockExchangeClient::new();
        mock.expect_venue().return_const("mock");
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        mock.expect_get_account_balance().times(3).returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ExchangeError::Transient("429".into()))
            } else {
                Ok(AccountBalance::default())
            }
        });

        let coordinator = coordinator(mock);
        tokio_test::assert_ok!(coordinator.fetch_balance().await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let mut mock = MockExchangeClient::new();
        mock.expect_venue().return_const("mock");
        mock.expect_get_account_balance()
            .times(1)
            .returning(|| Err(ExchangeError::Auth("bad key".into())));

        let coordinator = coordinator(mock);
        let err = tokio_test::assert_err!(coordinator.fetch_balance().await);
        assert_eq!(err, ExchangeError::Auth("bad key".into()));
    }

    #[tokio::test]
    async fn test_lost_placement_response_is_recovered_by_client_id() {
        let mut mock = MockExchangeClient::new();
        mock.expect_venue().return_const("mock");
        mock.expect_set_leverage().returning(|_, _| Ok(()));

        // First attempt never reached the venue; the retry did but its response was lost
        let placements = Arc::new(AtomicU32::new(0));
        let counter = placements.clone();
        mock.expect_place_order()
            .withf(|r| r.market == Market::Perp)
            .times(2)
            .returning(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExchangeError::Transient("place order timed out".into()))
                } else {
                    Err(ExchangeError::Rejected("duplicate client order id".into()))
                }
            });
        let lookups = Arc::new(AtomicU32::new(0));
        let seen = lookups.clone();
        mock.expect_get_order_by_client_id()
            .withf(|market, _, client_id| *market == Market::Perp && client_id.ends_with("entry_perp-1"))
            .times(2)
            .returning(move |market, _, _| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(None)
                } else {
                    Ok(Some(handle(market, "p-1")))
                }
            });
        mock.expect_place_order()
            .withf(|r| r.market == Market::Spot)
            .times(1)
            .returning(|_| Ok(handle(Market::Spot, "s-1")));
        mock.expect_get_order_status().returning(|h| {
            Ok(match h.market {
                Market::Perp => filled(dec!(10), dec!(100.2)),
                Market::Spot => filled(dec!(10), dec!(100)),
            })
        });

        let coordinator = coordinator(mock);
        let mut ledger = ledger();
        let outcome = open(&coordinator, &mut ledger).await;

        let OpenOutcome::Opened { position_id } = outcome else {
            panic!("expected open, got {:?}", outcome);
        };
        let pos = ledger.get(&position_id).unwrap();
        assert_eq!(pos.perp_leg.order_ids, vec!["p-1".to_string()]);
        assert_eq!(pos.perp_leg.filled_qty, dec!(10));
        assert_eq!(placements.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_placement_escalates_and_blocks_the_pair() {
        let mut mock = MockExchangeClient::new();
        mock.expect_venue().return_const("mock");
        mock.expect_set_leverage().returning(|_, _| Ok(()));
        mock.expect_place_order()
            .withf(|r| r.market == Market::Perp)
            .times(1)
            .returning(|_| Err(ExchangeError::Transient("connection reset".into())));
        mock.expect_get_order_by_client_id()
            .times(1)
            .returning(|_, _, _| Err(ExchangeError::Auth("key revoked".into())));

        let coordinator = coordinator(mock);
        let mut ledger = ledger();
        let outcome = open(&coordinator, &mut ledger).await;

        let OpenOutcome::ManualIntervention { position_id, reason } = outcome else {
            panic!("expected escalation, got {:?}", outcome);
        };
        assert!(reason.contains("unknown state"), "{}", reason);
        assert_eq!(
            ledger.get(&position_id).unwrap().state,
            PositionState::NeedsManualIntervention
        );

        // Neither close nor a new open may touch it
        let err = coordinator.close(&mut ledger, &position_id, "exit").await.unwrap_err();
        assert!(matches!(err, EngineError::ManualInterventionRequired { .. }));

        let pair = TradingPair::new("BTCUSDT");
        let snap = snapshot();
        let err = coordinator
            .open(
                &mut ledger,
                OpenRequest {
                    pair: &pair,
                    direction: Direction::LongSpotShortPerp,
                    quantity: dec!(10),
                    notional: dec!(1000),
                    leverage: 3,
                    snapshot: &snap,
                },
            )
            .await
            .unwrap_err();
        match err {
            EngineError::ManualInterventionRequired { position_id: id, reason } => {
                assert_eq!(id, position_id);
                assert!(reason.contains("unknown state"));
            }
            other => panic!("expected manual intervention error, got {:?}", other),
        }
    }
}
