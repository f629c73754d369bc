//! Paper-trading exchange simulator.
//!
//! Fills market orders against settable prices with taker fees, and lets
//! callers script per-instrument fill behaviour (resting, partial fills,
//! rejections, auth and transient failures, lost acknowledgements) for
//! drills and tests. Client order ids are unique per venue, as on Binance.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::traits::ExchangeClient;
use super::types::*;
use crate::engine::{Clock, SystemClock};
use crate::error::ExchangeError;

/// How the next order on an instrument behaves.
#[derive(Debug, Clone, PartialEq)]
pub enum FillBehavior {
    /// Fill completely at the current price
    Immediate,
    /// Rest on the book without filling
    Never,
    /// Fill this fraction of the quantity and keep resting
    Partial(Decimal),
    /// Refuse the order
    Reject(String),
    /// Refuse with an authentication error
    AuthFailure,
    /// Fail the placement with a retryable error
    Transient,
    /// Fill the order but lose the response
    LostAck,
}

/// Simulated order record.
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
}

#[derive(Debug, Clone)]
struct MarketQuote {
    spot_price: Decimal,
    mark_price: Decimal,
    funding_rate: Decimal,
    next_funding_time: DateTime<Utc>,
    /// When the quote was taken
    observed_at: DateTime<Utc>,
}

/// Mutable simulator state.
#[derive(Debug, Default)]
struct PaperState {
    spot_free: Decimal,
    futures_available: Decimal,
    total_fees: Decimal,
    quotes: HashMap<String, MarketQuote>,
    orders: HashMap<String, PaperOrder>,
    /// Client order id -> venue order id
    client_orders: HashMap<String, String>,
    /// Signed holdings per (market, instrument)
    holdings: HashMap<(Market, String), Decimal>,
    scripts: HashMap<(Market, String), VecDeque<FillBehavior>>,
    instrument_pairs: HashMap<(Market, String), String>,
    leverage: HashMap<String, u8>,
    placed: Vec<OrderRequest>,
}

/// In-memory exchange used for paper trading and deterministic tests.
pub struct PaperExchange {
    state: Arc<RwLock<PaperState>>,
    order_id_counter: AtomicU64,
    clock: Arc<dyn Clock>,
    spot_fee_rate: Decimal,
    perp_fee_rate: Decimal,
}

impl PaperExchange {
    /// Create a simulator with quote balance split evenly across wallets.
    pub fn new(initial_balance: Decimal) -> Self {
        Self::with_clock(initial_balance, Arc::new(SystemClock))
    }

    /// Create a simulator that timestamps snapshots with the given clock.
    pub fn with_clock(initial_balance: Decimal, clock: Arc<dyn Clock>) -> Self {
        let half = initial_balance / dec!(2);
        let state = PaperState {
            spot_free: half,
            futures_available: initial_balance - half,
            ..Default::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            order_id_counter: AtomicU64::new(1),
            clock,
            spot_fee_rate: dec!(0.001), // 0.1% spot taker
            perp_fee_rate: dec!(0.0004), // 0.04% futures taker
        }
    }

    /// Set prices and funding for a pair keyed by its symbol, quoted now.
    pub async fn set_market(
        &self,
        symbol: &str,
        spot_price: Decimal,
        mark_price: Decimal,
        funding_rate: Decimal,
    ) {
        let mut state = self.state.write().await;
        let next_funding_time = state
            .quotes
            .get(symbol)
            .map(|q| q.next_funding_time)
            .unwrap_or_else(|| self.clock.now() + Duration::hours(8));
        state.quotes.insert(
            symbol.to_string(),
            MarketQuote {
                spot_price,
                mark_price,
                funding_rate,
                next_funding_time,
                observed_at: self.clock.now(),
            },
        );
    }

    /// Map a pair's spot and perp instruments to its quotes.
    pub async fn register_pair(&self, pair: &TradingPair) {
        let mut state = self.state.write().await;
        for market in [Market::Spot, Market::Perp] {
            state.instrument_pairs.insert(
                (market, pair.instrument(market).to_string()),
                pair.symbol.clone(),
            );
        }
    }

    /// Move the next funding settlement time for a pair.
    pub async fn set_next_funding_time(&self, symbol: &str, at: DateTime<Utc>) {
        if let Some(quote) = self.state.write().await.quotes.get_mut(symbol) {
            quote.next_funding_time = at;
        }
    }

    /// Backdate or move the time a pair's quote was taken.
    pub async fn set_quote_time(&self, symbol: &str, at: DateTime<Utc>) {
        if let Some(quote) = self.state.write().await.quotes.get_mut(symbol) {
            quote.observed_at = at;
        }
    }

    /// Queue fill behaviours for the next orders on an instrument.
    pub async fn script(&self, market: Market, instrument: &str, behaviors: Vec<FillBehavior>) {
        self.state
            .write()
            .await
            .scripts
            .entry((market, instrument.to_string()))
            .or_default()
            .extend(behaviors);
    }

    /// Replace wallet balances.
    pub async fn set_balance(&self, spot_free: Decimal, futures_available: Decimal) {
        let mut state = self.state.write().await;
        state.spot_free = spot_free;
        state.futures_available = futures_available;
    }

    /// Every order request accepted or refused so far, in order.
    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.read().await.placed.clone()
    }

    /// Signed holding on an instrument (positive = long).
    pub async fn net_position(&self, market: Market, instrument: &str) -> Decimal {
        self.state
            .read()
            .await
            .holdings
            .get(&(market, instrument.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Fees charged so far.
    pub async fn total_fees(&self) -> Decimal {
        self.state.read().await.total_fees
    }

    /// Leverage last configured for a perp instrument.
    pub async fn leverage(&self, instrument: &str) -> Option<u8> {
        self.state.read().await.leverage.get(instrument).copied()
    }

    /// Copy quotes for the given pairs from another venue.
    ///
    /// Paper trading runs on live prices and funding this way. Pairs the
    /// source cannot quote keep their previous quote.
    pub async fn sync_quotes(&self, source: &dyn ExchangeClient, pairs: &[TradingPair]) -> usize {
        let mut synced = 0;
        for pair in pairs {
            match source.get_funding_rate(pair).await {
                Ok(snapshot) => {
                    self.set_market(
                        &pair.symbol,
                        snapshot.spot_price,
                        snapshot.mark_price,
                        snapshot.funding_rate,
                    )
                    .await;
                    self.set_next_funding_time(&pair.symbol, snapshot.next_funding_time)
                        .await;
                    self.set_quote_time(&pair.symbol, snapshot.observed_at).await;
                    synced += 1;
                }
                Err(e) => warn!(pair = %pair.symbol, error = %e, "Quote sync failed, keeping previous quote"),
            }
        }
        synced
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn fee_rate(&self, market: Market) -> Decimal {
        match market {
            Market::Spot => self.spot_fee_rate,
            Market::Perp => self.perp_fee_rate,
        }
    }

    /// Instruments resolve to the pair of the same name unless registered.
    fn price_for(state: &PaperState, market: Market, instrument: &str) -> Option<Decimal> {
        let symbol = state
            .instrument_pairs
            .get(&(market, instrument.to_string()))
            .map(String::as_str)
            .unwrap_or(instrument);
        state.quotes.get(symbol).map(|q| match market {
            Market::Spot => q.spot_price,
            Market::Perp => q.mark_price,
        })
    }

    /// Apply a fill to balances and holdings.
    fn apply_fill(
        state: &mut PaperState,
        request: &OrderRequest,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
    ) {
        let signed = match request.side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        *state
            .holdings
            .entry((request.market, request.instrument.clone()))
            .or_default() += signed;

        match request.market {
            Market::Spot => state.spot_free -= signed * price + fee,
            Market::Perp => state.futures_available -= fee,
        }
        state.total_fees += fee;
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_funding_rate(&self, pair: &TradingPair) -> Result<FundingSnapshot, ExchangeError> {
        let state = self.state.read().await;
        let quote = state.quotes.get(&pair.symbol).ok_or_else(|| {
            ExchangeError::Transient(format!("no market data for {}", pair.symbol))
        })?;

        Ok(FundingSnapshot {
            pair: pair.symbol.clone(),
            funding_rate: quote.funding_rate,
            next_funding_time: quote.next_funding_time,
            mark_price: quote.mark_price,
            spot_price: quote.spot_price,
            observed_at: quote.observed_at,
        })
    }

    async fn get_spot_price(&self, pair: &TradingPair) -> Result<Decimal, ExchangeError> {
        self.state
            .read()
            .await
            .quotes
            .get(&pair.symbol)
            .map(|q| q.spot_price)
            .ok_or_else(|| ExchangeError::Transient(format!("no spot price for {}", pair.symbol)))
    }

    async fn get_account_balance(&self) -> Result<AccountBalance, ExchangeError> {
        let state = self.state.read().await;
        Ok(AccountBalance {
            spot_free: state.spot_free,
            futures_available: state.futures_available,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderHandle, ExchangeError> {
        let mut state = self.state.write().await;
        state.placed.push(request.clone());

        if let Some(client_id) = &request.client_order_id {
            if state.client_orders.contains_key(client_id) {
                return Err(ExchangeError::Rejected(format!(
                    "duplicate client order id {}",
                    client_id
                )));
            }
        }

        let key = (request.market, request.instrument.clone());
        let behavior = state
            .scripts
            .get_mut(&key)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(FillBehavior::Immediate);

        let price = Self::price_for(&state, request.market, &request.instrument)
            .ok_or_else(|| ExchangeError::Rejected(format!("unknown instrument {}", request.instrument)))?;

        let filled_qty = match &behavior {
            FillBehavior::Immediate | FillBehavior::LostAck => request.quantity,
            FillBehavior::Never => Decimal::ZERO,
            FillBehavior::Partial(fraction) => (request.quantity * fraction).round_dp(8),
            FillBehavior::Reject(reason) => return Err(ExchangeError::Rejected(reason.clone())),
            FillBehavior::AuthFailure => {
                return Err(ExchangeError::Auth("paper: invalid API key".to_string()))
            }
            FillBehavior::Transient => {
                return Err(ExchangeError::Transient("paper: simulated network error".to_string()))
            }
        };

        let fee = filled_qty * price * self.fee_rate(request.market);
        if request.market == Market::Spot
            && request.side == OrderSide::Buy
            && filled_qty * price + fee > state.spot_free
        {
            return Err(ExchangeError::Rejected(format!(
                "insufficient balance: {} USDT available",
                state.spot_free
            )));
        }

        if filled_qty > Decimal::ZERO {
            Self::apply_fill(&mut state, request, filled_qty, price, fee);
        }

        let status = if filled_qty == request.quantity {
            OrderStatus::Filled
        } else if filled_qty > Decimal::ZERO {
            OrderStatus::Partial
        } else {
            OrderStatus::Open
        };

        let order_id = format!("paper-{}", self.next_order_id());
        info!(
            %order_id,
            market = %request.market,
            instrument = %request.instrument,
            side = ?request.side,
            quantity = %request.quantity,
            filled = %filled_qty,
            %price,
            %fee,
            "Paper order placed"
        );

        state.orders.insert(
            order_id.clone(),
            PaperOrder {
                request: request.clone(),
                status,
                filled_qty,
                avg_price: if filled_qty > Decimal::ZERO { price } else { Decimal::ZERO },
                fee,
            },
        );
        if let Some(client_id) = &request.client_order_id {
            state.client_orders.insert(client_id.clone(), order_id.clone());
        }

        if behavior == FillBehavior::LostAck {
            warn!(%order_id, "Paper order response dropped");
            return Err(ExchangeError::Transient("paper: response lost".to_string()));
        }

        Ok(OrderHandle {
            market: request.market,
            instrument: request.instrument.clone(),
            order_id,
        })
    }

    async fn get_order_status(&self, handle: &OrderHandle) -> Result<OrderUpdate, ExchangeError> {
        let state = self.state.read().await;
        let order = state
            .orders
            .get(&handle.order_id)
            .ok_or_else(|| ExchangeError::Rejected(format!("unknown order {}", handle.order_id)))?;

        Ok(OrderUpdate {
            status: order.status,
            filled_qty: order.filled_qty,
            avg_price: order.avg_price,
            fee: Some(order.fee),
        })
    }

    async fn get_order_by_client_id(
        &self,
        market: Market,
        instrument: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderHandle>, ExchangeError> {
        let state = self.state.read().await;
        let handle = state
            .client_orders
            .get(client_order_id)
            .filter(|order_id| {
                state
                    .orders
                    .get(order_id.as_str())
                    .is_some_and(|o| o.request.market == market && o.request.instrument == instrument)
            })
            .map(|order_id| OrderHandle {
                market,
                instrument: instrument.to_string(),
                order_id: order_id.clone(),
            });
        Ok(handle)
    }

    async fn cancel_order(&self, handle: &OrderHandle) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        if let Some(order) = state.orders.get_mut(&handle.order_id) {
            if !order.status.is_terminal() {
                order.status = OrderStatus::Canceled;
                debug!(order_id = %handle.order_id, filled = %order.filled_qty, "Paper order canceled");
            }
        }
        Ok(())
    }

    async fn set_leverage(&self, pair: &TradingPair, leverage: u8) -> Result<(), ExchangeError> {
        self.state
            .write()
            .await
            .leverage
            .insert(pair.perp_instrument.clone(), leverage);
        Ok(())
    }

    fn venue(&self) -> &'static str {
        "paper"
    }
}
