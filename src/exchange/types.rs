//! Exchange-facing types: instruments, snapshots, orders and Binance wire formats.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A spot/perpetual instrument pair traded as one hedged unit.
///
/// Static configuration: never mutated at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingPair {
    /// Pair identifier used throughout the engine (e.g. "BTCUSDT")
    pub symbol: String,
    /// Spot instrument identifier
    pub spot_instrument: String,
    /// Perpetual futures instrument identifier
    pub perp_instrument: String,
    /// Target notional per position in quote currency
    #[serde(default = "default_target_notional")]
    pub target_notional: Decimal,
    /// Quantity step shared by both legs
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
    /// Per-pair override of the minimum entry funding rate
    #[serde(default)]
    pub min_funding_rate: Option<Decimal>,
    /// Per-pair override of the basis tolerance
    #[serde(default)]
    pub basis_tolerance: Option<Decimal>,
}

fn default_target_notional() -> Decimal {
    Decimal::new(1000, 0) // 1000 USDT
}

fn default_lot_size() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

impl TradingPair {
    /// Pair whose spot and perp instruments share the same symbol (Binance style).
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            spot_instrument: symbol.to_string(),
            perp_instrument: symbol.to_string(),
            target_notional: default_target_notional(),
            lot_size: default_lot_size(),
            min_funding_rate: None,
            basis_tolerance: None,
        }
    }

    /// Set the target notional.
    pub fn with_notional(mut self, notional: Decimal) -> Self {
        self.target_notional = notional;
        self
    }

    /// Set the lot size.
    pub fn with_lot_size(mut self, lot_size: Decimal) -> Self {
        self.lot_size = lot_size;
        self
    }

    /// Instrument identifier for one market of this pair.
    pub fn instrument(&self, market: Market) -> &str {
        match market {
            Market::Spot => &self.spot_instrument,
            Market::Perp => &self.perp_instrument,
        }
    }
}

/// Market a leg trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Spot,
    Perp,
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Market::Spot => write!(f, "spot"),
            Market::Perp => write!(f, "perp"),
        }
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that unwinds a fill on this side.
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }
}

/// Order status as reported by a status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Resting, nothing filled yet
    Open,
    /// Resting with some quantity filled
    Partial,
    Filled,
    /// No longer working; may carry a partial fill
    Canceled,
}

impl OrderStatus {
    /// The order can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled)
    }
}

/// Funding and price observation for one pair.
///
/// Ephemeral: produced each poll and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct FundingSnapshot {
    pub pair: String,
    /// Signed funding rate per funding period (positive: longs pay shorts)
    pub funding_rate: Decimal,
    pub next_funding_time: DateTime<Utc>,
    pub mark_price: Decimal,
    pub spot_price: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl FundingSnapshot {
    /// Perp minus spot.
    pub fn basis(&self) -> Decimal {
        self.mark_price - self.spot_price
    }

    /// Basis relative to the spot price.
    pub fn basis_ratio(&self) -> Decimal {
        crate::utils::safe_div(self.basis(), self.spot_price)
    }
}

/// Free balances usable for new positions (quote currency).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AccountBalance {
    pub spot_free: Decimal,
    pub futures_available: Decimal,
}

impl AccountBalance {
    pub fn total_free(&self) -> Decimal {
        self.spot_free + self.futures_available
    }
}

/// Order placement request.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub market: Market,
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    /// Perp unwinds must only reduce exposure
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Market order.
    pub fn market(market: Market, instrument: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            market,
            instrument: instrument.to_string(),
            side,
            quantity,
            order_type: OrderType::Market,
            reduce_only: false,
            client_order_id: None,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = self.market == Market::Perp;
        self
    }

    pub fn with_client_id(mut self, id: String) -> Self {
        self.client_order_id = Some(id);
        self
    }
}

/// Reference to a placed order; must be confirmed via status polls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderHandle {
    pub market: Market,
    pub instrument: String,
    pub order_id: String,
}

/// Result of an order status poll.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    /// Commission in quote currency when the venue reports it
    pub fee: Option<Decimal>,
}

// ==================== Binance Wire Types ====================

/// Futures premium index (mark price + funding).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndex {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub mark_price: Decimal,
    #[serde(rename = "lastFundingRate", with = "rust_decimal::serde::str")]
    pub funding_rate: Decimal,
    pub next_funding_time: i64,
    pub time: i64,
}

/// Spot last price.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
}

/// Futures wallet balance entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesBalance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub available_balance: Decimal,
}

/// Spot account snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct SpotAccount {
    pub balances: Vec<SpotBalance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpotBalance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub free: Decimal,
}

/// Binance order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BinanceOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    ExpiredInMatch,
}

impl From<BinanceOrderStatus> for OrderStatus {
    fn from(status: BinanceOrderStatus) -> Self {
        match status {
            BinanceOrderStatus::New => OrderStatus::Open,
            BinanceOrderStatus::PartiallyFilled => OrderStatus::Partial,
            BinanceOrderStatus::Filled => OrderStatus::Filled,
            BinanceOrderStatus::Canceled
            | BinanceOrderStatus::Rejected
            | BinanceOrderStatus::Expired
            | BinanceOrderStatus::ExpiredInMatch => OrderStatus::Canceled,
        }
    }
}

/// Order as returned by both spot and futures order endpoints.
///
/// Spot reports `cummulativeQuoteQty`, futures reports `avgPrice`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceOrder {
    pub order_id: i64,
    pub status: BinanceOrderStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub avg_price: Option<Decimal>,
    #[serde(
        default,
        rename = "cummulativeQuoteQty",
        with = "rust_decimal::serde::str_option"
    )]
    pub cumulative_quote_qty: Option<Decimal>,
}

impl BinanceOrder {
    pub fn average_price(&self) -> Decimal {
        match (self.avg_price, self.cumulative_quote_qty) {
            (Some(avg), _) if avg > Decimal::ZERO => avg,
            (_, Some(quote)) => crate::utils::safe_div(quote, self.executed_qty),
            _ => Decimal::ZERO,
        }
    }
}

/// Error body returned by Binance on 4xx.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Convert a Binance millisecond timestamp.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_basis_ratio() {
        let snap = FundingSnapshot {
            pair: "BTCUSDT".into(),
            funding_rate: dec!(0.0015),
            next_funding_time: Utc::now(),
            mark_price: dec!(100.2),
            spot_price: dec!(100),
            observed_at: Utc::now(),
        };
        assert_eq!(snap.basis(), dec!(0.2));
        assert_eq!(snap.basis_ratio(), dec!(0.002));
    }

    #[test]
    fn test_spot_order_average_price() {
        let json = r#"{"orderId":7,"status":"FILLED","executedQty":"2","cummulativeQuoteQty":"201"}"#;
        let order: BinanceOrder = serde_json::from_str(json).unwrap();
        assert_eq!(order.average_price(), dec!(100.5));
        assert_eq!(OrderStatus::from(order.status), OrderStatus::Filled);
    }

    #[test]
    fn test_futures_order_average_price() {
        let json = r#"{"orderId":9,"status":"PARTIALLY_FILLED","executedQty":"1","avgPrice":"100.2"}"#;
        let order: BinanceOrder = serde_json::from_str(json).unwrap();
        assert_eq!(order.average_price(), dec!(100.2));
        assert_eq!(OrderStatus::from(order.status), OrderStatus::Partial);
    }

    #[test]
    fn test_reduce_only_applies_to_perp_only() {
        let spot = OrderRequest::market(Market::Spot, "BTCUSDT", OrderSide::Sell, dec!(1)).reduce_only();
        let perp = OrderRequest::market(Market::Perp, "BTCUSDT", OrderSide::Buy, dec!(1)).reduce_only();
        assert!(!spot.reduce_only);
        assert!(perp.reduce_only);
    }
}
