//! Venue-agnostic exchange interface consumed by the engine.
//!
//! The engine never assumes an order fills on placement: every handle
//! returned by `place_order` is confirmed through `get_order_status`.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::{
    AccountBalance, FundingSnapshot, Market, OrderHandle, OrderRequest, OrderUpdate, TradingPair,
};
use crate::error::ExchangeError;

/// Market data, account and order operations for a single venue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Current funding rate, mark price and spot price for a pair.
    async fn get_funding_rate(&self, pair: &TradingPair) -> Result<FundingSnapshot, ExchangeError>;

    /// Last spot price for a pair.
    async fn get_spot_price(&self, pair: &TradingPair) -> Result<Decimal, ExchangeError>;

    /// Free quote balances across spot and futures wallets.
    async fn get_account_balance(&self) -> Result<AccountBalance, ExchangeError>;

    /// Submit an order. The returned handle says nothing about fills.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderHandle, ExchangeError>;

    /// Poll the state of a previously placed order.
    async fn get_order_status(&self, handle: &OrderHandle) -> Result<OrderUpdate, ExchangeError>;

    /// Look up an order by the client id it was submitted with.
    ///
    /// `None` when the venue has no such order. Used to settle placements
    /// whose response never arrived.
    async fn get_order_by_client_id(
        &self,
        market: Market,
        instrument: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderHandle>, ExchangeError>;

    /// Cancel a resting order. Cancelling a terminal order is not an error.
    async fn cancel_order(&self, handle: &OrderHandle) -> Result<(), ExchangeError>;

    /// Configure perp leverage for a pair before the first perp order.
    async fn set_leverage(&self, pair: &TradingPair, leverage: u8) -> Result<(), ExchangeError>;

    /// Venue name for logs.
    fn venue(&self) -> &'static str;
}
