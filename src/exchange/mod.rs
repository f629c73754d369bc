//! Exchange integrations.
//!
//! ## Binance
//! REST connectivity for spot and USDT-margined perpetuals:
//! - Market data (premium index, spot ticker)
//! - Account operations (balances, orders, leverage)
//!
//! ## Paper
//! In-memory simulator with scripted fills, used for paper trading and tests.

mod client;
pub mod mock;
mod traits;
mod types;

pub use client::{classify_error, BinanceClient};
pub use mock::{FillBehavior, PaperExchange};
pub use traits::ExchangeClient;
#[cfg(test)]
pub use traits::MockExchangeClient;
pub use types::*;
