//! # Funding Arb
//!
//! Delta-neutral funding rate arbitrage on a single spot/perpetual venue:
//! hold a spot leg and an opposite perpetual leg, collect funding, and
//! never leave a single naked leg behind.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Exchange interface, Binance REST client, paper simulator
//! - `strategy`: Signal evaluation, sizing and two-leg order execution
//! - `risk`: Entry gate and exit conditions
//! - `ledger`: Position state machine, flushed on every transition
//! - `persistence`: SQLite snapshot store and trade history
//! - `engine`: Scan/monitor scheduler, clock and status events
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use engine::{Engine, ShutdownHandle, StatusSnapshot};
pub use error::{EngineError, ExchangeError};
