//! Configuration management for the funding arbitrage engine.
//!
//! Loads settings from an optional `config.toml` and `FARB__*` environment
//! variables. The resulting tree is immutable; each component receives its
//! own section at construction.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use crate::exchange::TradingPair;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exchange credentials
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Pairs eligible for trading
    #[serde(default = "default_pairs")]
    pub pairs: Vec<TradingPair>,
    /// Signal evaluation thresholds
    #[serde(default)]
    pub signal: SignalConfig,
    /// Risk limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Order execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Loop cadences
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// State store location
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
    /// HTTP client timeout
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

/// How expected yield is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YieldBasis {
    /// Per funding period
    PerPeriod,
    /// Per year
    Annualized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Minimum |funding rate| per period to open a position
    #[serde(default = "default_min_funding_rate")]
    pub min_funding_rate: Decimal,
    /// Minimum |funding rate| per period to keep a position open
    #[serde(default = "default_min_hold_rate")]
    pub min_hold_rate: Decimal,
    /// Snapshots older than this never drive a decision
    #[serde(default = "default_max_snapshot_age")]
    pub max_snapshot_age_secs: u64,
    /// Maximum |basis| / spot accepted at entry
    #[serde(default = "default_basis_tolerance")]
    pub basis_tolerance: Decimal,
    #[serde(default = "default_yield_basis")]
    pub yield_basis: YieldBasis,
    /// Hours between funding settlements
    #[serde(default = "default_funding_interval_hours")]
    pub funding_interval_hours: u32,
    /// Funding periods the expected income must cover round-trip fees within
    #[serde(default = "default_breakeven_periods")]
    pub breakeven_periods: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum concurrent active positions
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    /// Maximum new entries per UTC day (0 = unlimited)
    #[serde(default = "default_max_daily_entries")]
    pub max_daily_entries: u32,
    /// Maximum summed notional across pairs (USDT)
    #[serde(default = "default_max_total_notional")]
    pub max_total_notional: Decimal,
    /// Maximum notional on a single pair (USDT)
    #[serde(default = "default_max_pair_notional")]
    pub max_pair_notional: Decimal,
    /// Drawdown (fraction of baseline capital) that stops trading and closes everything
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: Decimal,
    /// Capital the drawdown is measured against (USDT)
    #[serde(default = "default_capital_baseline")]
    pub capital_baseline: Decimal,
    /// Extra free balance required on top of the entry cost (0.10 = 10%)
    #[serde(default = "default_balance_safety_buffer")]
    pub balance_safety_buffer: Decimal,
    /// Basis loss (fraction of notional) that forces an exit
    #[serde(default = "default_basis_stop_loss")]
    pub basis_stop_loss: Decimal,
    /// Maximum hours a position stays open (0 = unlimited)
    #[serde(default = "default_max_holding_hours")]
    pub max_holding_hours: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Perp leverage used for new positions
    #[serde(default = "default_leverage")]
    pub leverage: u8,
    /// Maximum leverage allowed
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u8,
    /// How long a leg may take to fill before it is cancelled
    #[serde(default = "default_fill_timeout")]
    pub fill_timeout_secs: u64,
    /// Interval between order status polls
    #[serde(default = "default_fill_poll_interval")]
    pub fill_poll_interval_ms: u64,
    /// Upper bound on any single exchange call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Attempts for calls failing with transient errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    /// Base backoff between transient retries (linear)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Maximum relative spot/perp quantity mismatch on an open hedge
    #[serde(default = "default_hedge_tolerance")]
    pub hedge_tolerance: Decimal,
    /// Spot taker fee, used when the venue does not report commission
    #[serde(default = "default_spot_fee_rate")]
    pub spot_fee_rate: Decimal,
    /// Perp taker fee, used when the venue does not report commission
    #[serde(default = "default_perp_fee_rate")]
    pub perp_fee_rate: Decimal,
    /// Smallest notional worth opening (USDT)
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// Largest share of free balance committed to one position
    #[serde(default = "default_max_balance_fraction")]
    pub max_balance_fraction: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Opportunity scan cadence
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Open position monitoring cadence
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    /// Upper bound on draining positions at shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_http_timeout() -> u64 {
    10
}

fn default_pairs() -> Vec<TradingPair> {
    ["BTCUSDT", "ETHUSDT", "SOLUSDT"]
        .iter()
        .map(|s| TradingPair::new(s))
        .collect()
}

fn default_min_funding_rate() -> Decimal {
    Decimal::new(5, 4) // 0.0005 (0.05% per period)
}

fn default_min_hold_rate() -> Decimal {
    Decimal::new(1, 4) // 0.0001 (0.01% per period)
}

fn default_max_snapshot_age() -> u64 {
    60
}

fn default_basis_tolerance() -> Decimal {
    Decimal::new(5, 3) // 0.005 (0.5%)
}

fn default_yield_basis() -> YieldBasis {
    YieldBasis::PerPeriod
}

fn default_funding_interval_hours() -> u32 {
    8
}

fn default_breakeven_periods() -> u32 {
    9 // 72h hold
}

fn default_max_open_positions() -> u32 {
    3
}

fn default_max_total_notional() -> Decimal {
    Decimal::new(5000, 0)
}

fn default_max_pair_notional() -> Decimal {
    Decimal::new(2000, 0)
}

fn default_max_drawdown() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_capital_baseline() -> Decimal {
    Decimal::new(10000, 0)
}

fn default_balance_safety_buffer() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_basis_stop_loss() -> Decimal {
    Decimal::new(2, 2) // 0.02 (2% of notional)
}

fn default_max_daily_entries() -> u32 {
    10
}

fn default_max_holding_hours() -> u32 {
    72
}

fn default_leverage() -> u8 {
    3
}

fn default_max_leverage() -> u8 {
    10
}

fn default_fill_timeout() -> u64 {
    30
}

fn default_fill_poll_interval() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_retries() -> u8 {
    3
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_hedge_tolerance() -> Decimal {
    Decimal::new(1, 2) // 0.01 (1%)
}

fn default_spot_fee_rate() -> Decimal {
    Decimal::new(1, 3) // 0.001 (0.1%)
}

fn default_perp_fee_rate() -> Decimal {
    Decimal::new(4, 4) // 0.0004 (0.04%)
}

fn default_min_notional() -> Decimal {
    Decimal::new(10, 0)
}

fn default_max_balance_fraction() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_scan_interval() -> u64 {
    60
}

fn default_monitor_interval() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    120
}

fn default_db_path() -> String {
    "data/funding_arb.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("FARB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.pairs.is_empty(), "at least one trading pair is required");

        for pair in &self.pairs {
            anyhow::ensure!(
                pair.target_notional > Decimal::ZERO,
                "{}: target_notional must be positive",
                pair.symbol
            );
            anyhow::ensure!(
                pair.lot_size > Decimal::ZERO,
                "{}: lot_size must be positive",
                pair.symbol
            );
            if let Some(rate) = pair.min_funding_rate {
                anyhow::ensure!(
                    rate > Decimal::ZERO,
                    "{}: min_funding_rate must be positive",
                    pair.symbol
                );
            }
        }

        let mut symbols: Vec<&str> = self.pairs.iter().map(|p| p.symbol.as_str()).collect();
        symbols.sort_unstable();
        symbols.dedup();
        anyhow::ensure!(
            symbols.len() == self.pairs.len(),
            "trading pair symbols must be unique"
        );

        // A zero threshold would make a zero funding rate an opportunity with no direction
        anyhow::ensure!(
            self.signal.min_funding_rate > Decimal::ZERO,
            "min_funding_rate must be positive"
        );
        anyhow::ensure!(
            self.signal.min_hold_rate >= Decimal::ZERO
                && self.signal.min_hold_rate <= self.signal.min_funding_rate,
            "min_hold_rate must be between 0 and min_funding_rate"
        );
        anyhow::ensure!(
            self.signal.funding_interval_hours > 0,
            "funding_interval_hours must be positive"
        );
        anyhow::ensure!(
            self.signal.max_snapshot_age_secs > 0,
            "max_snapshot_age_secs must be positive"
        );

        anyhow::ensure!(
            self.risk.max_drawdown > Decimal::ZERO && self.risk.max_drawdown <= Decimal::ONE,
            "max_drawdown must be between 0 and 1"
        );
        anyhow::ensure!(
            self.risk.capital_baseline > Decimal::ZERO,
            "capital_baseline must be positive"
        );
        anyhow::ensure!(
            self.risk.max_pair_notional <= self.risk.max_total_notional,
            "max_pair_notional must not exceed max_total_notional"
        );

        anyhow::ensure!(
            self.execution.leverage >= 1 && self.execution.leverage <= self.execution.max_leverage,
            "leverage must be >= 1 and <= max_leverage"
        );
        anyhow::ensure!(
            self.execution.max_retries >= 1,
            "max_retries must be at least 1"
        );
        anyhow::ensure!(
            self.execution.fill_timeout_secs > 0,
            "fill_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.execution.max_balance_fraction > Decimal::ZERO
                && self.execution.max_balance_fraction <= Decimal::ONE,
            "max_balance_fraction must be between 0 and 1"
        );

        anyhow::ensure!(
            self.scheduler.scan_interval_secs > 0 && self.scheduler.monitor_interval_secs > 0,
            "scheduler intervals must be positive"
        );

        Ok(())
    }

    /// Look up a configured pair by symbol.
    pub fn pair(&self, symbol: &str) -> Option<&TradingPair> {
        self.pairs.iter().find(|p| p.symbol == symbol)
    }
}

impl ExecutionConfig {
    pub fn fill_timeout(&self) -> Duration {
        Duration::from_secs(self.fill_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            pairs: default_pairs(),
            signal: SignalConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            scheduler: SchedulerConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            http_timeout_secs: default_http_timeout(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_funding_rate: default_min_funding_rate(),
            min_hold_rate: default_min_hold_rate(),
            max_snapshot_age_secs: default_max_snapshot_age(),
            basis_tolerance: default_basis_tolerance(),
            yield_basis: default_yield_basis(),
            funding_interval_hours: default_funding_interval_hours(),
            breakeven_periods: default_breakeven_periods(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_positions: default_max_open_positions(),
            max_daily_entries: default_max_daily_entries(),
            max_total_notional: default_max_total_notional(),
            max_pair_notional: default_max_pair_notional(),
            max_drawdown: default_max_drawdown(),
            capital_baseline: default_capital_baseline(),
            balance_safety_buffer: default_balance_safety_buffer(),
            basis_stop_loss: default_basis_stop_loss(),
            max_holding_hours: default_max_holding_hours(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            leverage: default_leverage(),
            max_leverage: default_max_leverage(),
            fill_timeout_secs: default_fill_timeout(),
            fill_poll_interval_ms: default_fill_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            hedge_tolerance: default_hedge_tolerance(),
            spot_fee_rate: default_spot_fee_rate(),
            perp_fee_rate: default_perp_fee_rate(),
            min_notional: default_min_notional(),
            max_balance_fraction: default_max_balance_fraction(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            monitor_interval_secs: default_monitor_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_entry_threshold_is_invalid() {
        let mut config = Config::default();
        config.signal.min_funding_rate = Decimal::ZERO;
        config.signal.min_hold_rate = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hold_threshold_above_entry_is_invalid() {
        let mut config = Config::default();
        config.signal.min_hold_rate = dec!(0.01);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_pairs_are_invalid() {
        let mut config = Config::default();
        config.pairs = vec![TradingPair::new("BTCUSDT"), TradingPair::new("BTCUSDT")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_leverage_above_max_is_invalid() {
        let mut config = Config::default();
        config.execution.leverage = 20;
        assert!(config.validate().is_err());
    }
}
