//! Error taxonomy for the arbitrage engine.
//!
//! Exchange failures are classified once, at the client boundary, into the
//! three kinds the engine reacts to differently. Engine errors cover the
//! decision/lifecycle failures plus ledger contract violations.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::ledger::PositionState;

/// Failure of a call to the exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// Network error, timeout, rate limit or 5xx. Safe to retry with backoff.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// The exchange refused the request (bad quantity, insufficient funds, ...).
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Credentials missing, invalid or lacking permission.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ExchangeError {
    /// Only transient failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }
}

/// Persistence failures from the state store.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
}

/// Errors raised by the decision and position-lifecycle engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("stale market data for {pair}: {age_secs}s old (max {max_age_secs}s)")]
    StaleData {
        pair: String,
        age_secs: i64,
        max_age_secs: u64,
    },

    #[error("risk gate rejected {pair}: {reason}")]
    RiskRejected { pair: String, reason: String },

    #[error("order rejected for {instrument}: {source}")]
    OrderRejected {
        instrument: String,
        #[source]
        source: ExchangeError,
    },

    /// A placement may or may not have reached the venue and the lookup by
    /// client id could not tell.
    #[error("order {client_order_id} on {instrument} in unknown state: {reason}")]
    OrderStateUnknown {
        instrument: String,
        client_order_id: String,
        reason: String,
    },

    #[error("fill timeout on {instrument} after {waited_secs}s")]
    FillTimeout { instrument: String, waited_secs: u64 },

    #[error("partial hedge failure on position {position_id}: {reason}")]
    PartialHedgeFailure { position_id: String, reason: String },

    #[error("state store write failed: {0}")]
    PersistenceFailure(#[from] PersistenceError),

    #[error("position {position_id} blocked: last state flush did not succeed")]
    FlushPending { position_id: String },

    #[error("position {position_id} requires manual intervention: {reason}")]
    ManualInterventionRequired { position_id: String, reason: String },

    #[error("illegal transition for position {position_id}: {from} -> {to}")]
    IllegalTransition {
        position_id: String,
        from: PositionState,
        to: PositionState,
    },

    #[error("pair {pair} already has active position {position_id}")]
    DuplicatePosition { pair: String, position_id: String },

    #[error("unknown position {0}")]
    UnknownPosition(String),

    #[error("hedge mismatch on position {position_id}: spot {spot_qty} vs perp {perp_qty}")]
    HedgeMismatch {
        position_id: String,
        spot_qty: Decimal,
        perp_qty: Decimal,
    },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl EngineError {
    /// Persistence problems halt the current cycle rather than a single pair.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            EngineError::PersistenceFailure(_) | EngineError::FlushPending { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
