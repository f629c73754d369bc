//! SQLite persistence for the position ledger.
//!
//! Persists engine state to survive restarts:
//! - Snapshot header (version, write sequence, cumulative realized P&L,
//!   entries made on the current day)
//! - Every non-terminal position
//! - History of closed and failed positions, for reporting
//!
//! Each save rewrites the snapshot and appends archived positions in a
//! single transaction.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::PersistenceError;
use crate::ledger::{Position, PositionState};

/// Current on-disk snapshot layout.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Durable image of the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSnapshot {
    pub version: u32,
    /// Monotonic write sequence
    pub sequence: u64,
    pub cumulative_realized_pnl: Decimal,
    pub pnl_high_water: Decimal,
    pub daily_entries: DailyEntries,
    /// Non-terminal positions only
    pub positions: Vec<Position>,
    pub saved_at: DateTime<Utc>,
}

/// Positions opened on one UTC day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyEntries {
    pub day: Option<NaiveDate>,
    pub count: u32,
}

impl DailyEntries {
    /// Entries made on `day`; a counter from an earlier day reads as zero.
    pub fn on(&self, day: NaiveDate) -> u32 {
        if self.day == Some(day) {
            self.count
        } else {
            0
        }
    }

    pub fn record(&mut self, day: NaiveDate) {
        self.count = self.on(day) + 1;
        self.day = Some(day);
    }
}

/// Durable storage for ledger snapshots.
pub trait StateStore: Send {
    /// Atomically replace the snapshot and append `archived` to history.
    fn save(&mut self, snapshot: &PersistedSnapshot, archived: &[Position]) -> Result<(), PersistenceError>;

    /// Last successfully saved snapshot, if any.
    fn load(&self) -> Result<Option<PersistedSnapshot>, PersistenceError>;
}

impl<S: StateStore + ?Sized> StateStore for Box<S> {
    fn save(&mut self, snapshot: &PersistedSnapshot, archived: &[Position]) -> Result<(), PersistenceError> {
        (**self).save(snapshot, archived)
    }

    fn load(&self) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        (**self).load()
    }
}

/// SQLite-backed state store.
pub struct SqliteStateStore {
    conn: Connection,
}

impl SqliteStateStore {
    /// Open (or create) the database at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, PersistenceError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PersistenceError::Corrupt(format!("cannot create {:?}: {}", parent, e)))?;
            }
        }
        let conn = Connection::open(db_path.as_ref())?;
        let store = Self { conn };
        store.init_schema()?;

        info!("State store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// Throwaway in-memory database.
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            r#"
            -- Snapshot header (singleton row)
            CREATE TABLE IF NOT EXISTS engine_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                cumulative_realized_pnl TEXT NOT NULL,
                pnl_high_water TEXT NOT NULL,
                entries_day TEXT,
                entries_on_day INTEGER NOT NULL DEFAULT 0,
                saved_at TEXT NOT NULL
            );

            -- Non-terminal positions
            CREATE TABLE IF NOT EXISTS positions (
                position_id TEXT PRIMARY KEY,
                pair TEXT NOT NULL,
                state TEXT NOT NULL,
                body TEXT NOT NULL
            );

            -- Closed and failed positions
            CREATE TABLE IF NOT EXISTS position_history (
                position_id TEXT PRIMARY KEY,
                pair TEXT NOT NULL,
                state TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                close_time TEXT,
                notional TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                funding TEXT NOT NULL,
                fees TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_pair ON position_history(pair);
            CREATE INDEX IF NOT EXISTS idx_history_close ON position_history(close_time);
            "#,
        )?;

        // Databases written before the daily entry counter existed
        let has_entries: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('engine_state') WHERE name = 'entries_day'",
            [],
            |row| row.get(0),
        )?;
        if !has_entries {
            self.conn.execute_batch(
                r#"
                ALTER TABLE engine_state ADD COLUMN entries_day TEXT;
                ALTER TABLE engine_state ADD COLUMN entries_on_day INTEGER NOT NULL DEFAULT 0;
                "#,
            )?;
            info!("engine_state migrated with daily entry columns");
        }

        debug!("Database schema initialized");
        Ok(())
    }

    /// Archived positions, oldest first.
    pub fn history(&self) -> Result<Vec<Position>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM position_history ORDER BY close_time, position_id")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(PersistenceError::from))
            .collect()
    }

    /// Trading report over all archived positions.
    pub fn performance_summary(&self) -> Result<PerformanceSummary, PersistenceError> {
        Ok(PerformanceSummary::from_history(&self.history()?))
    }
}

impl StateStore for SqliteStateStore {
    fn save(&mut self, snapshot: &PersistedSnapshot, archived: &[Position]) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO engine_state
                (id, version, sequence, cumulative_realized_pnl, pnl_high_water,
                 entries_day, entries_on_day, saved_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                version = ?1,
                sequence = ?2,
                cumulative_realized_pnl = ?3,
                pnl_high_water = ?4,
                entries_day = ?5,
                entries_on_day = ?6,
                saved_at = ?7
            "#,
            params![
                snapshot.version,
                snapshot.sequence as i64,
                snapshot.cumulative_realized_pnl.to_string(),
                snapshot.pnl_high_water.to_string(),
                snapshot.daily_entries.day.map(|d| d.to_string()),
                snapshot.daily_entries.count,
                snapshot.saved_at.to_rfc3339(),
            ],
        )?;

        // Clear and reinsert positions
        tx.execute("DELETE FROM positions", [])?;
        for pos in &snapshot.positions {
            tx.execute(
                "INSERT INTO positions (position_id, pair, state, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    pos.position_id,
                    pos.pair,
                    pos.state.as_str(),
                    serde_json::to_string(pos)?,
                ],
            )?;
        }

        for pos in archived {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO position_history
                    (position_id, pair, state, entry_time, close_time, notional,
                     realized_pnl, funding, fees, body)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    pos.position_id,
                    pos.pair,
                    pos.state.as_str(),
                    pos.entry_time.to_rfc3339(),
                    pos.close_time.map(|t| t.to_rfc3339()),
                    pos.notional.to_string(),
                    pos.realized_pnl.to_string(),
                    pos.funding_accrued.to_string(),
                    pos.total_fees().to_string(),
                    serde_json::to_string(pos)?,
                ],
            )?;
        }

        tx.commit()?;

        debug!(
            sequence = snapshot.sequence,
            positions = snapshot.positions.len(),
            archived = archived.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        type Header = (u32, i64, String, String, Option<String>, u32, String);
        let header: Option<Header> = self
            .conn
            .query_row(
                r#"
                SELECT version, sequence, cumulative_realized_pnl, pnl_high_water,
                       entries_day, entries_on_day, saved_at
                FROM engine_state WHERE id = 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((version, sequence, realized, high_water, entries_day, entries_on_day, saved_at)) = header else {
            return Ok(None);
        };

        if version != SNAPSHOT_VERSION {
            return Err(PersistenceError::Corrupt(format!(
                "unsupported snapshot version {} (expected {})",
                version, SNAPSHOT_VERSION
            )));
        }

        let mut stmt = self
            .conn
            .prepare("SELECT body FROM positions ORDER BY position_id")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let positions = bodies
            .iter()
            .map(|body| serde_json::from_str::<Position>(body))
            .collect::<Result<Vec<_>, _>>()?;

        let snapshot = PersistedSnapshot {
            version,
            sequence: sequence as u64,
            cumulative_realized_pnl: parse_decimal(&realized)?,
            pnl_high_water: parse_decimal(&high_water)?,
            daily_entries: DailyEntries {
                day: entries_day
                    .map(|d| {
                        NaiveDate::from_str(&d)
                            .map_err(|e| PersistenceError::Corrupt(format!("entries_day {:?}: {}", d, e)))
                    })
                    .transpose()?,
                count: entries_on_day,
            },
            positions,
            saved_at: DateTime::parse_from_rfc3339(&saved_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| PersistenceError::Corrupt(format!("saved_at: {}", e)))?,
        };

        info!(
            sequence = snapshot.sequence,
            positions = snapshot.positions.len(),
            realized_pnl = %snapshot.cumulative_realized_pnl,
            "Loaded snapshot from database"
        );

        Ok(Some(snapshot))
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, PersistenceError> {
    Decimal::from_str(raw).map_err(|e| PersistenceError::Corrupt(format!("decimal {:?}: {}", raw, e)))
}

// ==================== Reporting ====================

/// Aggregate results over archived positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub closed_positions: u32,
    pub failed_positions: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: Decimal,
    pub total_realized_pnl: Decimal,
    pub total_fees: Decimal,
    pub total_funding: Decimal,
    /// Gross profit / gross loss (zero when there are no losses)
    pub profit_factor: Decimal,
}

impl PerformanceSummary {
    pub fn from_history(history: &[Position]) -> Self {
        let mut summary = Self::default();
        let mut gross_profit = Decimal::ZERO;
        let mut gross_loss = Decimal::ZERO;

        for pos in history {
            match pos.state {
                PositionState::Closed => summary.closed_positions += 1,
                PositionState::Failed => summary.failed_positions += 1,
                _ => continue,
            }

            if pos.realized_pnl > Decimal::ZERO {
                summary.wins += 1;
                gross_profit += pos.realized_pnl;
            } else if pos.realized_pnl < Decimal::ZERO {
                summary.losses += 1;
                gross_loss += pos.realized_pnl.abs();
            }

            summary.total_realized_pnl += pos.realized_pnl;
            summary.total_fees += pos.total_fees();
            summary.total_funding += pos.funding_accrued;
        }

        let decided = summary.wins + summary.losses;
        if decided > 0 {
            summary.win_rate = Decimal::from(summary.wins) / Decimal::from(decided);
        }
        summary.profit_factor = crate::utils::safe_div(gross_profit, gross_loss);
        summary
    }
}
