//! Control loop: scan and monitor cadences over a single position ledger.
//!
//! The ledger sits behind one async mutex held for a whole cycle, so a scan
//! and a monitor pass never act on the same pair at the same time and every
//! gate decision sees a consistent ledger. Shutdown requests are observed
//! between protocol steps, never in the middle of a leg sequence.

mod clock;
mod events;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{EventKind, EventLog, EventSeverity, StatusEvent};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::exchange::{AccountBalance, ExchangeClient, FundingSnapshot, TradingPair};
use crate::ledger::{Direction, OpenRequest, Position, PositionLedger, PositionState};
use crate::persistence::StateStore;
use crate::risk::{EntryProposal, ExitEvaluator, ExitReason, RiskGate, RiskState, Verdict};
use crate::strategy::{
    size_position, CloseOutcome, ExecutionCoordinator, NoSignalReason, OpenOutcome, SignalEvaluator,
    SignalOutcome,
};

const EVENT_LOG_CAPACITY: usize = 100;

/// Point-in-time view for display and logging.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Every non-terminal position, manual-intervention ones included
    pub positions: Vec<Position>,
    pub cumulative_realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub risk: RiskState,
    pub force_close_all: bool,
    pub shutdown_requested: bool,
    pub sequence: u64,
    /// Scan and monitor passes run since start
    pub scan_cycles: u64,
    pub monitor_cycles: u64,
    pub recent_events: Vec<StatusEvent>,
}

#[derive(Debug, Default)]
struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

/// Cloneable handle for requesting shutdown from signal handlers.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    signal: Arc<ShutdownSignal>,
}

impl ShutdownHandle {
    /// Idempotent.
    pub fn request(&self) {
        if !self.signal.requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
        self.signal.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.signal.requested.load(Ordering::SeqCst)
    }
}

/// The decision and position-lifecycle engine.
pub struct Engine<S: StateStore> {
    config: Config,
    clock: Arc<dyn Clock>,
    signal: SignalEvaluator,
    gate: RiskGate,
    exits: ExitEvaluator,
    coordinator: ExecutionCoordinator,
    ledger: Mutex<PositionLedger<S>>,
    events: StdMutex<EventLog>,
    force_close_all: AtomicBool,
    shutdown: ShutdownHandle,
    scan_cycles: AtomicU64,
    monitor_cycles: AtomicU64,
}

impl<S: StateStore> Engine<S> {
    /// Build the engine and restore the ledger from the store.
    pub fn new(config: Config, exchange: Arc<dyn ExchangeClient>, clock: Arc<dyn Clock>, store: S) -> Result<Self> {
        let ledger = PositionLedger::load(store)?;
        Ok(Self {
            signal: SignalEvaluator::new(config.signal.clone(), &config.execution),
            gate: RiskGate::new(config.risk.clone()),
            exits: ExitEvaluator::new(&config.signal, &config.risk),
            coordinator: ExecutionCoordinator::new(exchange, clock.clone(), config.execution.clone()),
            ledger: Mutex::new(ledger),
            events: StdMutex::new(EventLog::new(EVENT_LOG_CAPACITY)),
            force_close_all: AtomicBool::new(false),
            shutdown: ShutdownHandle {
                signal: Arc::new(ShutdownSignal::default()),
            },
            scan_cycles: AtomicU64::new(0),
            monitor_cycles: AtomicU64::new(0),
            clock,
            config,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Stop scheduling new work. Safe to call any number of times.
    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }

    pub fn is_force_close_active(&self) -> bool {
        self.force_close_all.load(Ordering::SeqCst)
    }

    // ==================== Main Loop ====================

    /// Run both cadences until shutdown is requested, then wind down.
    pub async fn start(&self) -> Result<()> {
        info!(
            pairs = self.config.pairs.len(),
            scan_interval_secs = self.config.scheduler.scan_interval_secs,
            monitor_interval_secs = self.config.scheduler.monitor_interval_secs,
            "Engine starting"
        );

        if let Err(e) = self.resume_pending().await {
            self.report_cycle_error("resume", &e);
        }

        let scan_every = ChronoDuration::seconds(self.config.scheduler.scan_interval_secs as i64);
        let monitor_every = ChronoDuration::seconds(self.config.scheduler.monitor_interval_secs as i64);
        let mut next_scan = self.clock.now();
        let mut next_monitor = self.clock.now();

        while !self.is_shutdown_requested() {
            if self.clock.now() >= next_monitor {
                if let Err(e) = self.monitor_cycle().await {
                    self.report_cycle_error("monitor", &e);
                }
                next_monitor = self.clock.now() + monitor_every;
            }

            if self.is_shutdown_requested() {
                break;
            }

            if self.clock.now() >= next_scan {
                if let Err(e) = self.scan_cycle().await {
                    self.report_cycle_error("scan", &e);
                }
                next_scan = self.clock.now() + scan_every;
            }

            let wake = next_scan.min(next_monitor);
            let wait = (wake - self.clock.now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = self.clock.sleep(wait) => {}
                _ = self.shutdown.signal.notify.notified() => {}
            }
        }

        self.shutdown_sequence().await
    }

    // ==================== Cadences ====================

    /// Continue positions a previous run left OPENING or CLOSING.
    pub async fn resume_pending(&self) -> Result<()> {
        let mut ledger = self.ledger.lock().await;

        for pos in ledger.positions_in(PositionState::NeedsManualIntervention) {
            warn!(
                position_id = %pos.position_id,
                reason = pos.manual_reason.as_deref().unwrap_or("unknown"),
                "Position awaiting manual intervention"
            );
        }

        for pos in ledger.positions_in(PositionState::Opening) {
            let pair = self.pair_for(&pos);
            info!(position_id = %pos.position_id, "Resuming OPENING position");
            let outcome = self.coordinator.resume_open(&mut *ledger, &pair, &pos.position_id).await;
            self.report_open(&ledger, &pair, outcome)?;
        }

        for pos in ledger.positions_in(PositionState::Closing) {
            let reason = pos.exit_reason.clone().unwrap_or_else(|| "resumed close".to_string());
            self.close_position(&mut *ledger, &pos.position_id, &reason).await?;
        }

        Ok(())
    }

    /// Evaluate every idle pair and open approved positions.
    pub async fn scan_cycle(&self) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        if self.is_shutdown_requested() {
            return Ok(());
        }
        self.scan_cycles.fetch_add(1, Ordering::Relaxed);

        let risk = ledger.risk_state(self.config.risk.capital_baseline, self.clock.now());
        if self.gate.drawdown_breached(&risk) {
            self.raise_force_close(risk.running_drawdown);
        }
        if self.is_force_close_active() {
            debug!("Entries suspended while force-close is active");
            return Ok(());
        }

        let mut balance = match self.coordinator.fetch_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(error = %e, "Balance unavailable, skipping scan");
                return Ok(());
            }
        };

        for pair in &self.config.pairs {
            if self.is_shutdown_requested() {
                info!("Shutdown requested, stopping scan");
                break;
            }
            if let Some(existing) = ledger.active_for_pair(&pair.symbol) {
                debug!(pair = %pair.symbol, position_id = %existing.position_id, state = %existing.state, "Pair busy");
                continue;
            }

            let snapshot = match self.coordinator.fetch_snapshot(pair).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(pair = %pair.symbol, error = %e, "Funding snapshot unavailable");
                    continue;
                }
            };

            let Some((request_qty, notional, direction)) = self.screen(pair, &snapshot, balance) else {
                continue;
            };

            let proposal = EntryProposal {
                pair: pair.symbol.clone(),
                notional,
                leverage: self.config.execution.leverage,
                balance,
            };
            let decision = self
                .gate
                .evaluate(&ledger.risk_state(self.config.risk.capital_baseline, self.clock.now()), &proposal);
            if decision.force_close_all {
                let drawdown = ledger.risk_state(self.config.risk.capital_baseline, self.clock.now()).running_drawdown;
                self.raise_force_close(drawdown);
            }
            if let Verdict::Reject(reason) = decision.verdict {
                let rejection = EngineError::RiskRejected {
                    pair: pair.symbol.clone(),
                    reason: reason.to_string(),
                };
                self.reject_opportunity(&pair.symbol, rejection.to_string());
                if decision.force_close_all {
                    break;
                }
                continue;
            }

            let outcome = self
                .coordinator
                .open(
                    &mut *ledger,
                    OpenRequest {
                        pair,
                        direction,
                        quantity: request_qty,
                        notional,
                        leverage: self.config.execution.leverage,
                        snapshot: &snapshot,
                    },
                )
                .await;
            self.report_open(&ledger, pair, outcome)?;

            match self.coordinator.fetch_balance().await {
                Ok(fresh) => balance = fresh,
                Err(e) => {
                    warn!(error = %e, "Balance refresh failed, ending scan");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Accrue funding, mark to market, check drawdown and run exits.
    pub async fn monitor_cycle(&self) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        self.monitor_cycles.fetch_add(1, Ordering::Relaxed);
        let mut snapshots: HashMap<String, FundingSnapshot> = HashMap::new();

        for pos in ledger.positions_in(PositionState::Open) {
            let pair = self.pair_for(&pos);
            let snapshot = match self.coordinator.fetch_snapshot(&pair).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(position_id = %pos.position_id, error = %e, "Monitor snapshot unavailable");
                    continue;
                }
            };

            let now = self.clock.now();
            if !self.signal.is_fresh(&snapshot, now) {
                warn!(
                    position_id = %pos.position_id,
                    age_secs = (now - snapshot.observed_at).num_seconds(),
                    "Monitor snapshot stale, skipping mark and funding"
                );
                continue;
            }

            // Settlements passed since the last look: book them at the rate then in force
            if snapshot.next_funding_time > pos.next_funding_time {
                let rate = pos.last_funding_rate;
                let periods = settlements_between(
                    pos.next_funding_time,
                    snapshot.next_funding_time,
                    self.config.signal.funding_interval_hours,
                );
                let amount = pos
                    .direction
                    .funding_income(rate, pos.perp_leg.filled_qty, snapshot.mark_price)
                    * Decimal::from(periods);
                if periods > 1 {
                    info!(position_id = %pos.position_id, periods, "Booking missed funding settlements");
                }
                ledger.record_funding(
                    &pos.position_id,
                    amount,
                    rate,
                    snapshot.next_funding_time,
                    self.clock.now(),
                )?;
                self.record(EventKind::FundingAccrued {
                    position_id: pos.position_id.clone(),
                    amount,
                    funding_rate: rate,
                    periods,
                });
            }

            ledger.mark_to_market(&pos.position_id, &snapshot, self.clock.now())?;
            snapshots.insert(pos.position_id.clone(), snapshot);
        }

        let risk = ledger.risk_state(self.config.risk.capital_baseline, self.clock.now());
        if self.gate.drawdown_breached(&risk) {
            self.raise_force_close(risk.running_drawdown);
        }
        let force = self.is_force_close_active();

        let now = self.clock.now();
        let exits: Vec<(String, ExitReason)> = ledger
            .active_positions()
            .filter(|p| p.state == PositionState::Open)
            .filter_map(|p| {
                self.exits
                    .evaluate(p, snapshots.get(&p.position_id), force, now)
                    .map(|reason| (p.position_id.clone(), reason))
            })
            .collect();

        for (position_id, reason) in exits {
            if self.is_shutdown_requested() {
                // The shutdown sequence closes everything anyway
                break;
            }
            info!(%position_id, %reason, "Exit condition met");
            self.close_position(&mut *ledger, &position_id, &reason.to_string())
                .await?;
        }

        for pos in ledger.positions_in(PositionState::Closing) {
            let reason = pos.exit_reason.clone().unwrap_or_else(|| "resumed close".to_string());
            self.close_position(&mut *ledger, &pos.position_id, &reason).await?;
        }

        let risk = ledger.risk_state(self.config.risk.capital_baseline, self.clock.now());
        info!(
            open_positions = risk.open_position_count,
            exposure = %risk.total_notional_exposure,
            drawdown = %risk.running_drawdown.round_dp(4),
            realized_pnl = %ledger.cumulative_realized_pnl(),
            "Monitor cycle complete"
        );
        Ok(())
    }

    /// Close everything, bounded by the shutdown timeout, then flush.
    pub async fn shutdown_sequence(&self) -> Result<()> {
        self.request_shutdown();
        let mut ledger = self.ledger.lock().await;

        let active = ledger.active_positions().count();
        self.record(EventKind::ShutdownStarted {
            active_positions: active,
        });

        let deadline =
            self.clock.now() + ChronoDuration::seconds(self.config.scheduler.shutdown_timeout_secs as i64);
        let reason = ExitReason::Shutdown.to_string();

        loop {
            let pending: Vec<Position> = ledger
                .active_positions()
                .filter(|p| p.state != PositionState::NeedsManualIntervention)
                .cloned()
                .collect();
            if pending.is_empty() {
                break;
            }

            for pos in pending {
                let result = match pos.state {
                    PositionState::Opening => {
                        let pair = self.pair_for(&pos);
                        let outcome = self.coordinator.resume_open(&mut *ledger, &pair, &pos.position_id).await;
                        let opened = matches!(outcome, Ok(OpenOutcome::Opened { .. }));
                        match self.report_open(&ledger, &pair, outcome) {
                            Ok(()) if opened => self.close_position(&mut *ledger, &pos.position_id, &reason).await,
                            other => other,
                        }
                    }
                    _ => self.close_position(&mut *ledger, &pos.position_id, &reason).await,
                };
                if let Err(e) = result {
                    self.report_cycle_error("shutdown", &e);
                }
            }

            if self.clock.now() >= deadline {
                error!(
                    remaining = ledger.active_positions().count(),
                    "Shutdown timeout reached with positions still active"
                );
                break;
            }
            self.clock.sleep(self.config.execution.poll_interval()).await;
        }

        if let Err(e) = ledger.flush(self.clock.now()) {
            self.report_cycle_error("final flush", &e);
        }

        let remaining = ledger.active_positions().count();
        self.record(EventKind::ShutdownComplete {
            remaining_positions: remaining,
            cumulative_realized_pnl: ledger.cumulative_realized_pnl(),
        });
        info!(remaining, "Engine stopped");
        Ok(())
    }

    /// Open positions, P&L and risk figures.
    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let ledger = self.ledger.lock().await;
        let positions: Vec<Position> = ledger.active_positions().cloned().collect();
        let unrealized_pnl = positions.iter().map(|p| p.unrealized_pnl).sum();

        StatusSnapshot {
            positions,
            cumulative_realized_pnl: ledger.cumulative_realized_pnl(),
            unrealized_pnl,
            risk: ledger.risk_state(self.config.risk.capital_baseline, self.clock.now()),
            force_close_all: self.is_force_close_active(),
            shutdown_requested: self.is_shutdown_requested(),
            sequence: ledger.sequence(),
            scan_cycles: self.scan_cycles.load(Ordering::Relaxed),
            monitor_cycles: self.monitor_cycles.load(Ordering::Relaxed),
            recent_events: self.events().recent(),
        }
    }

    // ==================== Helpers ====================

    /// Signal, sizing and entry filters. Returns quantity, notional and direction.
    fn screen(
        &self,
        pair: &TradingPair,
        snapshot: &FundingSnapshot,
        balance: AccountBalance,
    ) -> Option<(Decimal, Decimal, Direction)> {
        let score = match self.signal.evaluate(pair, snapshot, self.clock.now()) {
            SignalOutcome::Opportunity(score) => score,
            SignalOutcome::NoSignal(NoSignalReason::Stale { age_secs, max_age_secs }) => {
                let stale = EngineError::StaleData {
                    pair: pair.symbol.clone(),
                    age_secs,
                    max_age_secs,
                };
                self.reject_opportunity(&pair.symbol, stale.to_string());
                return None;
            }
            SignalOutcome::NoSignal(reason) => {
                debug!(pair = %pair.symbol, %reason, "No signal");
                return None;
            }
        };

        info!(
            pair = %pair.symbol,
            direction = %score.direction,
            funding_rate = %score.funding_rate,
            expected_yield = %score.expected_periodic_yield,
            confidence = %score.confidence.round_dp(2),
            "Opportunity found"
        );

        let sizing = match size_position(pair, snapshot.spot_price, balance.total_free(), &self.config.execution) {
            Ok(sizing) => sizing,
            Err(rejection) => {
                self.reject_opportunity(&pair.symbol, rejection.to_string());
                return None;
            }
        };
        if let Err(rejection) = self.signal.check_entry(pair, &score, sizing.notional) {
            self.reject_opportunity(&pair.symbol, rejection.to_string());
            return None;
        }

        Some((sizing.quantity, sizing.notional, score.direction))
    }

    async fn close_position(&self, ledger: &mut PositionLedger<S>, position_id: &str, reason: &str) -> Result<()> {
        let pair = ledger.get(position_id).map(|p| p.pair.clone()).unwrap_or_default();
        match self.coordinator.close(ledger, position_id, reason).await {
            Ok(CloseOutcome::Closed { position_id, realized_pnl }) => {
                self.record(EventKind::PositionClosed {
                    position_id,
                    pair,
                    reason: reason.to_string(),
                    realized_pnl,
                });
                Ok(())
            }
            Ok(CloseOutcome::ManualIntervention { position_id, reason }) => {
                self.record(EventKind::ManualInterventionRequired {
                    position_id,
                    pair,
                    reason,
                });
                Ok(())
            }
            Ok(CloseOutcome::Skipped { position_id, state }) => {
                debug!(%position_id, %state, "Close skipped");
                Ok(())
            }
            Err(e) if e.is_persistence() => Err(e),
            Err(e) => {
                warn!(%position_id, error = %e, "Close attempt failed");
                Ok(())
            }
        }
    }

    fn report_open(
        &self,
        ledger: &PositionLedger<S>,
        pair: &TradingPair,
        outcome: Result<OpenOutcome>,
    ) -> Result<()> {
        match outcome {
            Ok(OpenOutcome::Opened { position_id }) => {
                if let Some(pos) = ledger.get(&position_id) {
                    self.record(EventKind::PositionOpened {
                        position_id: position_id.clone(),
                        pair: pos.pair.clone(),
                        direction: pos.direction.to_string(),
                        notional: pos.notional,
                        funding_rate: pos.entry_funding_rate,
                    });
                }
                Ok(())
            }
            Ok(OpenOutcome::Failed { position_id, reason }) => {
                self.record(EventKind::PositionFailed {
                    position_id,
                    pair: pair.symbol.clone(),
                    reason,
                });
                Ok(())
            }
            Ok(OpenOutcome::ManualIntervention { position_id, reason }) => {
                self.record(EventKind::ManualInterventionRequired {
                    position_id,
                    pair: pair.symbol.clone(),
                    reason,
                });
                Ok(())
            }
            Ok(OpenOutcome::AlreadyActive { position_id, state }) => {
                debug!(%position_id, %state, "Pair already has an active position");
                Ok(())
            }
            Err(e) if e.is_persistence() => Err(e),
            Err(e) => {
                self.reject_opportunity(&pair.symbol, e.to_string());
                Ok(())
            }
        }
    }

    /// Configured pair for a position, or one rebuilt from its legs.
    fn pair_for(&self, pos: &Position) -> TradingPair {
        self.config.pair(&pos.pair).cloned().unwrap_or_else(|| TradingPair {
            spot_instrument: pos.spot_leg.instrument.clone(),
            perp_instrument: pos.perp_leg.instrument.clone(),
            ..TradingPair::new(&pos.pair)
        })
    }

    fn raise_force_close(&self, drawdown: Decimal) {
        if !self.force_close_all.swap(true, Ordering::SeqCst) {
            self.record(EventKind::ForceCloseAll { drawdown });
        }
    }

    fn reject_opportunity(&self, pair: &str, reason: String) {
        self.record(EventKind::OpportunityRejected {
            pair: pair.to_string(),
            reason,
        });
    }

    fn report_cycle_error(&self, cycle: &str, err: &EngineError) {
        error!(cycle, error = %err, "Cycle aborted");
        if err.is_persistence() {
            self.record(EventKind::PersistenceFailure {
                detail: err.to_string(),
            });
        }
    }

    fn record(&self, kind: EventKind) {
        self.events().record(StatusEvent::new(kind, self.clock.now()));
    }

    fn events(&self) -> std::sync::MutexGuard<'_, EventLog> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Funding settlements between two settlement times, at least one.
///
/// The gap is rounded to whole intervals so small drifts in the venue's
/// next-funding timestamp do not add or drop a period.
fn settlements_between(from: DateTime<Utc>, to: DateTime<Utc>, interval_hours: u32) -> u32 {
    let interval_secs = i64::from(interval_hours.max(1)) * 3600;
    let gap_secs = (to - from).num_seconds().max(0);
    let periods = (gap_secs + interval_secs / 2) / interval_secs;
    u32::try_from(periods).unwrap_or(u32::MAX).max(1)
}
