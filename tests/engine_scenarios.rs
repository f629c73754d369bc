//! End-to-end lifecycle scenarios against the paper exchange and a virtual clock.

use chrono::{Duration, TimeZone, Utc};
use funding_arb::config::Config;
use funding_arb::engine::{Clock, Engine, EventKind, ManualClock, StatusEvent};
use funding_arb::exchange::{ExchangeClient, FillBehavior, Market, OrderRequest, OrderSide, PaperExchange, TradingPair};
use funding_arb::error::PersistenceError;
use funding_arb::ledger::{Direction, LegSlot, OpenRequest, Position, PositionLedger, PositionState};
use funding_arb::persistence::{PersistedSnapshot, SqliteStateStore, StateStore};
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Harness {
    clock: Arc<ManualClock>,
    exchange: Arc<PaperExchange>,
    engine: Engine<SqliteStateStore>,
}

fn config(symbols: &[&str]) -> Config {
    Config {
        pairs: symbols.iter().map(|s| TradingPair::new(s)).collect(),
        ..Config::default()
    }
}

fn temp_db(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("funding-arb-{}-{}.db", name, std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

async fn paper(config: &Config, clock: &Arc<ManualClock>) -> Arc<PaperExchange> {
    let exchange = Arc::new(PaperExchange::with_clock(dec!(20000), clock.clone()));
    for pair in &config.pairs {
        exchange.register_pair(pair).await;
        exchange
            .set_market(&pair.symbol, dec!(100), dec!(100.2), dec!(0.0015))
            .await;
    }
    exchange
}

async fn harness_with_store(config: Config, store: SqliteStateStore) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
    let exchange = paper(&config, &clock).await;
    let engine = Engine::new(config, exchange.clone(), clock.clone(), store).unwrap();
    Harness { clock, exchange, engine }
}

async fn harness(config: Config) -> Harness {
    harness_with_store(config, SqliteStateStore::in_memory().unwrap()).await
}

fn count_events(events: &[StatusEvent], pred: impl Fn(&EventKind) -> bool) -> usize {
    events.iter().filter(|e| pred(&e.kind)).count()
}

#[tokio::test]
async fn positive_funding_opens_long_spot_short_perp() {
    let h = harness(config(&["BTCUSDT"])).await;

    h.engine.scan_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert_eq!(status.positions.len(), 1);
    let pos = &status.positions[0];
    assert_eq!(pos.state, PositionState::Open);
    assert_eq!(pos.direction, Direction::LongSpotShortPerp);
    assert_eq!(pos.spot_leg.filled_qty, dec!(10));
    assert_eq!(pos.perp_leg.filled_qty, dec!(10));
    assert_eq!(pos.leverage, 3);

    assert_eq!(h.exchange.net_position(Market::Spot, "BTCUSDT").await, dec!(10));
    assert_eq!(h.exchange.net_position(Market::Perp, "BTCUSDT").await, dec!(-10));
    assert_eq!(h.exchange.leverage("BTCUSDT").await, Some(3));

    // Perp leg goes first
    let orders = h.exchange.placed_orders().await;
    assert_eq!(orders[0].market, Market::Perp);
    assert_eq!(orders[0].side, OrderSide::Sell);
    assert_eq!(orders[1].market, Market::Spot);

    assert_eq!(
        count_events(&status.recent_events, |k| matches!(k, EventKind::PositionOpened { .. })),
        1
    );
}

#[tokio::test]
async fn repeated_scans_never_duplicate_a_pair() {
    let h = harness(config(&["BTCUSDT"])).await;

    h.engine.scan_cycle().await.unwrap();
    let orders_after_first = h.exchange.placed_orders().await.len();
    h.engine.scan_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert_eq!(status.positions.len(), 1);
    assert_eq!(h.exchange.placed_orders().await.len(), orders_after_first);
}

#[tokio::test]
async fn shutdown_closes_every_open_position() {
    let db = temp_db("shutdown");
    let h = harness_with_store(config(&["BTCUSDT", "ETHUSDT"]), SqliteStateStore::open(&db).unwrap()).await;

    h.engine.scan_cycle().await.unwrap();
    assert_eq!(h.engine.status_snapshot().await.positions.len(), 2);

    h.engine.request_shutdown();
    h.engine.request_shutdown();
    h.engine.shutdown_sequence().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert!(status.positions.is_empty());
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(k, EventKind::PositionClosed { .. })),
        2
    );
    for symbol in ["BTCUSDT", "ETHUSDT"] {
        assert_eq!(h.exchange.net_position(Market::Spot, symbol).await, dec!(0));
        assert_eq!(h.exchange.net_position(Market::Perp, symbol).await, dec!(0));
    }

    let store = SqliteStateStore::open(&db).unwrap();
    let snapshot = store.load().unwrap().unwrap();
    assert!(snapshot.positions.is_empty());
    assert_eq!(snapshot.cumulative_realized_pnl, status.cumulative_realized_pnl);
    assert_eq!(store.performance_summary().unwrap().closed_positions, 2);

    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn drawdown_breach_force_closes_everything() {
    let mut cfg = config(&["BTCUSDT", "ETHUSDT"]);
    cfg.risk.capital_baseline = dec!(1000);
    cfg.risk.max_drawdown = dec!(0.05);
    cfg.risk.basis_stop_loss = dec!(0.5);
    let h = harness(cfg).await;

    h.engine.scan_cycle().await.unwrap();
    assert_eq!(h.engine.status_snapshot().await.positions.len(), 2);

    // Perp rallies 6 against the 10-unit short on one pair only: -60 on 1000
    h.exchange
        .set_market("BTCUSDT", dec!(100), dec!(106.2), dec!(0.0015))
        .await;
    h.engine.monitor_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert!(status.force_close_all);
    assert!(status.positions.is_empty());
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(k, EventKind::ForceCloseAll { .. })),
        1
    );
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(
            k,
            EventKind::PositionClosed { reason, .. } if reason == "force close all"
        )),
        2
    );

    // No new entries while force-close is latched
    let orders = h.exchange.placed_orders().await.len();
    h.engine.scan_cycle().await.unwrap();
    assert_eq!(h.exchange.placed_orders().await.len(), orders);
}

#[tokio::test]
async fn rejected_second_leg_unwinds_to_failed() {
    let h = harness(config(&["BTCUSDT"])).await;
    h.exchange
        .script(Market::Spot, "BTCUSDT", vec![FillBehavior::Reject("insufficient balance".into())])
        .await;

    h.engine.scan_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert!(status.positions.is_empty());
    assert_eq!(h.exchange.net_position(Market::Perp, "BTCUSDT").await, dec!(0));
    assert_eq!(h.exchange.net_position(Market::Spot, "BTCUSDT").await, dec!(0));
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(k, EventKind::PositionFailed { .. })),
        1
    );
    // Unwind order reduces only
    let orders = h.exchange.placed_orders().await;
    let unwind = orders.last().unwrap();
    assert_eq!(unwind.market, Market::Perp);
    assert_eq!(unwind.side, OrderSide::Buy);
    assert!(unwind.reduce_only);
}

#[tokio::test]
async fn failed_unwind_escalates_and_is_left_alone() {
    let h = harness(config(&["BTCUSDT"])).await;
    h.exchange
        .script(Market::Spot, "BTCUSDT", vec![FillBehavior::Reject("insufficient balance".into())])
        .await;
    h.exchange
        .script(
            Market::Perp,
            "BTCUSDT",
            vec![FillBehavior::Immediate, FillBehavior::Reject("reduce only rejected".into())],
        )
        .await;

    h.engine.scan_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert_eq!(status.positions.len(), 1);
    assert_eq!(status.positions[0].state, PositionState::NeedsManualIntervention);
    assert!(status.positions[0].manual_reason.is_some());
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(
            k,
            EventKind::ManualInterventionRequired { .. }
        )),
        1
    );

    let orders = h.exchange.placed_orders().await.len();
    h.engine.monitor_cycle().await.unwrap();
    h.engine.scan_cycle().await.unwrap();
    h.engine.shutdown_sequence().await.unwrap();
    assert_eq!(h.exchange.placed_orders().await.len(), orders);

    let status = h.engine.status_snapshot().await;
    assert_eq!(status.positions.len(), 1);
    assert!(matches!(
        status.recent_events.last().map(|e| &e.kind),
        Some(EventKind::ShutdownComplete { remaining_positions: 1, .. })
    ));
}

#[tokio::test]
async fn funding_settlement_is_accrued_once() {
    let h = harness(config(&["BTCUSDT"])).await;
    h.engine.scan_cycle().await.unwrap();
    let entry_funding_time = h.engine.status_snapshot().await.positions[0].next_funding_time;

    h.clock.set(entry_funding_time + Duration::seconds(5));
    h.exchange
        .set_market("BTCUSDT", dec!(100), dec!(100.2), dec!(0.0015))
        .await;
    h.exchange
        .set_next_funding_time("BTCUSDT", entry_funding_time + Duration::hours(8))
        .await;
    h.engine.monitor_cycle().await.unwrap();
    h.engine.monitor_cycle().await.unwrap();

    let pos = &h.engine.status_snapshot().await.positions[0];
    // 0.0015 * 10 * 100.2
    assert_eq!(pos.funding_accrued, dec!(1.503));
    assert_eq!(pos.next_funding_time, entry_funding_time + Duration::hours(8));
    assert_eq!(pos.state, PositionState::Open);
}

#[tokio::test]
async fn funding_flip_closes_position() {
    let h = harness(config(&["BTCUSDT"])).await;
    h.engine.scan_cycle().await.unwrap();

    h.exchange
        .set_market("BTCUSDT", dec!(100), dec!(100.1), dec!(-0.0003))
        .await;
    h.engine.monitor_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert!(status.positions.is_empty());
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(
            k,
            EventKind::PositionClosed { reason, .. } if reason.contains("flipped")
        )),
        1
    );
}

#[tokio::test]
async fn restart_restores_open_positions_exactly() {
    let db = temp_db("restart");
    let cfg = config(&["BTCUSDT"]);

    let first = harness_with_store(cfg.clone(), SqliteStateStore::open(&db).unwrap()).await;
    first.engine.scan_cycle().await.unwrap();
    let before = first.engine.status_snapshot().await;
    drop(first);

    let second = harness_with_store(cfg, SqliteStateStore::open(&db).unwrap()).await;
    let after = second.engine.status_snapshot().await;

    assert_eq!(after.positions, before.positions);
    assert_eq!(after.cumulative_realized_pnl, before.cumulative_realized_pnl);

    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn interrupted_open_is_unwound_on_resume() {
    let db = temp_db("resume");
    let cfg = config(&["BTCUSDT"]);
    let pair = cfg.pairs[0].clone();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
    let exchange = paper(&cfg, &clock).await;

    // Crash after the perp order went out but before its fill was recorded
    {
        let mut ledger = PositionLedger::load(SqliteStateStore::open(&db).unwrap()).unwrap();
        let snapshot = exchange.get_funding_rate(&pair).await.unwrap();
        let id = ledger
            .begin_open(
                OpenRequest {
                    pair: &pair,
                    direction: Direction::LongSpotShortPerp,
                    quantity: dec!(10),
                    notional: dec!(1000),
                    leverage: 3,
                    snapshot: &snapshot,
                },
                clock.now(),
            )
            .unwrap();
        let handle = exchange
            .place_order(&OrderRequest::market(Market::Perp, "BTCUSDT", OrderSide::Sell, dec!(10)))
            .await
            .unwrap();
        ledger
            .record_leg_order(&id, LegSlot::Entry(Market::Perp), handle, clock.now())
            .unwrap();
    }
    assert_eq!(exchange.net_position(Market::Perp, "BTCUSDT").await, dec!(-10));

    let engine = Engine::new(cfg, exchange.clone(), clock.clone(), SqliteStateStore::open(&db).unwrap()).unwrap();
    let restored = engine.status_snapshot().await;
    assert_eq!(restored.positions.len(), 1);
    assert_eq!(restored.positions[0].state, PositionState::Opening);

    engine.resume_pending().await.unwrap();

    let status = engine.status_snapshot().await;
    assert!(status.positions.is_empty());
    assert_eq!(exchange.net_position(Market::Perp, "BTCUSDT").await, dec!(0));
    assert_eq!(exchange.net_position(Market::Spot, "BTCUSDT").await, dec!(0));
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(k, EventKind::PositionFailed { .. })),
        1
    );

    let _ = std::fs::remove_file(&db);
}

/// Store whose writes can be switched off mid-run.
struct FlakyStore {
    inner: SqliteStateStore,
    failing: Arc<AtomicBool>,
}

impl StateStore for FlakyStore {
    fn save(&mut self, snapshot: &PersistedSnapshot, archived: &[Position]) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Corrupt("disk full".into()));
        }
        self.inner.save(snapshot, archived)
    }

    fn load(&self) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        self.inner.load()
    }
}

#[tokio::test]
async fn old_quote_is_never_traded() {
    let h = harness(config(&["BTCUSDT"])).await;
    // Quote taken at t0, nothing refreshed since
    h.clock.advance(Duration::hours(6));

    h.engine.scan_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert!(status.positions.is_empty());
    assert!(h.exchange.placed_orders().await.is_empty());
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(
            k,
            EventKind::OpportunityRejected { reason, .. } if reason.contains("stale")
        )),
        1
    );
}

#[tokio::test]
async fn monitor_ignores_old_quotes_until_refreshed() {
    let h = harness(config(&["BTCUSDT"])).await;
    h.engine.scan_cycle().await.unwrap();
    let entry_funding_time = h.engine.status_snapshot().await.positions[0].next_funding_time;

    h.clock.set(entry_funding_time + Duration::hours(1));
    h.exchange
        .set_next_funding_time("BTCUSDT", entry_funding_time + Duration::hours(8))
        .await;
    h.engine.monitor_cycle().await.unwrap();
    assert_eq!(h.engine.status_snapshot().await.positions[0].funding_accrued, dec!(0));

    h.exchange
        .set_market("BTCUSDT", dec!(100), dec!(100.2), dec!(0.0015))
        .await;
    h.engine.monitor_cycle().await.unwrap();
    assert_eq!(h.engine.status_snapshot().await.positions[0].funding_accrued, dec!(1.503));
}

#[tokio::test]
async fn missed_settlements_are_booked_on_the_next_pass() {
    let h = harness(config(&["BTCUSDT"])).await;
    h.engine.scan_cycle().await.unwrap();
    let entry_funding_time = h.engine.status_snapshot().await.positions[0].next_funding_time;

    // Monitor was down across three settlements
    h.clock.set(entry_funding_time + Duration::hours(16) + Duration::seconds(5));
    h.exchange
        .set_market("BTCUSDT", dec!(100), dec!(100.2), dec!(0.0015))
        .await;
    h.exchange
        .set_next_funding_time("BTCUSDT", entry_funding_time + Duration::hours(24))
        .await;
    h.engine.monitor_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    // 3 * 0.0015 * 10 * 100.2
    assert_eq!(status.positions[0].funding_accrued, dec!(4.509));
    assert_eq!(status.positions[0].next_funding_time, entry_funding_time + Duration::hours(24));
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(
            k,
            EventKind::FundingAccrued { periods: 3, .. }
        )),
        1
    );
}

#[tokio::test]
async fn lost_order_response_is_adopted_not_resubmitted() {
    let h = harness(config(&["BTCUSDT"])).await;
    h.exchange
        .script(Market::Perp, "BTCUSDT", vec![FillBehavior::LostAck])
        .await;

    h.engine.scan_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert_eq!(status.positions.len(), 1);
    assert_eq!(status.positions[0].state, PositionState::Open);
    assert_eq!(status.positions[0].perp_leg.order_ids.len(), 1);
    assert_eq!(h.exchange.net_position(Market::Perp, "BTCUSDT").await, dec!(-10));
    assert_eq!(h.exchange.net_position(Market::Spot, "BTCUSDT").await, dec!(10));

    let perp_orders = h
        .exchange
        .placed_orders()
        .await
        .into_iter()
        .filter(|o| o.market == Market::Perp)
        .count();
    assert_eq!(perp_orders, 1);
}

#[tokio::test]
async fn unfilled_second_leg_times_out_and_unwinds() {
    let h = harness(config(&["BTCUSDT"])).await;
    h.exchange
        .script(Market::Spot, "BTCUSDT", vec![FillBehavior::Never])
        .await;
    let started = h.clock.now();

    h.engine.scan_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert!(status.positions.is_empty());
    assert!(h.clock.now() - started >= Duration::seconds(30));
    assert_eq!(h.exchange.net_position(Market::Perp, "BTCUSDT").await, dec!(0));
    assert_eq!(h.exchange.net_position(Market::Spot, "BTCUSDT").await, dec!(0));
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(
            k,
            EventKind::PositionFailed { reason, .. } if reason.contains("fill timeout")
        )),
        1
    );
}

#[tokio::test]
async fn interrupted_close_is_finished_on_resume() {
    let db = temp_db("resume-close");
    let cfg = config(&["BTCUSDT"]);
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
    let exchange = paper(&cfg, &clock).await;

    let first = Engine::new(cfg.clone(), exchange.clone(), clock.clone(), SqliteStateStore::open(&db).unwrap()).unwrap();
    first.scan_cycle().await.unwrap();
    drop(first);

    // Crash after the exit perp order went out but before its fill was recorded
    {
        let mut ledger = PositionLedger::load(SqliteStateStore::open(&db).unwrap()).unwrap();
        let id = ledger.positions_in(PositionState::Open)[0].position_id.clone();
        ledger.begin_close(&id, "funding flipped", clock.now()).unwrap();
        let handle = exchange
            .place_order(&OrderRequest::market(Market::Perp, "BTCUSDT", OrderSide::Buy, dec!(10)).reduce_only())
            .await
            .unwrap();
        ledger
            .record_leg_order(&id, LegSlot::Exit(Market::Perp), handle, clock.now())
            .unwrap();
    }

    let engine = Engine::new(cfg, exchange.clone(), clock.clone(), SqliteStateStore::open(&db).unwrap()).unwrap();
    assert_eq!(engine.status_snapshot().await.positions[0].state, PositionState::Closing);
    let orders_before = exchange.placed_orders().await.len();

    engine.resume_pending().await.unwrap();

    let status = engine.status_snapshot().await;
    assert!(status.positions.is_empty());
    assert_eq!(exchange.net_position(Market::Perp, "BTCUSDT").await, dec!(0));
    assert_eq!(exchange.net_position(Market::Spot, "BTCUSDT").await, dec!(0));
    // Only the spot exit is new; the perp exit was re-attached
    assert_eq!(exchange.placed_orders().await.len(), orders_before + 1);
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(
            k,
            EventKind::PositionClosed { reason, .. } if reason == "funding flipped"
        )),
        1
    );

    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn shutdown_gives_up_after_its_timeout() {
    let failing = Arc::new(AtomicBool::new(false));
    let cfg = config(&["BTCUSDT"]);
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
    let exchange = paper(&cfg, &clock).await;
    let store = FlakyStore {
        inner: SqliteStateStore::in_memory().unwrap(),
        failing: failing.clone(),
    };
    let engine = Engine::new(cfg, exchange.clone(), clock.clone(), store).unwrap();

    engine.scan_cycle().await.unwrap();
    assert_eq!(engine.status_snapshot().await.positions.len(), 1);
    let orders = exchange.placed_orders().await.len();

    failing.store(true, Ordering::SeqCst);
    let started = clock.now();
    engine.shutdown_sequence().await.unwrap();
    let elapsed = clock.now() - started;

    assert!(elapsed >= Duration::seconds(120), "stopped after {}", elapsed);
    assert!(elapsed < Duration::seconds(130), "overran to {}", elapsed);
    // No order may go out while its record cannot be persisted
    assert_eq!(exchange.placed_orders().await.len(), orders);
    assert_eq!(exchange.net_position(Market::Perp, "BTCUSDT").await, dec!(-10));

    let status = engine.status_snapshot().await;
    assert!(count_events(&status.recent_events, |k| matches!(k, EventKind::PersistenceFailure { .. })) > 0);
    assert!(matches!(
        status.recent_events.last().map(|e| &e.kind),
        Some(EventKind::ShutdownComplete { remaining_positions: 1, .. })
    ));
}

#[tokio::test]
async fn start_runs_both_cadences_until_shutdown() {
    let h = harness(config(&["BTCUSDT"])).await;
    let t0 = h.clock.now();
    let stop_at = t0 + Duration::seconds(600);

    let driver = async {
        loop {
            // Keep the quote live as virtual time moves
            h.exchange
                .set_market("BTCUSDT", dec!(100), dec!(100.2), dec!(0.0015))
                .await;
            if h.clock.now() >= stop_at {
                h.engine.request_shutdown();
                break;
            }
            tokio::task::yield_now().await;
        }
    };
    let (result, ()) = tokio::join!(h.engine.start(), driver);
    result.unwrap();

    let status = h.engine.status_snapshot().await;
    assert!((10..=11).contains(&status.scan_cycles), "scans: {}", status.scan_cycles);
    assert!((60..=61).contains(&status.monitor_cycles), "monitors: {}", status.monitor_cycles);
    assert!(status.monitor_cycles > status.scan_cycles);

    assert!(status.positions.is_empty());
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(
            k,
            EventKind::PositionClosed { reason, .. } if reason == "shutdown"
        )),
        1
    );
    assert_eq!(h.exchange.net_position(Market::Perp, "BTCUSDT").await, dec!(0));
}

#[tokio::test]
async fn daily_entry_limit_holds_until_the_next_day() {
    let mut cfg = config(&["BTCUSDT", "ETHUSDT"]);
    cfg.risk.max_daily_entries = 1;
    let h = harness(cfg).await;

    h.engine.scan_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert_eq!(status.positions.len(), 1);
    assert_eq!(status.risk.entries_today, 1);
    assert_eq!(
        count_events(&status.recent_events, |k| matches!(
            k,
            EventKind::OpportunityRejected { pair, reason } if pair == "ETHUSDT" && reason.contains("daily entry limit")
        )),
        1
    );

    h.clock.advance(Duration::days(1));
    h.exchange
        .set_market("ETHUSDT", dec!(100), dec!(100.2), dec!(0.0015))
        .await;
    h.engine.scan_cycle().await.unwrap();

    let status = h.engine.status_snapshot().await;
    assert_eq!(status.positions.len(), 2);
    assert_eq!(status.risk.entries_today, 1);
}
