//! Funding Arb - Main Entry Point
//!
//! Paper trading by default; `LIVE_TRADING=true` sends orders to Binance.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use funding_arb::config::Config;
use funding_arb::engine::{Clock, Engine, SystemClock};
use funding_arb::exchange::{BinanceClient, ExchangeClient, PaperExchange};
use funding_arb::ledger::Position;
use funding_arb::persistence::{SqliteStateStore, StateStore};
use funding_arb::utils::to_basis_points;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Funding Arb CLI
#[derive(Parser)]
#[command(name = "funding-arb")]
#[command(version, about = "Delta-neutral funding rate arbitrage on a single venue")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine (default)
    Run,

    /// Show persisted positions and performance
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/funding_arb.db")]
        db: String,

        /// Show leg details and trade history
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Trading mode: Live (real money) or Paper.
#[derive(Debug, Clone, Copy, PartialEq)]
enum TradingMode {
    Live,
    Paper,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    if let Some(Commands::Status { db, verbose }) = cli.command {
        return show_status(&db, verbose);
    }

    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║            Funding Arb v{}                              ║", env!("CARGO_PKG_VERSION"));
    info!("╚════════════════════════════════════════════════════════════╝");

    let trading_mode = if std::env::var("LIVE_TRADING").unwrap_or_default() == "true" {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
        TradingMode::Live
    } else {
        info!("📝 PAPER TRADING MODE - orders are simulated");
        TradingMode::Paper
    };

    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;
    log_config(&config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let binance = Arc::new(BinanceClient::new(&config.exchange)?);
    if config.exchange.api_key.is_empty() {
        info!("⚠️  No API keys provided. Only public market data is available.");
    }

    let exchange: Arc<dyn ExchangeClient> = match trading_mode {
        TradingMode::Live => binance,
        TradingMode::Paper => {
            let paper = Arc::new(PaperExchange::with_clock(dec!(10000), clock.clone())); // $10k paper default
            for pair in &config.pairs {
                paper.register_pair(pair).await;
            }
            let synced = paper.sync_quotes(binance.as_ref(), &config.pairs).await;
            info!(synced, pairs = config.pairs.len(), "📡 Paper quotes seeded from Binance");

            let feed = paper.clone();
            let pairs = config.pairs.clone();
            let every = Duration::from_secs(config.scheduler.monitor_interval_secs);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(every).await;
                    feed.sync_quotes(binance.as_ref(), &pairs).await;
                }
            });
            paper
        }
    };

    let store = SqliteStateStore::open(&config.persistence.db_path)
        .with_context(|| format!("Failed to open state store {}", config.persistence.db_path))?;
    let engine = Engine::new(config, exchange, clock, store)?;

    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("🛑 Shutdown signal received");
        shutdown.request();
    });

    info!("🚀 Starting engine...");
    engine.start().await?;

    let status = engine.status_snapshot().await;
    info!(
        remaining_positions = status.positions.len(),
        realized_pnl = %status.cumulative_realized_pnl,
        "👋 Shutdown complete"
    );
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "funding-arb.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("funding_arb=debug".parse()?)
        .add_directive(Level::INFO.into());
    let writer = std::io::stdout.and(file_writer);

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(true)
            .init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    let symbols: Vec<&str> = config.pairs.iter().map(|p| p.symbol.as_str()).collect();
    info!("   Pairs: {}", symbols.join(", "));
    info!(
        "   Entry / Hold Rate: {}bp / {}bp",
        to_basis_points(config.signal.min_funding_rate),
        to_basis_points(config.signal.min_hold_rate)
    );
    info!(
        "   Max Positions: {} | Max Notional: ${} (pair ${})",
        config.risk.max_open_positions, config.risk.max_total_notional, config.risk.max_pair_notional
    );
    info!(
        "   Drawdown Stop: {:.1}% of ${}",
        config.risk.max_drawdown * dec!(100),
        config.risk.capital_baseline
    );
    info!(
        "   Leverage: {}x | Fill Timeout: {}s",
        config.execution.leverage, config.execution.fill_timeout_secs
    );
    info!(
        "   Scan / Monitor Interval: {}s / {}s",
        config.scheduler.scan_interval_secs, config.scheduler.monitor_interval_secs
    );
}

/// Show persisted state from the database.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    use std::path::Path;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              FUNDING ARB STATUS                            ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The engine has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = SqliteStateStore::open(db_path)?;

    let Some(snapshot) = store.load()? else {
        println!("\n❌ No saved state found in database.");
        return Ok(());
    };

    println!("\n📊 Ledger");
    println!("   ├─ Write Sequence:   {}", snapshot.sequence);
    println!("   ├─ Realized PnL:     ${:.4}", snapshot.cumulative_realized_pnl);
    println!("   ├─ PnL High Water:   ${:.4}", snapshot.pnl_high_water);
    println!("   └─ Last Saved:       {}", snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC"));

    if !snapshot.positions.is_empty() {
        println!("\n🔓 Active Positions");
        for pos in &snapshot.positions {
            print_position(pos, verbose);
        }
    }

    let summary = store.performance_summary()?;
    println!("\n📈 Performance");
    println!("   ├─ Closed / Failed:  {} / {}", summary.closed_positions, summary.failed_positions);
    println!("   ├─ Win Rate:         {:.1}%", summary.win_rate * dec!(100));
    println!("   ├─ Realized PnL:     ${:.4}", summary.total_realized_pnl);
    println!("   ├─ Funding:          ${:.4}", summary.total_funding);
    println!("   ├─ Fees:             ${:.4}", summary.total_fees);
    println!("   └─ Profit Factor:    {:.2}", summary.profit_factor);

    if verbose {
        let history = store.history()?;
        if !history.is_empty() {
            println!("\n📜 Recent History");
            for pos in history.iter().rev().take(10) {
                println!(
                    "   ├─ {} {} {} PnL ${:.4} ({})",
                    pos.close_time.unwrap_or(pos.updated_at).format("%Y-%m-%d %H:%M"),
                    pos.position_id,
                    pos.state,
                    pos.realized_pnl,
                    pos.exit_reason.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

fn print_position(pos: &Position, verbose: bool) {
    println!("   ┌─ {} [{}] {}", pos.position_id, pos.state, pos.direction);
    println!("   ├─ Notional:         ${:.2} at {}x", pos.notional, pos.leverage);
    println!(
        "   ├─ Spot:             {} @ ${:.4}",
        pos.spot_leg.filled_qty, pos.spot_leg.avg_fill_price
    );
    println!(
        "   ├─ Perp:             {} @ ${:.4}",
        pos.perp_leg.filled_qty, pos.perp_leg.avg_fill_price
    );
    println!("   ├─ Funding:          ${:.4}", pos.funding_accrued);
    println!("   ├─ Fees:             ${:.4}", pos.total_fees());
    println!("   ├─ Unrealized:       ${:.4}", pos.unrealized_pnl);
    if let Some(reason) = &pos.manual_reason {
        println!("   ├─ ⚠️  Manual:        {}", reason);
    }
    println!("   └─ Opened:           {}", pos.entry_time.format("%Y-%m-%d %H:%M:%S UTC"));

    if verbose {
        let hours = (Utc::now() - pos.entry_time).num_hours();
        println!("       Held: {}h | Entry rate: {}bp", hours, to_basis_points(pos.entry_funding_rate));
        for leg in [&pos.exit_spot_leg, &pos.exit_perp_leg].into_iter().flatten() {
            println!(
                "       Unwind {}: {}/{} ({:?})",
                leg.market, leg.filled_qty, leg.quantity, leg.status
            );
        }
        if pos.notional > Decimal::ZERO {
            println!(
                "       Return: {:.3}%",
                pos.open_pnl() / pos.notional * dec!(100)
            );
        }
    }
}
