//! Bracket Trader - Main Entry Point
//!
//! Paper trading by default; live trading against Alpaca when
//! `BT__BROKER__LIVE=true` and credentials are configured.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use bracket_trader::broker::{AlpacaClient, Broker, PaperBroker};
use bracket_trader::config::Config;
use bracket_trader::engine::{Shutdown, TradingEngine};
use bracket_trader::market_data::{CachedProvider, JsonFeedProvider, MarketDataProvider};
use bracket_trader::persistence::PersistenceManager;
use bracket_trader::risk::{DailyStateStore, PositionStateStore};

/// Bracket Trader CLI
#[derive(Parser)]
#[command(name = "bracket-trader")]
#[command(version, about = "Long-only equity scanner with risk-sized bracket orders")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scan and protection drivers (default)
    Run,

    /// Show persisted daily risk state and recent decisions
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/bracket_trader.db")]
        db: String,

        /// Number of recent decisions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Run one scan tick without submitting orders and print the ranked candidates
    ScanOnce,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Status { db, limit } => show_status(&db, limit),
        Commands::ScanOnce => scan_once().await,
        Commands::Run => run().await,
    }
}

/// Broker plus, in paper mode, the paper broker for price marking.
fn build_broker(config: &Config) -> Result<(Arc<dyn Broker>, Option<Arc<PaperBroker>>)> {
    if config.broker.live {
        warn!("LIVE TRADING MODE - real orders will be submitted");
        let client = AlpacaClient::new(&config.broker).context("Failed to create broker client")?;
        Ok((Arc::new(client), None))
    } else {
        info!(
            equity = %config.broker.paper_initial_equity,
            "PAPER TRADING MODE - orders stay in memory"
        );
        let paper = Arc::new(PaperBroker::new(config.broker.paper_initial_equity));
        Ok((paper.clone(), Some(paper)))
    }
}

fn build_provider(config: &Config) -> Arc<dyn MarketDataProvider> {
    let feed = JsonFeedProvider::new(&config.provider.feed_dir);
    Arc::new(CachedProvider::new(feed, &config.cache, &config.provider))
}

fn build_engine(config: Config, shutdown: Arc<Shutdown>) -> Result<(TradingEngine, Option<Arc<PaperBroker>>, Arc<dyn MarketDataProvider>)> {
    let universe = config.load_universe()?;
    anyhow::ensure!(!universe.is_empty(), "universe is empty; set universe.symbols or universe.file");

    let (broker, paper) = build_broker(&config)?;
    let provider = build_provider(&config);
    let persistence = PersistenceManager::new(&config.persistence.db_path)?;

    let engine = TradingEngine::new(config, universe, broker, provider.clone(), persistence, shutdown)?;
    Ok((engine, paper, provider))
}

async fn run() -> Result<()> {
    info!("Bracket Trader v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    log_config(&config);

    let shutdown = Arc::new(Shutdown::new());
    let protection_interval = Duration::from_secs(config.scheduler.protection_interval_secs);
    let (engine, paper, provider) = build_engine(config, shutdown.clone())?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.trigger();
        });
    }

    if let Some(paper) = paper {
        tokio::spawn(mark_paper_prices(paper, provider, protection_interval, shutdown.clone()));
    }

    engine.run().await;

    info!("Bracket Trader shutdown complete");
    Ok(())
}

/// Keep paper positions marked to the feed so stops and targets can trigger.
async fn mark_paper_prices(
    paper: Arc<PaperBroker>,
    provider: Arc<dyn MarketDataProvider>,
    every: Duration,
    shutdown: Arc<Shutdown>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = interval.tick() => {}
        }
        let symbols: Vec<String> = paper.get_state().await.positions.keys().cloned().collect();
        for symbol in symbols {
            match provider.fetch_snapshot(&symbol).await {
                Ok(snapshot) => paper.mark_price(&symbol, snapshot.price).await,
                Err(e) => debug!(%symbol, error = %e, "No price to mark paper position"),
            }
        }
    }
}

async fn scan_once() -> Result<()> {
    let config = Config::load()?;
    let (engine, _, _) = build_engine(config, Arc::new(Shutdown::new()))?;
    let engine = engine.with_dry_run(true);

    let report = engine.run_scan_tick().await?;
    if !report.market_open && report.abort.is_none() {
        println!("Market is closed; nothing scanned.");
        return Ok(());
    }
    if let Some(abort) = &report.abort {
        println!("Scan aborted: {}", abort.reason_code());
        return Ok(());
    }

    println!("Cycle {} on {:?}", report.cycle_id, report.trading_day);
    println!("Scanned {} symbols, {} candidates", engine.universe().len(), report.candidates.len());
    for (idx, candidate) in report.candidates.iter().enumerate() {
        let plan = report.suppressed.iter().find(|p| p.symbol == candidate.symbol);
        match plan {
            Some(plan) => println!(
                "  #{:<3} {:<6} score {:>7.2}  qty {:>5}  entry {:>9.2}  stop {:>9.2}  target {:>9.2}  rr {:.2}",
                idx + 1,
                candidate.symbol,
                candidate.score,
                plan.qty,
                plan.prices.entry,
                plan.prices.stop,
                plan.prices.take_profit,
                plan.prices.reward_risk,
            ),
            None => {
                let reason = report
                    .rejected
                    .iter()
                    .find(|(s, _)| *s == candidate.symbol)
                    .map(|(_, code)| code.as_str())
                    .unwrap_or("-");
                println!(
                    "  #{:<3} {:<6} score {:>7.2}  rejected: {}",
                    idx + 1,
                    candidate.symbol,
                    candidate.score,
                    reason
                );
            }
        }
    }
    Ok(())
}

fn show_status(db_path: &str, limit: usize) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("Database not found: {}", db_path);
        println!("The engine has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;

    match persistence.load_daily_state()? {
        Some(state) => {
            println!("Daily risk state ({})", state.trading_day);
            println!("  spent today:        ${:.2}", state.spent_today_usd);
            println!("  new positions:      {}", state.new_positions_today);
            println!(
                "  traded today:       {}",
                state.symbols_traded_today.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            if !state.pending_entries.is_empty() {
                println!(
                    "  pending:            {}",
                    state.pending_entries.keys().cloned().collect::<Vec<_>>().join(", ")
                );
            }
            if let Some(t) = state.last_trade_time {
                println!("  last trade:         {}", t.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        None => println!("No daily risk state saved yet."),
    }

    let positions = persistence.load_position_states()?;
    if !positions.is_empty() {
        println!("\nProtected positions");
        for p in &positions {
            println!(
                "  {:<6} qty {:>5}  entry {:>9.2}  stop {:>9.2}  stage {:?}",
                p.symbol,
                p.qty,
                p.entry_price,
                p.current_stop(),
                p.stage
            );
        }
    }

    let counts = persistence.verdict_counts()?;
    if !counts.is_empty() {
        println!("\nDecisions by verdict");
        for (verdict, count) in &counts {
            println!("  {:<12} {}", verdict, count);
        }
    }

    let decisions = persistence.latest_decisions(limit)?;
    if !decisions.is_empty() {
        println!("\nRecent decisions");
        for d in &decisions {
            let reasons: Vec<&str> = d.reasons.iter().map(|r| r.as_str()).collect();
            println!(
                "  {} #{:<5} {:<6} {:<10} {}",
                d.timestamp.format("%m-%d %H:%M:%S"),
                d.cycle_id,
                d.symbol,
                format!("{:?}", d.verdict).to_lowercase(),
                reasons.join(",")
            );
        }
    }

    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(json: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "bracket-trader.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("bracket_trader=debug".parse()?)
        .add_directive(Level::INFO.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    if json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let risk = &config.risk;
    info!(
        daily_max_spend_usd = %risk.daily_max_spend_usd,
        daily_max_new_positions = risk.daily_max_new_positions,
        max_total_open_positions = risk.max_total_open_positions,
        max_symbol_risk_pct = %risk.max_symbol_risk_pct,
        cooldown_days = risk.cooldown_days,
        "Risk limits"
    );
    info!(
        min_reward_risk = %config.execution.min_reward_risk,
        break_even_r = %config.execution.break_even_r,
        trailing_enabled = config.execution.trailing_enabled,
        trailing_trigger_r = %config.execution.trailing_trigger_r,
        "Execution settings"
    );
    if config.safeguards.enabled {
        info!(
            started_at = ?config.safeguards.started_at,
            ttl_days = config.safeguards.ttl_days,
            "Safeguards window"
        );
    } else {
        warn!(target: "safeguards", "SAFEGUARDS disabled; entries and protection changes are suppressed");
    }
    if risk.max_position_size_usd == Decimal::ZERO {
        warn!("No per-position size cap configured");
    }
}
