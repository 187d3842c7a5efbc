//! BNB Grid Bot - Main Entry Point
//!
//! Paper trading by default; set `LIVE_TRADING=true` to trade on Binance.

use anyhow::{Context, Result};
use bnb_grid_bot::config::Config;
use bnb_grid_bot::exchange::{
    BinanceSpotClient, BookTickerStream, ExchangeGateway, PaperExchange, PriceSnapshot, Side,
    SymbolFilters,
};
use bnb_grid_bot::persistence::PersistenceManager;
use bnb_grid_bot::strategy::StrategyEngine;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// BNB Grid Bot CLI
#[derive(Parser)]
#[command(name = "bnb-grid-bot")]
#[command(version, about = "BNB/USDT spot grid trading with S1 scaling and Simple Earn rebalancing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the strategy engine (default)
    Run {
        /// Paper account quote balance
        #[arg(long, default_value = "1000")]
        paper_quote: Decimal,

        /// Paper account base balance
        #[arg(long, default_value = "1")]
        paper_base: Decimal,
    },

    /// Show the persisted ladder, position and recent actions
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/grid_state.db")]
        db: String,

        /// Show every level and the recent action log
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Trading mode: Live (real money) or Paper (simulated account).
#[derive(Debug, Clone, Copy, PartialEq)]
enum TradingMode {
    Live,
    Paper,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let (paper_quote, paper_base) = match cli.command {
        Some(Commands::Status { db, verbose }) => return show_status(&db, verbose),
        Some(Commands::Run {
            paper_quote,
            paper_base,
        }) => (paper_quote, paper_base),
        None => (Decimal::from(1000), Decimal::ONE),
    };

    info!("BNB Grid Bot v{} starting", env!("CARGO_PKG_VERSION"));

    let trading_mode = if std::env::var("LIVE_TRADING").unwrap_or_default() == "true" {
        warn!("LIVE TRADING MODE - real money at risk");
        TradingMode::Live
    } else {
        info!("PAPER TRADING MODE - orders are simulated");
        TradingMode::Paper
    };

    let mut config = Config::load()?;
    config.validate().context("Invalid configuration")?;

    // Public market data comes from Binance in both modes
    let client = BinanceSpotClient::new(&config.binance)?;
    let defaults = SymbolFilters {
        tick_size: config.market.tick_size,
        lot_size: config.market.lot_size,
        min_quantity: config.market.min_quantity,
        min_notional: config.market.min_notional,
    };
    match client.get_symbol_filters(&config.market.symbol, defaults).await {
        Ok(filters) => {
            config.market.tick_size = filters.tick_size;
            config.market.lot_size = filters.lot_size;
            config.market.min_quantity = filters.min_quantity;
            config.market.min_notional = filters.min_notional;
            info!(
                symbol = %config.market.symbol,
                tick_size = %filters.tick_size,
                lot_size = %filters.lot_size,
                min_notional = %filters.min_notional,
                "Exchange filters loaded"
            );
        }
        Err(e) if trading_mode == TradingMode::Live => {
            return Err(e).context("Exchange filters are required for live trading");
        }
        Err(e) => warn!(error = %e, "Failed to load exchange filters, using configured values"),
    }
    log_config(&config);

    let store = match PersistenceManager::new(&config.engine.db_path) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "Persistence unavailable, running without saved state");
            None
        }
    };

    let stream = config
        .market
        .use_stream
        .then(|| BookTickerStream::new(&config.market.symbol, config.binance.testnet).spawn());

    match trading_mode {
        TradingMode::Live => {
            anyhow::ensure!(
                client.has_credentials(),
                "BINANCE_API_KEY and BINANCE_SECRET_KEY are required for live trading"
            );
            run_engine(config, client, store, stream).await
        }
        TradingMode::Paper => {
            let paper = Arc::new(PaperExchange::new(
                &config.market.symbol,
                &config.market.base_asset,
                &config.market.quote_asset,
                paper_quote,
                paper_base,
            ));
            info!(quote = %paper_quote, base = %paper_base, "Paper account funded");
            seed_paper(&client, &paper, &config).await?;
            tokio::spawn(feed_paper(client, paper.clone(), config.clone()));
            run_engine(config, paper, store, stream).await
        }
    }
}

async fn run_engine<G: ExchangeGateway>(
    config: Config,
    gateway: G,
    store: Option<PersistenceManager>,
    stream: Option<watch::Receiver<Option<PriceSnapshot>>>,
) -> Result<()> {
    let mut engine = StrategyEngine::new(config.clone(), gateway, store);
    if let Some(stream) = stream {
        engine = engine.with_stream(stream);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reload_tx, reload_rx) = watch::channel(config);
    tokio::spawn(watch_signals(shutdown_tx, reload_tx));

    // Startup needs the exchange; keep trying until it answers or we are told to stop
    let mut backoff = Duration::from_secs(1);
    loop {
        match engine.startup().await {
            Ok(()) => break,
            Err(e) => {
                error!(error = %e, retry_in_secs = backoff.as_secs(), "Startup reconciliation failed");
                let mut shutdown = shutdown_rx.clone();
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return Ok(()),
                }
                backoff = (backoff * 2).min(Duration::from_secs(60));
            }
        }
    }

    engine.run(shutdown_rx, reload_rx).await;
    info!("BNB Grid Bot shutdown complete");
    Ok(())
}

/// Turn process signals into shutdown and reload requests.
async fn watch_signals(shutdown: watch::Sender<bool>, reload: watch::Sender<Config>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (Ok(mut term), Ok(mut hup)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) else {
            warn!("Could not install unix signal handlers, only ctrl-c is handled");
            tokio::signal::ctrl_c().await.ok();
            shutdown.send_replace(true);
            return;
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = term.recv() => break,
                _ = hup.recv() => match Config::load().and_then(|c| c.validate().map(|()| c)) {
                    Ok(config) => {
                        info!("Reload requested, applying before the next cycle");
                        reload.send_replace(config);
                    }
                    Err(e) => warn!(error = %e, "Reloaded configuration rejected, keeping current"),
                },
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = &reload;
        tokio::signal::ctrl_c().await.ok();
    }

    info!("Shutdown signal received, finishing current cycle");
    shutdown.send_replace(true);
}

/// Load a price and candle history into the paper exchange before startup.
async fn seed_paper(client: &BinanceSpotClient, paper: &PaperExchange, config: &Config) -> Result<()> {
    let symbol = config.market.symbol.as_str();
    let (price, candles) = tokio::try_join!(
        client.get_price(symbol),
        client.get_candles(symbol, &config.s1.candle_interval, config.s1.lookback + 1),
    )
    .context("Failed to seed paper exchange with market data")?;
    paper.set_price(price).await;
    paper.set_candles(candles).await;
    Ok(())
}

/// Mirror live Binance prices into the paper exchange, filling resting
/// paper orders as the market moves.
async fn feed_paper(client: BinanceSpotClient, paper: Arc<PaperExchange>, config: Config) {
    let symbol = config.market.symbol.as_str();
    let poll = Duration::from_secs(config.engine.poll_interval_secs.max(1));
    let candle_every = (config.s1.refresh_minutes * 60 / poll.as_secs()).max(1);
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut ticks: u64 = 0;
    loop {
        interval.tick().await;
        ticks += 1;
        match client.get_price(symbol).await {
            Ok(price) => paper.set_price(price).await,
            Err(e) => debug!(error = %e, "Paper price feed missed a tick"),
        }
        if ticks % candle_every == 0 {
            match client
                .get_candles(symbol, &config.s1.candle_interval, config.s1.lookback + 1)
                .await
            {
                Ok(candles) => paper.set_candles(candles).await,
                Err(e) => debug!(error = %e, "Paper candle feed failed"),
            }
        }
    }
}

/// Initialize logging to stdout and an hourly rolling file.
///
/// `LOG_FORMAT=json` switches both sinks to JSON lines.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "grid-bot.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("bnb_grid_bot=debug".parse()?)
        .add_directive(Level::INFO.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v == "json") {
        builder.json().with_current_span(false).init();
    } else {
        builder
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!(
        symbol = %config.market.symbol,
        step_pct = %config.grid.step_pct,
        levels = config.grid.levels,
        order_notional = %config.grid.order_notional,
        order_notional_ratio = ?config.grid.order_notional_ratio,
        volatility_step = config.grid.volatility_step,
        anchor = ?config.grid.anchor_price,
        "Grid configuration"
    );
    info!(
        lookback = config.s1.lookback,
        interval = %config.s1.candle_interval,
        policy = ?config.s1.policy,
        fallback_scale = %config.s1.fallback_scale,
        breakout_rebalance = config.s1.breakout_rebalance,
        "S1 configuration"
    );
    info!(
        max_position_ratio = %config.risk.max_position_ratio,
        min_position_ratio = %config.risk.min_position_ratio,
        max_absolute_position = %config.risk.max_absolute_position,
        max_order_size = %config.risk.max_order_size,
        min_cash_buffer = %config.risk.min_cash_buffer,
        "Risk limits"
    );
    info!(
        enabled = config.allocator.enabled,
        every_n_cycles = config.allocator.every_n_cycles,
        quote_buffer = %config.allocator.quote_buffer,
        manage_base = config.allocator.manage_base,
        "Fund allocator"
    );
}

/// Show the persisted engine state.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    use std::path::Path;

    println!("BNB GRID BOT STATUS");
    println!("===================");

    if !Path::new(db_path).exists() {
        println!("\nDatabase not found: {}", db_path);
        println!("The bot has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;
    let Some(state) = persistence.load_state()? else {
        println!("\nNo saved state found in database.");
        return Ok(());
    };

    let position = &state.position;
    println!("\nLadder");
    println!("  anchor:      {}", state.anchor);
    println!("  step:        {}", state.step);
    match state.center {
        Some(center) => println!("  center slot: {}", center),
        None => println!("  center slot: -"),
    }
    println!("  cycle:       {}", state.cycle);
    println!("  saved:       {}", state.last_saved.format("%Y-%m-%d %H:%M:%S UTC"));

    println!("\nPosition");
    println!("  quantity:       {}", position.quantity);
    println!("  average cost:   {:.4}", position.average_cost);
    println!("  realized PnL:   {:.4}", position.realized_pnl);
    println!("  unrealized PnL: {:.4}", position.unrealized_pnl);
    println!(
        "  round trips:    {} (win rate {:.1}%, profit factor {:.2})",
        position.stats.round_trips,
        position.stats.win_rate() * Decimal::ONE_HUNDRED,
        position.stats.profit_factor()
    );

    let buys = state.levels.iter().filter(|l| l.side == Side::Buy).count();
    println!("\nLevels: {} buys, {} sells", buys, state.levels.len() - buys);
    if verbose {
        for level in &state.levels {
            println!(
                "  slot {:>4} {:<4} {:>12} qty {:<10} {:<8} {}",
                level.slot,
                level.side.as_str(),
                level.price,
                level.quantity,
                level.status.as_str(),
                level.order_id.map(|id| id.to_string()).unwrap_or_default()
            );
        }

        let actions = persistence.recent_actions(20)?;
        if !actions.is_empty() {
            println!("\nRecent actions");
            for action in &actions {
                println!(
                    "  {} #{:<6} {:<17} {}",
                    action.timestamp.format("%m-%d %H:%M:%S"),
                    action.cycle,
                    action.kind.as_str(),
                    action.detail
                );
            }
        }
    }

    println!();
    Ok(())
}
