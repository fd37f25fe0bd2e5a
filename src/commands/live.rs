//! Live trading command
//!
//! Polls the exchange on a fixed interval, runs the position controller on
//! every tick and snapshots the session after every cycle so a restart picks
//! up exactly where the previous run stopped. `--paper` routes all account
//! calls through the simulated paper account; `--live` sends real orders.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use perp_rsi_trader::config::Config;
use perp_rsi_trader::engine::{PositionController, SessionState, SessionStore, TickContext};
use perp_rsi_trader::exchange::bybit::BybitClient;
use perp_rsi_trader::exchange::paper::PaperExchange;
use perp_rsi_trader::exchange::ExchangeGateway;
use perp_rsi_trader::recorder::TradeRecorder;
use perp_rsi_trader::types::Money;

pub fn run(config_path: String, paper: bool, live: bool) -> Result<()> {
    if paper == live {
        anyhow::bail!("Specify exactly one of --paper or --live");
    }

    dotenv::dotenv().ok();

    let config = Config::from_file(&config_path).context("Failed to load configuration")?;
    info!("Loaded configuration from: {}", config_path);

    if live {
        if config.exchange.api_key.is_none() || config.exchange.api_secret.is_none() {
            anyhow::bail!("Live mode needs BYBIT_API_KEY and BYBIT_API_SECRET in the environment");
        }
        warn!("🚨 LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 10 seconds to abort...");
        for remaining in (1..=10u64).rev() {
            warn!("  starting in {}...", remaining);
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let client = BybitClient::from_settings(&config.exchange);
        if paper {
            let gateway = PaperExchange::new(
                client,
                config.symbol(),
                &config.exchange,
                Money::from_f64(config.live.paper_balance),
                config.strategy.leverage,
            );
            run_loop(config, Arc::new(gateway), "PAPER").await
        } else {
            run_loop(config, Arc::new(client), "LIVE").await
        }
    })
}

async fn run_loop<G: ExchangeGateway>(config: Config, gateway: Arc<G>, mode: &str) -> Result<()> {
    let symbol = config.symbol();
    let timeframe = config.strategy.timeframe.clone();

    info!("🚀 Starting {} trading: {} {}", mode, symbol, timeframe);
    info!("Poll interval: {}s", config.live.poll_interval_secs);

    // Health check before touching any state
    let server_time = gateway
        .server_time()
        .await
        .context("Exchange health check failed")?;
    info!(
        "✅ Exchange reachable, server time {}",
        server_time.format("%Y-%m-%d %H:%M:%S")
    );

    // Resume the previous session if a snapshot exists
    let store = SessionStore::new(&config.live.state_dir, &symbol, &timeframe);
    let strategy_hash = config.strategy_hash();
    let state = match store.load()? {
        Some(previous) => {
            info!("📋 Resuming session from {}", store.path().display());
            if previous.strategy_hash != strategy_hash {
                warn!(
                    "⚠️  Strategy parameters changed since the snapshot was written ({} -> {})",
                    previous.strategy_hash, strategy_hash
                );
            }
            if let Some(position) = &previous.position {
                info!(
                    "  open position: {} {} @ {}",
                    position.side, position.size, position.entry_price
                );
            }
            previous
        }
        None => {
            info!("Starting a fresh session");
            SessionState::fresh(strategy_hash)
        }
    };

    let recorder = TradeRecorder::file_backed(&config.live.records_dir, &symbol, &timeframe)
        .context("Failed to open trade records")?;
    info!(
        "✅ Trade recorder ready ({} records on file)",
        recorder.trades().len()
    );

    let mut controller = PositionController::new(
        symbol,
        config.strategy.clone(),
        &config.exchange,
        gateway.clone(),
        recorder,
        state,
    );

    // Graceful shutdown on Ctrl+C
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("🛑 Ctrl+C received - finishing the current cycle");
                shutdown_signal.notify_one();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let started = Utc::now();
    let mut ticker = interval(Duration::from_secs(config.live.poll_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut cycles = 0u64;
    let mut consecutive_errors = 0u32;
    let mut last_equity_candle: Option<DateTime<Utc>> = None;

    info!("✅ Entering trading loop");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cycles += 1;
                match run_cycle(&config, gateway.as_ref(), &mut controller, &mut last_equity_candle).await {
                    Ok(()) => consecutive_errors = 0,
                    Err(e) => {
                        consecutive_errors += 1;
                        error!(
                            "Cycle failed ({}/{}): {:#}",
                            consecutive_errors, config.live.max_consecutive_errors, e
                        );
                        if consecutive_errors >= config.live.max_consecutive_errors {
                            store.save(controller.session())?;
                            anyhow::bail!("{} consecutive failed cycles, stopping", consecutive_errors);
                        }
                    }
                }
                // snapshot survives a crash between cycles
                store.save(controller.session())?;
            }
            _ = shutdown.notified() => {
                info!("Shutting down gracefully...");
                break;
            }
        }
    }

    store.save(controller.session())?;
    info!("💾 Session saved to {}", store.path().display());

    let uptime = Utc::now() - started;
    println!("\n{}", "=".repeat(60));
    println!("SESSION SUMMARY [{}]", mode);
    println!("{}", "=".repeat(60));
    println!(
        "Uptime:             {}h {}m",
        uptime.num_hours(),
        uptime.num_minutes() % 60
    );
    println!("Cycles run:         {}", cycles);
    println!(
        "Trades recorded:    {}",
        controller.recorder().trades().len()
    );
    match &controller.session().position {
        Some(position) => println!(
            "Open position:      {} {} @ {}",
            position.side, position.size, position.entry_price
        ),
        None => println!("Open position:      none"),
    }
    println!("{}", "=".repeat(60));

    info!("✅ Shutdown complete");
    Ok(())
}

/// One polling cycle: fetch market data, run the state machine, append an
/// equity point when a new candle has closed since the last cycle.
async fn run_cycle<G: ExchangeGateway>(
    config: &Config,
    gateway: &G,
    controller: &mut PositionController<G>,
    last_equity_candle: &mut Option<DateTime<Utc>>,
) -> Result<()> {
    let symbol = config.symbol();
    let price = gateway
        .fetch_price(&symbol)
        .await
        .context("price fetch failed")?;
    let candles = gateway
        .fetch_ohlcv(
            &symbol,
            &config.strategy.timeframe,
            None,
            config.strategy.history_limit(),
        )
        .await
        .context("candle fetch failed")?;

    if candles.len() < config.strategy.warmup_candles() {
        warn!(
            "only {} closed candles available, indicators need {}",
            candles.len(),
            config.strategy.warmup_candles()
        );
        return Ok(());
    }

    let ctx = TickContext::live(&candles, price, Utc::now());
    controller.tick(&ctx).await?;

    // one equity point per closed candle, not per poll
    let newest = candles.last().map(|c| c.datetime);
    if newest.is_some() && newest != *last_equity_candle {
        controller.record_equity_snapshot(&ctx).await?;
        *last_equity_candle = newest;
    }

    Ok(())
}
