//! Historical data download command
//!
//! Kline data is public, so no credentials are required here.

use anyhow::{Context, Result};
use tracing::info;

use perp_rsi_trader::config::Config;
use perp_rsi_trader::data::{download_history, CandleStore};
use perp_rsi_trader::exchange::bybit::BybitClient;

pub fn run(config_path: String, symbol_override: Option<String>, days: u32) -> Result<()> {
    let mut config = Config::from_file(&config_path).context("Failed to load configuration")?;
    info!("Loaded configuration from: {}", config_path);

    if let Some(symbol) = symbol_override {
        info!("Overriding symbol to: {}", symbol);
        config.strategy.symbol = symbol;
        config.validate()?;
    }

    let symbol = config.symbol();
    let timeframe = config.strategy.timeframe.clone();
    info!(
        "🚀 Downloading {} days of {} ({}) history",
        days, symbol, timeframe
    );

    let client = BybitClient::from_settings(&config.exchange);
    let store = CandleStore::new(&config.backtest.data_dir);

    let runtime = tokio::runtime::Runtime::new()?;
    let summary =
        runtime.block_on(download_history(&client, &store, &symbol, &timeframe, days))?;

    println!("\n{}", "=".repeat(60));
    println!("DOWNLOAD SUMMARY: {} ({})", symbol, timeframe);
    println!("{}", "=".repeat(60));
    println!("New candles:        {}", summary.fetched);
    println!("Total cached:       {}", summary.total_cached);
    if let (Some(first), Some(last)) = (summary.first, summary.last) {
        println!(
            "Range:              {} -> {}",
            first.format("%Y-%m-%d %H:%M"),
            last.format("%Y-%m-%d %H:%M")
        );
    }
    println!("{}", "=".repeat(60));

    info!("✅ Download complete");
    Ok(())
}
