//! Backtest command implementation

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::path::PathBuf;
use tracing::info;

use perp_rsi_trader::backtest::{BacktestResult, BacktestRunner};
use perp_rsi_trader::config::Config;
use perp_rsi_trader::data::CandleStore;

pub fn run(
    config_path: String,
    symbol_override: Option<String>,
    start_override: Option<String>,
    end_override: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    info!("Starting backtest");

    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    if let Some(symbol) = symbol_override {
        info!("Overriding symbol to: {}", symbol);
        config.strategy.symbol = symbol;
        config.validate()?;
    }
    if let Some(start) = start_override {
        info!("Overriding start date to: {}", start);
        config.backtest.start_date = Some(start);
    }
    if let Some(end) = end_override {
        info!("Overriding end date to: {}", end);
        config.backtest.end_date = Some(end);
    }

    let start = parse_date(config.backtest.start_date.as_deref(), false)?;
    let end = parse_date(config.backtest.end_date.as_deref(), true)?;

    let symbol = config.symbol();
    let timeframe = config.strategy.timeframe.clone();
    info!("Loading data from: {}", config.backtest.data_dir);

    let store = CandleStore::new(&config.backtest.data_dir);
    let candles = store.load_range(&symbol, &timeframe, start, end)?;
    if candles.is_empty() {
        bail!(
            "No cached candles for {} ({}) under {} - run the download command first",
            symbol,
            timeframe,
            config.backtest.data_dir
        );
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(BacktestRunner::new(config, candles).run())?;

    print_report(&result);

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("💾 Results exported to {}", path.display());
    }

    info!("Backtest completed successfully");
    Ok(())
}

/// `YYYY-MM-DD`; the end date extends to the last second of that day
fn parse_date(date: Option<&str>, end_of_day: bool) -> Result<Option<DateTime<Utc>>> {
    let Some(date) = date else {
        return Ok(None);
    };
    let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("invalid date {:?} (expected YYYY-MM-DD)", date))?;
    let naive = if end_of_day {
        parsed.and_hms_opt(23, 59, 59)
    } else {
        parsed.and_hms_opt(0, 0, 0)
    }
    .context("invalid time of day")?;
    Ok(Some(naive.and_utc()))
}

fn print_report(result: &BacktestResult) {
    let m = &result.metrics;
    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS: {} ({})", result.symbol, result.timeframe);
    println!("{}", "=".repeat(60));
    println!("Initial Balance:    ${:.2}", result.initial_balance);
    println!("Final Equity:       ${:.2}", result.final_equity);
    println!("Total Return:       {:.2}%", m.total_return);
    println!("Sharpe Ratio:       {:.2}", m.sharpe_ratio);
    println!("Max Drawdown:       {:.2}%", m.max_drawdown);
    println!("Win Rate:           {:.2}%", m.win_rate);
    println!("Profit Factor:      {:.2}", m.profit_factor);
    println!("Risk/Reward:        {:.2}", m.risk_reward);
    println!("Expectancy:         ${:.2}", m.expectancy);
    println!("Total Trades:       {}", m.total_trades);
    println!("Winning Trades:     {}", m.winning_trades);
    println!("Losing Trades:      {}", m.losing_trades);
    println!("Average Win:        ${:.2}", m.avg_win);
    println!("Average Loss:       ${:.2}", m.avg_loss);
    println!("Largest Win:        ${:.2}", m.largest_win);
    println!("Largest Loss:       ${:.2}", m.largest_loss);
    println!("Total Fees:         ${:.2}", m.total_fees);
    println!("{}", "=".repeat(60));
}
