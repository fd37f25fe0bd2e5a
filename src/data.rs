//! Candle cache on disk
//!
//! One CSV per symbol and timeframe under the data directory. The download
//! command fills it forward from the exchange; the backtest command reads it
//! back. Files are plain `datetime,open,high,low,close,volume` rows so they
//! can be inspected or produced by other tooling.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::exchange::{ExchangeError, ExchangeGateway};
use crate::types::{timeframe_to_ms, Candle, Symbol};

/// Disk-backed candle cache
pub struct CandleStore {
    data_dir: PathBuf,
}

impl CandleStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, symbol: &Symbol, timeframe: &str) -> PathBuf {
        self.data_dir.join(format!("{}_{}.csv", symbol, timeframe))
    }

    /// Load the cached series, ascending and deduplicated by open time.
    /// Rows that fail to parse or validate are skipped with a warning so one
    /// bad line cannot poison the whole cache.
    pub fn load(&self, symbol: &Symbol, timeframe: &str) -> Result<Vec<Candle>> {
        let path = self.path(symbol, timeframe);
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        let mut by_time: BTreeMap<i64, Candle> = BTreeMap::new();
        for (row, result) in reader.deserialize::<Candle>().enumerate() {
            match result {
                Ok(candle) => {
                    if candle.is_valid() {
                        by_time.insert(candle.timestamp_ms(), candle);
                    } else {
                        warn!("skipping inconsistent candle at row {}", row + 1);
                    }
                }
                Err(e) => warn!("skipping unreadable row {}: {}", row + 1, e),
            }
        }

        let candles: Vec<Candle> = by_time.into_values().collect();
        info!(
            "Loaded {} candles for {} ({}) from {}",
            candles.len(),
            symbol,
            timeframe,
            path.display()
        );
        Ok(candles)
    }

    /// Load and clip to an inclusive date window
    pub fn load_range(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        let mut candles = self.load(symbol, timeframe)?;
        candles.retain(|c| {
            start.map_or(true, |s| c.datetime >= s) && end.map_or(true, |e| c.datetime <= e)
        });
        Ok(candles)
    }

    /// Rewrite the cache file for this series
    pub fn save(&self, symbol: &Symbol, timeframe: &str, candles: &[Candle]) -> Result<PathBuf> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;

        let path = self.path(symbol, timeframe);
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        for candle in candles {
            writer.serialize(candle)?;
        }
        writer.flush()?;

        info!("💾 Saved {} candles to {}", candles.len(), path.display());
        Ok(path)
    }
}

/// What a download run accomplished
#[derive(Debug)]
pub struct DownloadSummary {
    pub fetched: usize,
    pub total_cached: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

/// Fill the cache forward from the exchange: resume one step after the
/// newest cached candle (or `days` back on a cold start) and page by `since`
/// until the exchange has nothing newer.
pub async fn download_history<G: ExchangeGateway>(
    gateway: &G,
    store: &CandleStore,
    symbol: &Symbol,
    timeframe: &str,
    days: u32,
) -> Result<DownloadSummary> {
    let tf_ms = timeframe_to_ms(timeframe)
        .with_context(|| format!("invalid timeframe '{}'", timeframe))?;
    let step = Duration::milliseconds(tf_ms);

    let mut by_time: BTreeMap<i64, Candle> = BTreeMap::new();
    if store.path(symbol, timeframe).exists() {
        for candle in store.load(symbol, timeframe)? {
            by_time.insert(candle.timestamp_ms(), candle);
        }
    }

    let now = Utc::now();
    let window_start = now - Duration::days(i64::from(days));
    let mut cursor = by_time
        .values()
        .next_back()
        .map(|c| c.datetime + step)
        .map_or(window_start, |resumed| resumed.max(window_start));

    info!(
        "Fetching {} {} history from {}",
        symbol,
        timeframe,
        cursor.format("%Y-%m-%d %H:%M")
    );

    let mut fetched = 0usize;
    while cursor <= now {
        let batch = match gateway
            .fetch_ohlcv(symbol, timeframe, Some(cursor), 1000)
            .await
        {
            Ok(batch) => batch,
            Err(ExchangeError::NoData(_)) => break,
            Err(e) => return Err(e).context("history fetch failed"),
        };
        if batch.is_empty() {
            break;
        }

        let newest = batch[batch.len() - 1].datetime;
        for candle in batch {
            if by_time.insert(candle.timestamp_ms(), candle).is_none() {
                fetched += 1;
            }
        }

        let next = newest + step;
        if next <= cursor {
            // the exchange is repeating itself
            break;
        }
        info!(
            "  fetched up to {} ({} new so far)",
            newest.format("%Y-%m-%d %H:%M"),
            fetched
        );
        cursor = next;
    }

    let merged: Vec<Candle> = by_time.into_values().collect();
    store.save(symbol, timeframe, &merged)?;

    Ok(DownloadSummary {
        fetched,
        total_cached: merged.len(),
        first: merged.first().map(|c| c.datetime),
        last: merged.last().map(|c| c.datetime),
    })
}
