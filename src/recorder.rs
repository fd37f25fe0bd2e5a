//! Trade ledger and equity history
//!
//! Append-only in meaning, wholesale-rewritten on disk: each append
//! serializes the full list back to its JSON file. Cheap at this trade
//! volume, and the file is always a complete valid document.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::types::{EquitySnapshot, Symbol, TradeRecord};

#[derive(Debug)]
pub struct TradeRecorder {
    trades_path: Option<PathBuf>,
    equity_path: Option<PathBuf>,
    trades: Vec<TradeRecord>,
    equity: Vec<EquitySnapshot>,
}

impl TradeRecorder {
    /// File-backed recorder. Existing files are loaded first so appends
    /// extend prior history instead of clobbering it.
    pub fn file_backed(
        records_dir: impl AsRef<Path>,
        symbol: &Symbol,
        timeframe: &str,
    ) -> Result<Self> {
        let dir = records_dir.as_ref();
        let trades_path = dir.join(format!("{}_{}_trades.json", symbol, timeframe));
        let equity_path = dir.join(format!("{}_{}_equity.json", symbol, timeframe));

        let trades = load_list(&trades_path)?;
        let equity = load_list(&equity_path)?;

        Ok(Self {
            trades_path: Some(trades_path),
            equity_path: Some(equity_path),
            trades,
            equity,
        })
    }

    /// Everything stays in memory; backtests read the vectors out at the end.
    pub fn in_memory() -> Self {
        Self {
            trades_path: None,
            equity_path: None,
            trades: Vec::new(),
            equity: Vec::new(),
        }
    }

    pub fn record_trade(&mut self, record: TradeRecord) -> Result<()> {
        debug!(
            "recording trade: {} {} @ {}",
            record.action, record.amount, record.entry_price
        );
        self.trades.push(record);
        if let Some(path) = self.trades_path.clone() {
            write_list(&path, &self.trades)?;
        }
        Ok(())
    }

    pub fn record_equity(&mut self, snapshot: EquitySnapshot) -> Result<()> {
        self.equity.push(snapshot);
        if let Some(path) = self.equity_path.clone() {
            write_list(&path, &self.equity)?;
        }
        Ok(())
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn equity(&self) -> &[EquitySnapshot] {
        &self.equity
    }

    /// Exit-side records only
    pub fn closed_trades(&self) -> impl Iterator<Item = &TradeRecord> {
        self.trades.iter().filter(|t| t.is_close())
    }
}

fn load_list<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_list<T: serde::Serialize>(path: &Path, list: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create records dir {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(list).context("Failed to encode records")?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
