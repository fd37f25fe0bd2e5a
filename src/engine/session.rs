//! Durable session state
//!
//! One JSON snapshot per symbol, overwritten wholesale at the end of every
//! tick and read once at startup. A crash loses at most the in-flight tick.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::signal::Signal;
use crate::types::{Candle, Money, Side, Symbol};

/// Open position owned by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub size: Money,
    pub entry_price: Money,
    pub entry_time: DateTime<Utc>,
    pub leverage: u32,
    /// Take-profit ladder levels already filled, by level id
    #[serde(default)]
    pub tp_levels_hit: BTreeMap<String, bool>,
    /// Latest computed ladder prices, by level id
    #[serde(default)]
    pub tp_orders: BTreeMap<String, Money>,
}

impl Position {
    pub fn new(
        side: Side,
        size: Money,
        entry_price: Money,
        entry_time: DateTime<Utc>,
        leverage: u32,
    ) -> Self {
        Self {
            side,
            size,
            entry_price,
            entry_time,
            leverage,
            tp_levels_hit: BTreeMap::new(),
            tp_orders: BTreeMap::new(),
        }
    }

    pub fn notional(&self) -> Money {
        self.entry_price * self.size
    }

    pub fn initial_margin(&self) -> Money {
        self.notional() / Money::from_i64(i64::from(self.leverage.max(1)))
    }

    pub fn unrealized_pnl(&self, price: Money) -> Money {
        match self.side {
            Side::Long => (price - self.entry_price) * self.size,
            Side::Short => (self.entry_price - price) * self.size,
        }
    }

    pub fn level_hit(&self, level_id: &str) -> bool {
        self.tp_levels_hit.get(level_id).copied().unwrap_or(false)
    }
}

/// Staged entry waiting for price to trade through its trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub side: Side,
    /// Activation price beyond the signal candle extreme
    pub trigger_price: Money,
    /// Protective stop once activated; breached first, the entry is cancelled
    pub stoploss_price: Money,
    /// Open time of the signal candle that staged this entry
    pub signal_time: DateTime<Utc>,
}

/// Everything the controller needs to resume after a restart.
///
/// At most one of pending-entry / in-position drives logic at a time.
/// `is_wait_candle` and `last_focus_price` are the two staged substates of
/// the swap-consideration flow: an opposite cross arms the wait, the next
/// candle close computes the focus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub is_in_position: bool,
    pub is_swapping: bool,
    pub is_wait_candle: bool,
    pub current_stoploss: Option<Money>,
    pub last_candle_cross: Option<Signal>,
    pub last_focus_price: Option<Money>,
    pub last_focus_stopprice: Option<Money>,
    /// Signal candle the current position (or pending entry) is based on
    pub entry_candle: Option<Candle>,
    pub pending_entry: Option<PendingEntry>,
    /// Open time of the newest closed candle the last tick saw
    pub last_candle_time: Option<DateTime<Utc>>,
    pub position: Option<Position>,
    /// Hash of the strategy config this session was started under
    pub strategy_hash: String,
}

impl SessionState {
    pub fn fresh(strategy_hash: String) -> Self {
        Self {
            strategy_hash,
            ..Default::default()
        }
    }

    /// Clear everything tied to an open position. Called on every close.
    pub fn reset_position(&mut self) {
        self.is_in_position = false;
        self.position = None;
        self.current_stoploss = None;
        self.entry_candle = None;
        self.clear_swap_transients();
    }

    /// Clear the swap-consideration substate (wait flag, focus levels, the
    /// recorded opposite cross).
    pub fn clear_swap_transients(&mut self) {
        self.is_swapping = false;
        self.is_wait_candle = false;
        self.last_focus_price = None;
        self.last_focus_stopprice = None;
        self.last_candle_cross = None;
    }
}

/// Reads and writes the per-symbol session snapshot file
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(state_dir: impl AsRef<Path>, symbol: &Symbol, timeframe: &str) -> Self {
        let path = state_dir
            .as_ref()
            .join(format!("{}_{}_session.json", symbol, timeframe));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no snapshot exists yet (first run)
    pub fn load(&self) -> Result<Option<SessionState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read session snapshot {}", self.path.display()))?;
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse session snapshot {}", self.path.display()))?;
        Ok(Some(state))
    }

    /// Overwrite the snapshot wholesale
    pub fn save(&self, state: &SessionState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state dir {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(state).context("Failed to encode session state")?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write session snapshot {}", self.path.display()))?;
        Ok(())
    }
}
