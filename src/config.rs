//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::indicators::RsiSettings;
use crate::types::{timeframe_to_ms, Symbol};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeSettings,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        // Credentials never live in the config file
        if let Ok(api_key) = std::env::var("BYBIT_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BYBIT_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configs the state machine cannot run safely on
    pub fn validate(&self) -> Result<()> {
        let s = &self.strategy;

        if s.symbol.trim().is_empty() {
            bail!("strategy.symbol must not be empty");
        }
        if timeframe_to_ms(&s.timeframe).is_none() {
            bail!("strategy.timeframe {:?} is not a valid timeframe", s.timeframe);
        }
        if s.oversold >= s.overbought {
            bail!(
                "strategy.oversold ({}) must be below strategy.overbought ({})",
                s.oversold,
                s.overbought
            );
        }
        if s.rsi.period_min == 0 || s.rsi.period_min > s.rsi.period_max {
            bail!(
                "rsi period bounds invalid: min={} max={}",
                s.rsi.period_min,
                s.rsi.period_max
            );
        }
        if s.rsi.atr_length_short == 0 || s.rsi.atr_length_long == 0 {
            bail!("atr lengths must be >= 1");
        }
        if s.leverage == 0 {
            bail!("strategy.leverage must be >= 1");
        }
        if s.take_profits.is_empty() {
            bail!("strategy.take_profits must configure at least one level");
        }
        for level in &s.take_profits {
            if level.target_atr <= 0.0 {
                bail!("take-profit {:?} has non-positive target_atr", level.id);
            }
            if let TpSize::Portion(portion) = level.size {
                if !(portion > 0.0 && portion <= 1.0) {
                    bail!(
                        "take-profit {:?} portion {} must be in (0, 1]",
                        level.id,
                        portion
                    );
                }
            }
        }

        Ok(())
    }

    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.strategy.symbol)
    }

    /// Hash of the strategy section, stored in the session snapshot so a
    /// resume under changed parameters can be flagged.
    pub fn strategy_hash(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let serialized = serde_json::to_string(&self.strategy).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        serialized.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// Exchange connection and fee model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    /// Signed-request receive window in milliseconds
    pub recv_window_ms: u64,
    pub taker_fee: f64,
    pub assumed_slippage: f64,
    pub max_retries: u32,
    /// Requests per second against the REST API
    pub rate_limit: u32,
    pub timeout_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        ExchangeSettings {
            base_url: "https://api.bybit.com".to_string(),
            api_key: None,
            api_secret: None,
            recv_window_ms: 5000,
            taker_fee: 0.00055, // 0.055%
            assumed_slippage: 0.0005,
            max_retries: 3,
            rate_limit: 10,
            timeout_secs: 30,
        }
    }
}

/// Strategy parameters for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub symbol: String,
    pub timeframe: String,
    pub leverage: u32,
    /// Base entry notional in quote currency
    pub entry_notional: f64,
    /// When set, base notional = balance * pct / 100 instead of the fixed
    /// notional above
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_balance_pct: Option<f64>,
    pub oversold: f64,
    pub overbought: f64,
    pub rsi: RsiSettings,
    pub take_profits: Vec<TakeProfitLevel>,
    /// Bias factor widening each TP target in the favorable direction
    pub tp_threshold: f64,
    /// Trigger offset (%) beyond the signal candle extreme before a pending
    /// entry activates
    pub entry_trigger_pct: f64,
    /// Buffer (%) applied away from the market when placing stops
    pub stop_buffer_pct: f64,
    /// Buffer (%) on the breakeven stop after the move-stop TP level fills
    pub breakeven_buffer_pct: f64,
    /// Closed candles required after entry before the trailing rule runs
    pub trail_min_candles: usize,
    /// Target risk (%); notional is scaled so the stop distance risks this
    /// much of it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_risk_pct: Option<f64>,
    /// Exchange minimum order notional in quote currency
    pub min_notional: f64,
    /// Maintenance-margin ratio at or below which the backtest force-closes
    pub maintenance_margin_ratio: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            symbol: "BTCUSDT".to_string(),
            timeframe: "4h".to_string(),
            leverage: 10,
            entry_notional: 1000.0,
            entry_balance_pct: None,
            oversold: 32.0,
            overbought: 68.0,
            rsi: RsiSettings::default(),
            take_profits: vec![
                TakeProfitLevel {
                    id: "tp1".to_string(),
                    size: TpSize::Portion(0.5),
                    target_atr: 1.0,
                    move_stop: true,
                },
                TakeProfitLevel {
                    id: "tp2".to_string(),
                    size: TpSize::Max,
                    target_atr: 2.0,
                    move_stop: false,
                },
            ],
            tp_threshold: 0.05,
            entry_trigger_pct: 0.1,
            stop_buffer_pct: 0.1,
            breakeven_buffer_pct: 0.05,
            trail_min_candles: 2,
            fixed_risk_pct: Some(4.0),
            min_notional: 5.0,
            maintenance_margin_ratio: 0.5,
        }
    }
}

impl StrategyConfig {
    /// Closed candles needed before the indicator stack is fully warm
    pub fn warmup_candles(&self) -> usize {
        let atr = self.rsi.atr_length_long.max(self.rsi.atr_length_short);
        atr + self.rsi.period_max + 2
    }

    /// How much history a live tick fetches
    pub fn history_limit(&self) -> usize {
        self.warmup_candles() + 50
    }
}

/// One rung of the take-profit ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub id: String,
    pub size: TpSize,
    /// Target distance from entry, in multiples of the long ATR
    pub target_atr: f64,
    /// Move the stop to breakeven when this level fills
    #[serde(default)]
    pub move_stop: bool,
}

/// Sizing of a take-profit level: a fraction of the position, or "MAX" for
/// everything that remains
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TpSize {
    Portion(f64),
    Max,
}

impl Serialize for TpSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            TpSize::Portion(portion) => serializer.serialize_f64(*portion),
            TpSize::Max => serializer.serialize_str("MAX"),
        }
    }
}

impl<'de> Deserialize<'de> for TpSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(portion) => Ok(TpSize::Portion(portion)),
            Raw::Text(text) if text.eq_ignore_ascii_case("max") => Ok(TpSize::Max),
            Raw::Text(text) => Err(serde::de::Error::custom(format!(
                "invalid take-profit size {:?}, expected a fraction or \"MAX\"",
                text
            ))),
        }
    }
}

/// Live loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub poll_interval_secs: u64,
    pub state_dir: String,
    pub records_dir: String,
    /// Consecutive failed ticks tolerated before the process aborts
    pub max_consecutive_errors: u32,
    /// Starting balance for --paper mode
    pub paper_balance: f64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            poll_interval_secs: 10,
            state_dir: "state".to_string(),
            records_dir: "records".to_string(),
            max_consecutive_errors: 10,
            paper_balance: 10_000.0,
        }
    }
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub data_dir: String,
    pub initial_balance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            data_dir: "data".to_string(),
            initial_balance: 10_000.0,
            start_date: None,
            end_date: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.strategy.oversold = 70.0;
        config.strategy.overbought = 30.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_timeframe() {
        let mut config = Config::default();
        config.strategy.timeframe = "4x".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_ladder() {
        let mut config = Config::default();
        config.strategy.take_profits.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_portion() {
        let mut config = Config::default();
        config.strategy.take_profits[0].size = TpSize::Portion(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tp_size_serde() {
        let ladder = vec![
            TakeProfitLevel {
                id: "tp1".to_string(),
                size: TpSize::Portion(0.5),
                target_atr: 1.0,
                move_stop: true,
            },
            TakeProfitLevel {
                id: "tp2".to_string(),
                size: TpSize::Max,
                target_atr: 2.0,
                move_stop: false,
            },
        ];

        let json = serde_json::to_string(&ladder).unwrap();
        assert!(json.contains("0.5"));
        assert!(json.contains("\"MAX\""));

        let parsed: Vec<TakeProfitLevel> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ladder);

        let lowercase: TpSize = serde_json::from_str("\"max\"").unwrap();
        assert_eq!(lowercase, TpSize::Max);
        assert!(serde_json::from_str::<TpSize>("\"half\"").is_err());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{
            "strategy": {
                "symbol": "ETHUSDT",
                "oversold": 30.0,
                "overbought": 70.0
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.strategy.symbol, "ETHUSDT");
        assert_eq!(config.strategy.timeframe, "4h");
        assert_eq!(config.strategy.leverage, 10);
        assert_eq!(config.exchange.base_url, "https://api.bybit.com");
        assert_eq!(config.live.poll_interval_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_strategy_hash_tracks_parameters() {
        let base = Config::default();
        let mut changed = Config::default();
        changed.strategy.oversold = 25.0;

        assert_eq!(base.strategy_hash(), Config::default().strategy_hash());
        assert_ne!(base.strategy_hash(), changed.strategy_hash());
    }

    #[test]
    fn test_warmup_covers_indicator_lengths() {
        let strategy = StrategyConfig::default();
        assert!(strategy.warmup_candles() > strategy.rsi.period_max);
        assert!(strategy.warmup_candles() > strategy.rsi.atr_length_long);
        assert!(strategy.history_limit() > strategy.warmup_candles());
    }
}
