//! Perpetual-Futures Dynamic-RSI Trader
//!
//! A single-symbol automated trading system for perpetual futures: a
//! volatility-adaptive RSI signal engine, a staged-entry position state
//! machine with trailing stops, take-profit ladder and side swaps, plus
//! backtesting against cached candle history and a paper/live trading loop.

pub mod backtest;
pub mod config;
pub mod data;
pub mod engine;
pub mod exchange;
pub mod indicators;
pub mod recorder;
pub mod signal;
pub mod types;

pub use config::Config;
pub use types::{Candle, Money, Side, Symbol};
