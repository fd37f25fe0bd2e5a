//! Exchange gateway abstraction
//!
//! The position controller only ever talks to `ExchangeGateway`. Three
//! implementations exist: the real HTTP client (`bybit`), a paper-trading
//! wrapper over it (`paper`), and the backtest simulator in
//! `crate::backtest`.

pub mod bybit;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Candle, Money, Side, Symbol};

pub use bybit::{BybitClient, ClientConfig};
pub use paper::PaperExchange;

/// Typed failures from the exchange layer
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("API error ({code}): {message}")]
    Api { code: i64, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to parse exchange response: {0}")]
    Parse(String),

    #[error("order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("rate limited by exchange")]
    RateLimited,

    #[error("circuit breaker is open, rejecting request")]
    CircuitOpen,

    #[error("no data returned for {0}")]
    NoData(String),
}

impl ExchangeError {
    /// Whether a transport-level retry can plausibly help.
    ///
    /// Order rejections are never retried here: the controller recomputes a
    /// safer price and resubmits once itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_) | ExchangeError::RateLimited | ExchangeError::Api { .. }
        )
    }
}

/// Exchange-level order direction (distinct from position `Side`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Order direction that opens a position on `side`
    pub fn to_open(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order direction that closes a position on `side`
    pub fn to_close(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        }
    }
}

/// Order submission parameters
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Money,
    /// Required for limit orders; for market orders an optional fill hint
    /// the simulators use
    pub price: Option<Money>,
    /// Close-only order, never increases or flips the position
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: Symbol, side: OrderSide, qty: Money) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            reduce_only: false,
        }
    }

    pub fn limit(symbol: Symbol, side: OrderSide, qty: Money, price: Money) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            reduce_only: false,
        }
    }

    pub fn with_price_hint(mut self, price: Money) -> Self {
        self.price = Some(price);
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Acknowledgement for an accepted order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub qty: Money,
    pub price: Option<Money>,
}

/// Open position as the exchange reports it
#[derive(Debug, Clone, PartialEq)]
pub struct PositionInfo {
    pub symbol: Symbol,
    pub side: Side,
    pub size: Money,
    pub entry_price: Money,
    pub leverage: u32,
    pub unrealized_pnl: Money,
}

/// Wallet balance snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountBalance {
    /// Balance plus unrealized PnL
    pub total_equity: Money,
    /// Balance available for new margin
    pub available: Money,
}

/// Async exchange operations the position controller depends on
///
/// Every call is fallible; "no position" and "no data" are ordinary results,
/// not errors, wherever the type allows it.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Last traded price
    async fn fetch_price(&self, symbol: &Symbol) -> Result<Money, ExchangeError>;

    /// Closed candles, ascending time. Implementations must not return the
    /// still-forming candle.
    async fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Open position, `None` when flat
    async fn fetch_position(&self, symbol: &Symbol) -> Result<Option<PositionInfo>, ExchangeError>;

    async fn fetch_balance(&self) -> Result<AccountBalance, ExchangeError>;

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn cancel_all_orders(&self, symbol: &Symbol) -> Result<(), ExchangeError>;

    /// Amend the position's protective stop price
    async fn change_stop(&self, symbol: &Symbol, stop: Money) -> Result<(), ExchangeError>;

    /// Flip the open position in one-way mode by submitting a
    /// double-quantity opposing market order. Returns the flip order ack.
    async fn swap_side(&self, symbol: &Symbol) -> Result<OrderAck, ExchangeError>;

    /// Exchange clock, used as the startup health check
    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError>;
}
