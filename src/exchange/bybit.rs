//! Bybit v5 REST client
//!
//! A production-grade HTTP client for the Bybit perpetual API with:
//! - Automatic retry with exponential backoff
//! - Token-bucket rate limiting
//! - Circuit breaker pattern for fault tolerance
//! - HMAC-SHA256 request signing
//!
//! Kline responses arrive newest-first; they are reversed and the
//! still-forming candle is dropped so the rest of the system only ever sees
//! closed candles.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};

use crate::config::ExchangeSettings;
use crate::types::{timeframe_to_ms, Candle, Money, Side, Symbol};

use super::{
    AccountBalance, ExchangeError, ExchangeGateway, OrderAck, OrderRequest, OrderType,
    PositionInfo,
};

type HmacSha256 = Hmac<Sha256>;

// ==================== RATE LIMITER ====================

/// Token-bucket limiter: a fixed number of permits per refill interval,
/// consumed (not returned) per request.
#[derive(Debug)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    max_permits: usize,
    last_refill: Arc<Mutex<Instant>>,
    refill_interval: Duration,
}

impl RateLimiter {
    pub fn per_second(requests: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(requests.max(1))),
            max_permits: requests.max(1),
            last_refill: Arc::new(Mutex::new(Instant::now())),
            refill_interval: Duration::from_secs(1),
        }
    }

    /// Wait for a permit and consume it
    pub async fn acquire(&self) {
        self.try_refill().await;

        let permit = self
            .permits
            .acquire()
            .await
            .expect("semaphore is never closed");
        permit.forget();
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn try_refill(&self) {
        let mut last_refill = self.last_refill.lock().await;
        if last_refill.elapsed() >= self.refill_interval {
            let current = self.permits.available_permits();
            let to_add = self.max_permits.saturating_sub(current);
            if to_add > 0 {
                self.permits.add_permits(to_add);
            }
            *last_refill = Instant::now();
        }
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            permits: Arc::clone(&self.permits),
            max_permits: self.max_permits,
            last_refill: Arc::clone(&self.last_refill),
            refill_interval: self.refill_interval,
        }
    }
}

// ==================== CIRCUIT BREAKER ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Requests rejected until the cooldown elapses
    Open,
    /// Probing whether the service recovered
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Successes in HalfOpen before the circuit closes again
    pub success_threshold: u32,
    /// Cooldown spent in Open before probing
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Consecutive-failure breaker guarding the HTTP layer
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    config: CircuitBreakerConfig,
    last_failure_time: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            config,
            last_failure_time: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.last_failure_time {
                Some(last) if last.elapsed() >= self.config.cooldown => {
                    tracing::info!("circuit breaker probing after cooldown");
                    self.state = CircuitState::HalfOpen;
                    self.failure_count = 0;
                    self.success_count = 0;
                    true
                }
                Some(_) => false,
                None => true,
            },
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    tracing::info!("circuit breaker closed after recovery");
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.last_failure_time = Some(Instant::now());
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    tracing::warn!(failures = self.failure_count, "circuit breaker opened");
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("circuit breaker re-opened, probe failed");
                self.state = CircuitState::Open;
                self.failure_count = 0;
                self.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }
}

// ==================== CLIENT CONFIG ====================

/// Client tuning knobs
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub recv_window_ms: u64,
    pub max_retries: u32,
    pub timeout: Duration,
    /// Requests per second
    pub rate_limit: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.bybit.com".to_string(),
            api_key: None,
            api_secret: None,
            recv_window_ms: 5000,
            max_retries: 3,
            timeout: Duration::from_secs(30),
            rate_limit: 10,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_credentials(
        mut self,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        self.api_key = Some(api_key.into());
        self.api_secret = Some(api_secret.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: usize) -> Self {
        self.rate_limit = requests_per_second;
        self
    }
}

impl From<&ExchangeSettings> for ClientConfig {
    fn from(settings: &ExchangeSettings) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            recv_window_ms: settings.recv_window_ms,
            max_retries: settings.max_retries,
            timeout: Duration::from_secs(settings.timeout_secs),
            rate_limit: settings.rate_limit as usize,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

// ==================== SIGNING ====================

#[derive(Debug, Clone)]
struct Credentials {
    api_key: String,
    api_secret: String,
}

/// Bybit v5 signature: HMAC-SHA256 over
/// `timestamp + api_key + recv_window + (query string | request body)`
fn sign_payload(api_secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(api_secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// ==================== WIRE TYPES ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEnvelope<T> {
    ret_code: i64,
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    list: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TickerResult {
    list: Vec<TickerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerEntry {
    symbol: String,
    last_price: String,
}

#[derive(Debug, Deserialize)]
struct WalletResult {
    list: Vec<WalletEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletEntry {
    total_equity: String,
    total_available_balance: String,
}

#[derive(Debug, Deserialize)]
struct PositionListResult {
    list: Vec<PositionEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionEntry {
    side: String,
    size: String,
    avg_price: String,
    leverage: String,
    unrealised_pnl: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreateResult {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeResult {
    time_second: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderBody<'a> {
    category: &'a str,
    symbol: &'a str,
    side: &'a str,
    order_type: &'a str,
    qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<String>,
    reduce_only: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelAllBody<'a> {
    category: &'a str,
    symbol: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TradingStopBody<'a> {
    category: &'a str,
    symbol: &'a str,
    stop_loss: String,
    position_idx: u8,
}

/// Map a Bybit retCode to the typed error taxonomy.
///
/// The 110xxx block is order-level rejection (insufficient balance, stop
/// would trigger immediately, reduce-only violations); those must reach the
/// controller unretried so it can recompute a safer price.
fn map_ret_code(code: i64, message: String) -> ExchangeError {
    match code {
        10006 | 10018 => ExchangeError::RateLimited,
        110000..=110199 => ExchangeError::OrderRejected { reason: message },
        _ => ExchangeError::Api { code, message },
    }
}

/// Bybit v5 kline interval for a timeframe string
fn bybit_interval(timeframe: &str) -> Option<&'static str> {
    Some(match timeframe {
        "1m" => "1",
        "3m" => "3",
        "5m" => "5",
        "15m" => "15",
        "30m" => "30",
        "1h" => "60",
        "2h" => "120",
        "4h" => "240",
        "6h" => "360",
        "12h" => "720",
        "1d" => "D",
        "1w" => "W",
        _ => return None,
    })
}

fn parse_kline_row(row: &[String]) -> Result<Candle, ExchangeError> {
    if row.len() < 6 {
        return Err(ExchangeError::Parse(format!(
            "kline row has {} fields, expected at least 6",
            row.len()
        )));
    }

    let ts: i64 = row[0]
        .parse()
        .map_err(|_| ExchangeError::Parse(format!("bad kline timestamp {:?}", row[0])))?;

    let mut fields = [0.0f64; 5];
    for (i, field) in fields.iter_mut().enumerate() {
        *field = row[i + 1]
            .parse()
            .map_err(|_| ExchangeError::Parse(format!("bad kline field {:?}", row[i + 1])))?;
    }

    Candle::from_timestamp_ms(ts, fields[0], fields[1], fields[2], fields[3], fields[4])
        .map_err(|e| ExchangeError::Parse(format!("invalid candle: {}", e)))
}

/// Drop the still-forming candle, if present, by open-time + timeframe
/// comparison.
fn drop_forming(mut candles: Vec<Candle>, timeframe_ms: i64, now: DateTime<Utc>) -> Vec<Candle> {
    while let Some(last) = candles.last() {
        if last.is_closed(timeframe_ms, now) {
            break;
        }
        candles.pop();
    }
    candles
}

fn parse_decimal(value: &str, what: &str) -> Result<Money, ExchangeError> {
    Decimal::from_str(value)
        .map(Money::from_decimal)
        .map_err(|_| ExchangeError::Parse(format!("bad {} {:?}", what, value)))
}

// ==================== CLIENT ====================

/// Bybit perpetual REST client (linear category, one-way position mode)
#[derive(Clone)]
pub struct BybitClient {
    base_url: String,
    credentials: Option<Credentials>,
    recv_window_ms: u64,
    http_client: Client,
    circuit_breaker: Arc<Mutex<CircuitBreaker>>,
    rate_limiter: RateLimiter,
    max_retries: u32,
}

impl BybitClient {
    pub fn new(config: ClientConfig) -> Self {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to build HTTP client");

        let credentials = match (config.api_key, config.api_secret) {
            (Some(api_key), Some(api_secret)) => Some(Credentials {
                api_key,
                api_secret,
            }),
            _ => None,
        };

        Self {
            base_url: config.base_url,
            credentials,
            recv_window_ms: config.recv_window_ms,
            http_client,
            circuit_breaker: Arc::new(Mutex::new(CircuitBreaker::new(config.circuit_breaker))),
            rate_limiter: RateLimiter::per_second(config.rate_limit),
            max_retries: config.max_retries,
        }
    }

    /// Build a client from the `exchange` config section
    pub fn from_settings(settings: &ExchangeSettings) -> Self {
        Self::new(ClientConfig::from(settings))
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.lock().await.state()
    }

    pub fn available_rate_limit(&self) -> usize {
        self.rate_limiter.available_permits()
    }

    /// Execute a request with rate limiting, the circuit breaker and
    /// exponential backoff. Non-retryable errors (order rejections, parse
    /// failures) return immediately and do not count against the breaker.
    async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        {
            let mut cb = self.circuit_breaker.lock().await;
            if !cb.can_attempt() {
                return Err(ExchangeError::CircuitOpen);
            }
        }

        self.rate_limiter.acquire().await;

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s...
                let delay = Duration::from_secs(2u64.pow(attempt - 1));
                tracing::debug!("retrying after {}ms", delay.as_millis());
                sleep(delay).await;
            }

            match operation().await {
                Ok(result) => {
                    self.circuit_breaker.lock().await.record_success();
                    return Ok(result);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        "request failed (attempt {}/{}): {}",
                        attempt + 1,
                        self.max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        self.circuit_breaker.lock().await.record_failure();
        Err(last_error
            .unwrap_or_else(|| ExchangeError::Network("request failed after retries".to_string())))
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        Self::read_envelope(response).await
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<T, ExchangeError> {
        let creds = self.require_credentials()?;
        let timestamp = Utc::now().timestamp_millis().to_string();
        let payload = format!("{}{}{}{}", timestamp, creds.api_key, self.recv_window_ms, query);
        let signature = sign_payload(&creds.api_secret, &payload);

        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self
            .http_client
            .get(&url)
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        Self::read_envelope(response).await
    }

    async fn signed_post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ExchangeError> {
        let creds = self.require_credentials()?;
        let json_body = serde_json::to_string(body)
            .map_err(|e| ExchangeError::Parse(format!("failed to encode request: {}", e)))?;

        let timestamp = Utc::now().timestamp_millis().to_string();
        let payload = format!(
            "{}{}{}{}",
            timestamp, creds.api_key, self.recv_window_ms, json_body
        );
        let signature = sign_payload(&creds.api_secret, &payload);

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature)
            .body(json_body)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        Self::read_envelope(response).await
    }

    async fn read_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited);
        }
        if !status.is_success() {
            return Err(ExchangeError::Network(format!(
                "HTTP {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&text).map_err(|e| {
            ExchangeError::Parse(format!(
                "{} in {}",
                e,
                text.chars().take(200).collect::<String>()
            ))
        })?;

        if envelope.ret_code != 0 {
            return Err(map_ret_code(envelope.ret_code, envelope.ret_msg));
        }

        envelope
            .result
            .ok_or_else(|| ExchangeError::Parse("missing result field".to_string()))
    }

    fn require_credentials(&self) -> Result<&Credentials, ExchangeError> {
        self.credentials.as_ref().ok_or(ExchangeError::Api {
            code: 401,
            message: "API credentials not configured".to_string(),
        })
    }
}

#[async_trait]
impl ExchangeGateway for BybitClient {
    async fn fetch_price(&self, symbol: &Symbol) -> Result<Money, ExchangeError> {
        let symbol = symbol.clone();
        self.execute_with_retry(|| {
            let this = self.clone();
            let symbol = symbol.clone();

            async move {
                let query = format!("category=linear&symbol={}", symbol);
                let result: TickerResult = this.public_get("/v5/market/tickers", &query).await?;

                let entry = result
                    .list
                    .into_iter()
                    .find(|t| t.symbol == symbol.as_str())
                    .ok_or_else(|| ExchangeError::NoData(format!("ticker {}", symbol)))?;

                parse_decimal(&entry.last_price, "last price")
            }
        })
        .await
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let interval = bybit_interval(timeframe).ok_or_else(|| {
            ExchangeError::Parse(format!("unsupported timeframe {:?}", timeframe))
        })?;
        let timeframe_ms = timeframe_to_ms(timeframe)
            .ok_or_else(|| ExchangeError::Parse(format!("unsupported timeframe {:?}", timeframe)))?;

        let symbol = symbol.clone();
        let interval = interval.to_string();

        self.execute_with_retry(|| {
            let this = self.clone();
            let symbol = symbol.clone();
            let interval = interval.clone();

            async move {
                let mut query = format!(
                    "category=linear&symbol={}&interval={}&limit={}",
                    symbol,
                    interval,
                    limit.clamp(1, 1000)
                );
                if let Some(since) = since {
                    query.push_str(&format!("&start={}", since.timestamp_millis()));
                }

                let result: KlineResult = this.public_get("/v5/market/kline", &query).await?;
                if result.list.is_empty() {
                    return Err(ExchangeError::NoData(format!("kline {}", symbol)));
                }

                // newest first on the wire
                let mut candles = Vec::with_capacity(result.list.len());
                for row in result.list.iter().rev() {
                    candles.push(parse_kline_row(row)?);
                }

                Ok(drop_forming(candles, timeframe_ms, Utc::now()))
            }
        })
        .await
    }

    async fn fetch_position(&self, symbol: &Symbol) -> Result<Option<PositionInfo>, ExchangeError> {
        let symbol = symbol.clone();
        self.execute_with_retry(|| {
            let this = self.clone();
            let symbol = symbol.clone();

            async move {
                let query = format!("category=linear&symbol={}", symbol);
                let result: PositionListResult =
                    this.signed_get("/v5/position/list", &query).await?;

                let entry = match result.list.into_iter().next() {
                    Some(entry) => entry,
                    None => return Ok(None),
                };

                let size = parse_decimal(&entry.size, "position size")?;
                let side = match entry.side.as_str() {
                    "Buy" => Side::Long,
                    "Sell" => Side::Short,
                    _ => return Ok(None),
                };
                if size.is_zero() {
                    return Ok(None);
                }

                Ok(Some(PositionInfo {
                    symbol: symbol.clone(),
                    side,
                    size,
                    entry_price: parse_decimal(&entry.avg_price, "avg price")?,
                    leverage: entry.leverage.parse::<f64>().unwrap_or(1.0).round() as u32,
                    unrealized_pnl: parse_decimal(&entry.unrealised_pnl, "unrealized pnl")?,
                }))
            }
        })
        .await
    }

    async fn fetch_balance(&self) -> Result<AccountBalance, ExchangeError> {
        self.execute_with_retry(|| {
            let this = self.clone();

            async move {
                let query = "accountType=UNIFIED";
                let result: WalletResult =
                    this.signed_get("/v5/account/wallet-balance", query).await?;

                let entry = result
                    .list
                    .into_iter()
                    .next()
                    .ok_or_else(|| ExchangeError::NoData("wallet balance".to_string()))?;

                Ok(AccountBalance {
                    total_equity: parse_decimal(&entry.total_equity, "total equity")?,
                    available: parse_decimal(&entry.total_available_balance, "available")?,
                })
            }
        })
        .await
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let request = request.clone();
        self.execute_with_retry(|| {
            let this = self.clone();
            let request = request.clone();

            async move {
                let body = CreateOrderBody {
                    category: "linear",
                    symbol: request.symbol.as_str(),
                    side: request.side.as_str(),
                    order_type: request.order_type.as_str(),
                    qty: request.qty.to_string(),
                    price: match request.order_type {
                        OrderType::Limit => request.price.map(|p| p.to_string()),
                        OrderType::Market => None,
                    },
                    reduce_only: request.reduce_only,
                };

                let result: OrderCreateResult =
                    this.signed_post("/v5/order/create", &body).await?;

                Ok(OrderAck {
                    order_id: result.order_id,
                    symbol: request.symbol.clone(),
                    side: request.side,
                    qty: request.qty,
                    price: request.price,
                })
            }
        })
        .await
    }

    async fn cancel_all_orders(&self, symbol: &Symbol) -> Result<(), ExchangeError> {
        let symbol = symbol.clone();
        self.execute_with_retry(|| {
            let this = self.clone();
            let symbol = symbol.clone();

            async move {
                let body = CancelAllBody {
                    category: "linear",
                    symbol: symbol.as_str(),
                };
                let _: serde_json::Value = this.signed_post("/v5/order/cancel-all", &body).await?;
                Ok(())
            }
        })
        .await
    }

    async fn change_stop(&self, symbol: &Symbol, stop: Money) -> Result<(), ExchangeError> {
        let symbol = symbol.clone();
        self.execute_with_retry(|| {
            let this = self.clone();
            let symbol = symbol.clone();

            async move {
                let body = TradingStopBody {
                    category: "linear",
                    symbol: symbol.as_str(),
                    stop_loss: stop.to_string(),
                    position_idx: 0,
                };
                let _: serde_json::Value =
                    this.signed_post("/v5/position/trading-stop", &body).await?;
                Ok(())
            }
        })
        .await
    }

    async fn swap_side(&self, symbol: &Symbol) -> Result<OrderAck, ExchangeError> {
        let position = self
            .fetch_position(symbol)
            .await?
            .ok_or_else(|| ExchangeError::NoData(format!("position {}", symbol)))?;

        // one-way mode: an opposing order for twice the size flips the
        // position in a single fill
        let flip = OrderRequest::market(
            symbol.clone(),
            super::OrderSide::to_close(position.side),
            position.size + position.size,
        );

        self.create_order(&flip).await
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        self.execute_with_retry(|| {
            let this = self.clone();

            async move {
                let result: ServerTimeResult = this.public_get("/v5/market/time", "").await?;
                let seconds: i64 = result
                    .time_second
                    .parse()
                    .map_err(|_| ExchangeError::Parse("bad server time".to_string()))?;

                Utc.timestamp_opt(seconds, 0)
                    .single()
                    .ok_or_else(|| ExchangeError::Parse("bad server time".to_string()))
            }
        })
        .await
    }
}
