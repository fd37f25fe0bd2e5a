//! Paper trading gateway
//!
//! Wraps a real gateway: market-data calls pass through untouched while
//! account calls run against a simulated balance with the same fee model the
//! backtest uses. The position controller cannot tell paper from real.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ExchangeSettings;
use crate::types::{Candle, Money, Side, Symbol};

use super::{
    AccountBalance, ExchangeError, ExchangeGateway, OrderAck, OrderRequest, OrderSide,
    PositionInfo,
};

/// One net simulated position
#[derive(Debug, Clone, PartialEq)]
pub struct SimPosition {
    pub side: Side,
    pub size: Money,
    pub entry_price: Money,
    pub leverage: u32,
}

impl SimPosition {
    pub fn unrealized_pnl(&self, mark: Money) -> Money {
        match self.side {
            Side::Long => (mark - self.entry_price) * self.size,
            Side::Short => (self.entry_price - mark) * self.size,
        }
    }

    pub fn initial_margin(&self) -> Money {
        self.entry_price * self.size / Money::from_i64(i64::from(self.leverage.max(1)))
    }
}

/// Simulated derivatives account in one-way position mode: cash, one net
/// position, the protective stop. The paper gateway and the backtest
/// simulator both drive their fills through this, so fees accrue identically
/// in both modes.
#[derive(Debug)]
pub struct AccountSim {
    cash: Money,
    taker_fee: Money,
    leverage: u32,
    position: Option<SimPosition>,
    stop: Option<Money>,
    fees_paid: Money,
    next_order_id: u64,
}

impl AccountSim {
    pub fn new(starting_balance: Money, taker_fee: Money, leverage: u32) -> Self {
        Self {
            cash: starting_balance,
            taker_fee,
            leverage,
            position: None,
            stop: None,
            fees_paid: Money::ZERO,
            next_order_id: 1,
        }
    }

    pub fn cash(&self) -> Money {
        self.cash
    }

    pub fn fees_paid(&self) -> Money {
        self.fees_paid
    }

    pub fn position(&self) -> Option<&SimPosition> {
        self.position.as_ref()
    }

    pub fn stop(&self) -> Option<Money> {
        self.stop
    }

    pub fn unrealized_pnl(&self, mark: Money) -> Money {
        self.position
            .as_ref()
            .map_or(Money::ZERO, |p| p.unrealized_pnl(mark))
    }

    pub fn balance(&self, mark: Money) -> AccountBalance {
        let margin = self
            .position
            .as_ref()
            .map_or(Money::ZERO, SimPosition::initial_margin);
        AccountBalance {
            total_equity: self.cash + self.unrealized_pnl(mark),
            available: self.cash - margin,
        }
    }

    pub fn position_info(&self, symbol: &Symbol, mark: Money) -> Option<PositionInfo> {
        self.position.as_ref().map(|p| PositionInfo {
            symbol: symbol.clone(),
            side: p.side,
            size: p.size,
            entry_price: p.entry_price,
            leverage: p.leverage,
            unrealized_pnl: p.unrealized_pnl(mark),
        })
    }

    /// Fill a market order at `fill`. An opposing order first reduces the
    /// open position, realizing PnL; any excess quantity flips the side
    /// (unless reduce-only, which caps at the open size).
    pub fn fill_order(
        &mut self,
        request: &OrderRequest,
        fill: Money,
    ) -> Result<OrderAck, ExchangeError> {
        if !request.qty.is_positive() {
            return Err(ExchangeError::OrderRejected {
                reason: format!("qty {} must be positive", request.qty),
            });
        }
        if !fill.is_positive() {
            return Err(ExchangeError::OrderRejected {
                reason: format!("no valid fill price for {}", request.symbol),
            });
        }

        let opening_side = match request.side {
            OrderSide::Buy => Side::Long,
            OrderSide::Sell => Side::Short,
        };

        match self.position.take() {
            None => {
                if request.reduce_only {
                    return Err(ExchangeError::OrderRejected {
                        reason: "reduce-only order with no open position".to_string(),
                    });
                }
                self.position = Some(SimPosition {
                    side: opening_side,
                    size: request.qty,
                    entry_price: fill,
                    leverage: self.leverage,
                });
            }
            Some(mut p) if p.side == opening_side => {
                if request.reduce_only {
                    self.position = Some(p);
                    return Err(ExchangeError::OrderRejected {
                        reason: "reduce-only order would increase the position".to_string(),
                    });
                }
                let total = p.size + request.qty;
                p.entry_price = (p.entry_price * p.size + fill * request.qty) / total;
                p.size = total;
                self.position = Some(p);
            }
            Some(mut p) => {
                let close_qty = request.qty.min(p.size);
                let flip_qty = if request.reduce_only {
                    Money::ZERO
                } else {
                    request.qty - close_qty
                };

                let realized = match p.side {
                    Side::Long => (fill - p.entry_price) * close_qty,
                    Side::Short => (p.entry_price - fill) * close_qty,
                };
                self.cash += realized;
                p.size = p.size - close_qty;

                if p.size.is_positive() {
                    self.position = Some(p);
                } else {
                    self.stop = None;
                    if flip_qty.is_positive() {
                        self.position = Some(SimPosition {
                            side: opening_side,
                            size: flip_qty,
                            entry_price: fill,
                            leverage: self.leverage,
                        });
                    }
                }
            }
        }

        let fee = request.qty * fill * self.taker_fee;
        self.cash -= fee;
        self.fees_paid += fee;

        let order_id = format!("sim-{}", self.next_order_id);
        self.next_order_id += 1;

        Ok(OrderAck {
            order_id,
            symbol: request.symbol.clone(),
            side: request.side,
            qty: request.qty,
            price: Some(fill),
        })
    }

    /// Amend the protective stop, rejecting prices that would trigger
    /// immediately at the given mark (as the real exchange does).
    pub fn set_stop(&mut self, stop: Money, mark: Money) -> Result<(), ExchangeError> {
        let position = self.position.as_ref().ok_or(ExchangeError::OrderRejected {
            reason: "no open position to attach a stop to".to_string(),
        })?;

        let valid = match position.side {
            Side::Long => stop < mark,
            Side::Short => stop > mark,
        };
        if !valid {
            return Err(ExchangeError::OrderRejected {
                reason: format!("stop {} would trigger immediately at {}", stop, mark),
            });
        }

        self.stop = Some(stop);
        Ok(())
    }

    /// One-way-mode flip: a double-quantity opposing market order at `fill`.
    pub fn flip(&mut self, symbol: &Symbol, fill: Money) -> Result<OrderAck, ExchangeError> {
        let position = self
            .position
            .clone()
            .ok_or_else(|| ExchangeError::NoData(format!("position {}", symbol)))?;

        let request = OrderRequest::market(
            symbol.clone(),
            OrderSide::to_close(position.side),
            position.size + position.size,
        );
        self.fill_order(&request, fill)
    }
}

/// Gateway for `live --paper`: real market data, simulated account
pub struct PaperExchange<G> {
    inner: G,
    symbol: Symbol,
    account: Mutex<AccountSim>,
    slippage: Money,
}

impl<G: ExchangeGateway> PaperExchange<G> {
    pub fn new(
        inner: G,
        symbol: Symbol,
        settings: &ExchangeSettings,
        starting_balance: Money,
        leverage: u32,
    ) -> Self {
        Self {
            inner,
            symbol,
            account: Mutex::new(AccountSim::new(
                starting_balance,
                Money::from_f64(settings.taker_fee),
                leverage,
            )),
            slippage: Money::from_f64(settings.assumed_slippage),
        }
    }

    pub async fn cash(&self) -> Money {
        self.account.lock().await.cash()
    }

    pub async fn fees_paid(&self) -> Money {
        self.account.lock().await.fees_paid()
    }

    /// Fill price for a hintless market order: the mark pushed against the
    /// order direction by the configured slippage. Orders carrying a price
    /// hint fill exactly at the hint (the controller already priced them).
    fn slipped(&self, mark: Money, side: OrderSide) -> Money {
        let offset = mark * self.slippage;
        match side {
            OrderSide::Buy => mark + offset,
            OrderSide::Sell => mark - offset,
        }
    }

    async fn mark(&self) -> Result<Money, ExchangeError> {
        self.inner.fetch_price(&self.symbol).await
    }
}

#[async_trait]
impl<G: ExchangeGateway> ExchangeGateway for PaperExchange<G> {
    async fn fetch_price(&self, symbol: &Symbol) -> Result<Money, ExchangeError> {
        self.inner.fetch_price(symbol).await
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.inner.fetch_ohlcv(symbol, timeframe, since, limit).await
    }

    async fn fetch_position(&self, symbol: &Symbol) -> Result<Option<PositionInfo>, ExchangeError> {
        let account = self.account.lock().await;
        if account.position().is_none() {
            return Ok(None);
        }
        let mark = self.inner.fetch_price(symbol).await?;
        Ok(account.position_info(symbol, mark))
    }

    async fn fetch_balance(&self) -> Result<AccountBalance, ExchangeError> {
        let account = self.account.lock().await;
        let mark = if account.position().is_some() {
            self.inner.fetch_price(&self.symbol).await?
        } else {
            Money::ZERO
        };
        Ok(account.balance(mark))
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let fill = match request.price {
            Some(hint) => hint,
            None => {
                let mark = self.mark().await?;
                self.slipped(mark, request.side)
            }
        };

        let ack = self.account.lock().await.fill_order(request, fill)?;
        info!(
            "📝 [PAPER] {} {} {} filled at {}",
            request.side, request.qty, request.symbol, fill
        );
        Ok(ack)
    }

    async fn cancel_all_orders(&self, symbol: &Symbol) -> Result<(), ExchangeError> {
        debug!("[PAPER] cancel-all for {}: no resting orders to cancel", symbol);
        Ok(())
    }

    async fn change_stop(&self, _symbol: &Symbol, stop: Money) -> Result<(), ExchangeError> {
        let mark = self.mark().await?;
        self.account.lock().await.set_stop(stop, mark)?;
        debug!("[PAPER] stop set to {}", stop);
        Ok(())
    }

    async fn swap_side(&self, symbol: &Symbol) -> Result<OrderAck, ExchangeError> {
        let mark = self.mark().await?;
        let mut account = self.account.lock().await;
        let close_side = account
            .position()
            .map(|p| OrderSide::to_close(p.side))
            .ok_or_else(|| ExchangeError::NoData(format!("position {}", symbol)))?;

        let fill = self.slipped(mark, close_side);
        let ack = account.flip(symbol, fill)?;
        info!("📝 [PAPER] flipped {} at {}", symbol, fill);
        Ok(ack)
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        self.inner.server_time().await
    }
}
