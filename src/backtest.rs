//! Candle-replay backtest
//!
//! Replays cached candles through the same `PositionController` the live
//! loop runs, against a `SimulatedExchange` whose fills and fees go through
//! the one `AccountSim` the paper gateway uses. The controller cannot tell
//! the difference; only the driver changes.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{PositionController, SessionState, TickContext};
use crate::exchange::paper::AccountSim;
use crate::exchange::{
    AccountBalance, ExchangeError, ExchangeGateway, OrderAck, OrderRequest, OrderSide,
    PositionInfo,
};
use crate::recorder::TradeRecorder;
use crate::types::{
    timeframe_to_ms, Candle, EquitySnapshot, Money, PerformanceMetrics, Symbol, TradeRecord,
};
use async_trait::async_trait;

/// Replay clock and the candles served so far
struct MarketState {
    mark: Money,
    now: DateTime<Utc>,
    served: Vec<Candle>,
}

/// Exchange double for replays. `advance` moves the clock one candle; every
/// gateway answer is derived from the candles revealed so far, so the
/// controller can never peek ahead.
pub struct SimulatedExchange {
    account: Mutex<AccountSim>,
    market: Mutex<MarketState>,
    slippage: Money,
}

impl SimulatedExchange {
    pub fn new(
        initial_balance: Money,
        taker_fee: Money,
        slippage: Money,
        leverage: u32,
    ) -> Self {
        Self {
            account: Mutex::new(AccountSim::new(initial_balance, taker_fee, leverage)),
            market: Mutex::new(MarketState {
                mark: Money::ZERO,
                now: Utc.timestamp_millis_opt(0).single().unwrap_or_default(),
                served: Vec::new(),
            }),
            slippage: Money::ZERO.max(slippage),
        }
    }

    /// Reveal the next candle: the mark becomes its close
    pub async fn advance(&self, candle: &Candle, now: DateTime<Utc>) {
        let mut market = self.market.lock().await;
        market.mark = Money::from_f64(candle.close);
        market.now = now;
        market.served.push(candle.clone());
    }

    pub async fn cash(&self) -> Money {
        self.account.lock().await.cash()
    }

    pub async fn fees_paid(&self) -> Money {
        self.account.lock().await.fees_paid()
    }

    fn slipped(&self, mark: Money, side: OrderSide) -> Money {
        let offset = mark * self.slippage;
        match side {
            OrderSide::Buy => mark + offset,
            OrderSide::Sell => mark - offset,
        }
    }

    async fn mark(&self) -> Result<Money, ExchangeError> {
        let market = self.market.lock().await;
        if market.served.is_empty() {
            return Err(ExchangeError::NoData("no candle replayed yet".to_string()));
        }
        Ok(market.mark)
    }
}

#[async_trait]
impl ExchangeGateway for SimulatedExchange {
    async fn fetch_price(&self, _symbol: &Symbol) -> Result<Money, ExchangeError> {
        self.mark().await
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &Symbol,
        _timeframe: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let market = self.market.lock().await;
        let filtered: Vec<Candle> = market
            .served
            .iter()
            .filter(|c| since.map_or(true, |s| c.datetime >= s))
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        Ok(filtered[start..].to_vec())
    }

    async fn fetch_position(&self, symbol: &Symbol) -> Result<Option<PositionInfo>, ExchangeError> {
        let mark = self.market.lock().await.mark;
        Ok(self.account.lock().await.position_info(symbol, mark))
    }

    async fn fetch_balance(&self) -> Result<AccountBalance, ExchangeError> {
        let mark = self.market.lock().await.mark;
        Ok(self.account.lock().await.balance(mark))
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let fill = match request.price {
            Some(hint) => hint,
            None => self.slipped(self.mark().await?, request.side),
        };
        let ack = self.account.lock().await.fill_order(request, fill)?;
        debug!(
            "[SIM] {} {} {} filled at {}",
            request.side, request.qty, request.symbol, fill
        );
        Ok(ack)
    }

    async fn cancel_all_orders(&self, _symbol: &Symbol) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn change_stop(&self, _symbol: &Symbol, stop: Money) -> Result<(), ExchangeError> {
        let mark = self.market.lock().await.mark;
        self.account.lock().await.set_stop(stop, mark)
    }

    async fn swap_side(&self, symbol: &Symbol) -> Result<OrderAck, ExchangeError> {
        let mark = self.mark().await?;
        let mut account = self.account.lock().await;
        let close_side = account
            .position()
            .map(|p| OrderSide::to_close(p.side))
            .ok_or_else(|| ExchangeError::NoData(format!("position {}", symbol)))?;
        let fill = self.slipped(mark, close_side);
        account.flip(symbol, fill)
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        Ok(self.market.lock().await.now)
    }
}

/// Everything a finished replay produced
#[derive(Debug, Serialize)]
pub struct BacktestResult {
    pub symbol: Symbol,
    pub timeframe: String,
    pub initial_balance: f64,
    pub final_equity: f64,
    pub metrics: PerformanceMetrics,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<EquitySnapshot>,
}

pub struct BacktestRunner {
    config: Config,
    candles: Vec<Candle>,
}

impl BacktestRunner {
    pub fn new(config: Config, candles: Vec<Candle>) -> Self {
        Self { config, candles }
    }

    pub async fn run(self) -> Result<BacktestResult> {
        let strategy = self.config.strategy.clone();
        let symbol = self.config.symbol();
        let timeframe_ms = timeframe_to_ms(&strategy.timeframe)
            .with_context(|| format!("invalid timeframe '{}'", strategy.timeframe))?;

        let warmup = strategy.warmup_candles();
        if self.candles.len() <= warmup {
            bail!(
                "not enough candles for {}: {} loaded, indicator warmup needs more than {}",
                symbol,
                self.candles.len(),
                warmup
            );
        }

        let initial_balance = self.config.backtest.initial_balance;
        let sim = Arc::new(SimulatedExchange::new(
            Money::from_f64(initial_balance),
            Money::from_f64(self.config.exchange.taker_fee),
            Money::from_f64(self.config.exchange.assumed_slippage),
            strategy.leverage,
        ));

        info!("🚀 Starting backtest for {} ({})", symbol, strategy.timeframe);
        info!(
            "   {} candles, {} -> {}, initial balance {:.2}",
            self.candles.len(),
            self.candles[0].datetime,
            self.candles[self.candles.len() - 1].datetime,
            initial_balance
        );

        let mut controller = PositionController::new(
            symbol.clone(),
            strategy.clone(),
            &self.config.exchange,
            Arc::clone(&sim),
            TradeRecorder::in_memory(),
            SessionState::fresh(self.config.strategy_hash()),
        )
        .with_margin_check(true);

        // candles before the warmup boundary only feed the indicators
        for candle in &self.candles[..warmup] {
            sim.advance(candle, candle.datetime + Duration::milliseconds(timeframe_ms))
                .await;
        }

        let mut replayed = 0usize;
        for i in warmup..self.candles.len() {
            let candle = &self.candles[i];
            let ctx = TickContext::backtest(&self.candles[..=i], candle, timeframe_ms);
            sim.advance(candle, ctx.now).await;

            if let Err(e) = controller.tick(&ctx).await {
                warn!("tick failed at {}: {:#}", candle.datetime, e);
            }
            controller.record_equity_snapshot(&ctx).await?;
            replayed += 1;
        }

        let last = &self.candles[self.candles.len() - 1];
        let end_ctx = TickContext::backtest(&self.candles, last, timeframe_ms);
        controller.force_close(&end_ctx, "End of Backtest").await?;

        let total_fees = sim.fees_paid().await;
        let (_, recorder) = controller.into_parts();
        let metrics = calculate_metrics(
            recorder.trades(),
            recorder.equity(),
            initial_balance,
            timeframe_ms,
            total_fees.to_f64(),
        );
        let final_equity = recorder
            .equity()
            .last()
            .map_or(initial_balance, |s| s.equity.to_f64());

        info!(
            "✅ Backtest complete: {} ticks, {} trades, final equity {:.2}",
            replayed, metrics.total_trades, final_equity
        );

        Ok(BacktestResult {
            symbol,
            timeframe: strategy.timeframe,
            initial_balance,
            final_equity,
            metrics,
            trades: recorder.trades().to_vec(),
            equity_curve: recorder.equity().to_vec(),
        })
    }
}

/// Report statistics over the closed legs of the ledger and the equity curve
pub fn calculate_metrics(
    trades: &[TradeRecord],
    equity: &[EquitySnapshot],
    initial_balance: f64,
    timeframe_ms: i64,
    total_fees: f64,
) -> PerformanceMetrics {
    let closed: Vec<&TradeRecord> = trades.iter().filter(|t| t.is_close()).collect();
    if closed.is_empty() && equity.is_empty() {
        return PerformanceMetrics::default();
    }

    let pnl_of = |t: &TradeRecord| t.profit_loss.map_or(0.0, Money::to_f64);
    let winners: Vec<f64> = closed.iter().map(|t| pnl_of(t)).filter(|p| *p > 0.0).collect();
    let losers: Vec<f64> = closed.iter().map(|t| pnl_of(t)).filter(|p| *p <= 0.0).collect();

    let final_equity = equity.last().map_or(initial_balance, |s| s.equity.to_f64());
    let total_return = if initial_balance > 0.0 {
        (final_equity - initial_balance) / initial_balance * 100.0
    } else {
        0.0
    };

    let win_rate = if closed.is_empty() {
        0.0
    } else {
        winners.len() as f64 / closed.len() as f64 * 100.0
    };

    let gross_profit: f64 = winners.iter().sum();
    let gross_loss: f64 = losers.iter().map(|p| p.abs()).sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let avg_win = if winners.is_empty() {
        0.0
    } else {
        gross_profit / winners.len() as f64
    };
    let avg_loss = if losers.is_empty() {
        0.0
    } else {
        gross_loss / losers.len() as f64
    };
    let risk_reward = if avg_loss > 0.0 { avg_win / avg_loss } else { 0.0 };

    let expectancy = if closed.is_empty() {
        0.0
    } else {
        let win_frac = winners.len() as f64 / closed.len() as f64;
        let loss_frac = losers.len() as f64 / closed.len() as f64;
        win_frac * avg_win - loss_frac * avg_loss
    };

    let largest_win = winners.iter().copied().fold(0.0, f64::max);
    let largest_loss = losers.iter().copied().fold(0.0, f64::min);

    // peak-to-trough on the equity curve
    let mut peak = initial_balance;
    let mut max_drawdown = 0.0f64;
    for snapshot in equity {
        let value = snapshot.equity.to_f64();
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            let dd = (peak - value) / peak;
            if dd > max_drawdown {
                max_drawdown = dd;
            }
        }
    }

    // per-candle returns annualized by the timeframe
    let returns: Vec<f64> = equity
        .windows(2)
        .filter(|w| w[0].equity.to_f64() > 0.0)
        .map(|w| (w[1].equity.to_f64() - w[0].equity.to_f64()) / w[0].equity.to_f64())
        .collect();
    let sharpe_ratio = if returns.len() > 1 {
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev > 0.0 {
            let periods_per_year = 31_536_000_000.0 / timeframe_ms as f64;
            mean / std_dev * periods_per_year.sqrt()
        } else {
            0.0
        }
    } else {
        0.0
    };

    PerformanceMetrics {
        total_return,
        sharpe_ratio,
        max_drawdown: max_drawdown * 100.0,
        win_rate,
        profit_factor,
        risk_reward,
        expectancy,
        total_trades: closed.len(),
        winning_trades: winners.len(),
        losing_trades: losers.len(),
        avg_win,
        avg_loss,
        largest_win,
        largest_loss,
        total_fees,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::RsiSettings;
    use crate::types::Side;
    use approx::assert_relative_eq;

    fn candle_at(i: i64, open: f64, close: f64) -> Candle {
        let high = open.max(close) + 0.5;
        let low = open.min(close) - 0.5;
        Candle::new_unchecked(
            Utc.timestamp_millis_opt(i * 3_600_000).single().unwrap(),
            open,
            high,
            low,
            close,
            1000.0,
        )
    }

    /// Monotone series: `steps` legs of (count, per-candle close change)
    fn trending_candles(start: f64, steps: &[(usize, f64)]) -> Vec<Candle> {
        let mut candles = Vec::new();
        let mut price = start;
        let mut i = 0i64;
        for &(count, step) in steps {
            for _ in 0..count {
                let open = price;
                price += step;
                candles.push(candle_at(i, open, price));
                i += 1;
            }
        }
        candles
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.strategy.timeframe = "1h".to_string();
        config.strategy.oversold = 40.0;
        config.strategy.overbought = 60.0;
        config.strategy.rsi = RsiSettings {
            period_min: 5,
            period_max: 10,
            atr_length_short: 3,
            atr_length_long: 7,
            ..Default::default()
        };
        config
    }

    fn snapshot(i: i64, equity: f64) -> EquitySnapshot {
        EquitySnapshot {
            timestamp: Utc.timestamp_millis_opt(i * 3_600_000).single().unwrap(),
            balance: Money::from_f64(equity),
            equity: Money::from_f64(equity),
            price: Money::from_f64(100.0),
        }
    }

    fn closed_trade(pnl: f64) -> TradeRecord {
        let entry = Money::from_f64(100.0);
        let exit = entry + Money::from_f64(pnl);
        TradeRecord::close(
            Utc.timestamp_millis_opt(0).single().unwrap(),
            Symbol::new("BTCUSDT"),
            Side::Long,
            entry,
            exit,
            Money::ONE,
            Money::ZERO,
            "test",
        )
    }

    #[tokio::test]
    async fn test_sim_serves_only_revealed_candles() {
        let sim = SimulatedExchange::new(Money::from_f64(1000.0), Money::ZERO, Money::ZERO, 10);
        let symbol = Symbol::new("BTCUSDT");

        // nothing replayed yet
        assert!(matches!(
            sim.fetch_price(&symbol).await,
            Err(ExchangeError::NoData(_))
        ));

        let candles = trending_candles(100.0, &[(5, 1.0)]);
        for c in &candles[..3] {
            sim.advance(c, c.datetime).await;
        }

        assert_eq!(
            sim.fetch_price(&symbol).await.unwrap(),
            Money::from_f64(candles[2].close)
        );
        let served = sim.fetch_ohlcv(&symbol, "1h", None, 100).await.unwrap();
        assert_eq!(served.len(), 3);
        let limited = sim.fetch_ohlcv(&symbol, "1h", None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[1].datetime, candles[2].datetime);
    }

    #[tokio::test]
    async fn test_sim_rejects_stop_on_wrong_side_of_mark() {
        let sim = SimulatedExchange::new(Money::from_f64(1000.0), Money::ZERO, Money::ZERO, 10);
        let symbol = Symbol::new("BTCUSDT");
        let candles = trending_candles(100.0, &[(2, 0.0)]);
        for c in &candles {
            sim.advance(c, c.datetime).await;
        }

        let order = OrderRequest::market(symbol.clone(), OrderSide::Buy, Money::ONE)
            .with_price_hint(Money::from_f64(100.0));
        sim.create_order(&order).await.unwrap();

        // long stop above the mark is an immediate trigger
        assert!(matches!(
            sim.change_stop(&symbol, Money::from_f64(101.0)).await,
            Err(ExchangeError::OrderRejected { .. })
        ));
        assert!(sim.change_stop(&symbol, Money::from_f64(95.0)).await.is_ok());
    }

    #[test]
    fn test_metrics_basic_shape() {
        let trades = vec![closed_trade(30.0), closed_trade(10.0), closed_trade(-20.0)];
        let equity = vec![
            snapshot(0, 10_000.0),
            snapshot(1, 10_030.0),
            snapshot(2, 10_040.0),
            snapshot(3, 10_020.0),
        ];

        let metrics = calculate_metrics(&trades, &equity, 10_000.0, 3_600_000, 1.5);

        assert_eq!(metrics.total_trades, 3);
        assert_eq!(metrics.winning_trades, 2);
        assert_eq!(metrics.losing_trades, 1);
        assert_relative_eq!(metrics.win_rate, 200.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(metrics.profit_factor, 2.0, epsilon = 1e-9);
        assert_relative_eq!(metrics.avg_win, 20.0, epsilon = 1e-9);
        assert_relative_eq!(metrics.avg_loss, 20.0, epsilon = 1e-9);
        assert_relative_eq!(metrics.risk_reward, 1.0, epsilon = 1e-9);
        // 2/3 * 20 - 1/3 * 20
        assert_relative_eq!(metrics.expectancy, 20.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(metrics.total_return, 0.2, epsilon = 1e-9);
        // trough 10020 after peak 10040
        assert_relative_eq!(metrics.max_drawdown, 20.0 / 10_040.0 * 100.0, epsilon = 1e-9);
        assert_relative_eq!(metrics.largest_win, 30.0, epsilon = 1e-9);
        assert_relative_eq!(metrics.largest_loss, -20.0, epsilon = 1e-9);
        assert_relative_eq!(metrics.total_fees, 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_metrics_all_winners_has_infinite_profit_factor() {
        let trades = vec![closed_trade(10.0), closed_trade(5.0)];
        let equity = vec![snapshot(0, 10_000.0), snapshot(1, 10_015.0)];

        let metrics = calculate_metrics(&trades, &equity, 10_000.0, 3_600_000, 0.0);
        assert!(metrics.profit_factor.is_infinite());
        assert_eq!(metrics.losing_trades, 0);
        assert_relative_eq!(metrics.max_drawdown, 0.0);
    }

    #[test]
    fn test_metrics_empty_inputs() {
        let metrics = calculate_metrics(&[], &[], 10_000.0, 3_600_000, 0.0);
        assert_eq!(metrics.total_trades, 0);
        assert_relative_eq!(metrics.total_return, 0.0);
        assert_relative_eq!(metrics.sharpe_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_runner_bails_without_warmup_history() {
        let config = test_config();
        let candles = trending_candles(100.0, &[(5, 1.0)]);
        let err = BacktestRunner::new(config, candles).run().await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_runner_full_cycle_on_v_shaped_market() {
        let config = test_config();
        // long decline pins RSI low; the rally crosses it up through 40,
        // stages a long and rides the trend
        let candles = trending_candles(200.0, &[(30, -2.0), (30, 3.0)]);
        let warmup = config.strategy.warmup_candles();

        let result = BacktestRunner::new(config, candles.clone())
            .run()
            .await
            .unwrap();

        // one snapshot per replayed candle
        assert_eq!(result.equity_curve.len(), candles.len() - warmup);
        assert!(result.metrics.total_trades >= 1, "no trades closed");
        assert_eq!(
            result.metrics.total_trades,
            result.metrics.winning_trades + result.metrics.losing_trades
        );
        // every open eventually closed; ladder partials add extra close legs
        let opens = result.trades.iter().filter(|t| !t.is_close()).count();
        let closes = result.trades.iter().filter(|t| t.is_close()).count();
        assert!(opens >= 1);
        assert!(closes >= opens);
        // riding a straight rally must end profitable
        assert!(result.final_equity > result.initial_balance);
        assert_eq!(
            result.final_equity,
            result.equity_curve.last().unwrap().equity.to_f64()
        );
    }
}
