//! Position state machine
//!
//! One `PositionController` instance per symbol owns the session state and
//! drives every transition: entry staging and activation, stop trailing,
//! stop hits, the take-profit ladder, swap consideration and the swap
//! itself. `tick` is the only entry point and never sleeps; scheduling lives
//! entirely in the drivers (the live loop, the backtest runner, tests).

pub mod session;
pub mod sizing;
pub mod trailing;

pub use session::{PendingEntry, Position, SessionState, SessionStore};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{ExchangeSettings, StrategyConfig, TakeProfitLevel, TpSize};
use crate::exchange::{ExchangeError, ExchangeGateway, OrderRequest, OrderSide};
use crate::indicators::IndicatorEngine;
use crate::recorder::TradeRecorder;
use crate::signal::{Detection, Signal, SignalDetector};
use crate::types::{Candle, EquitySnapshot, Money, Side, Symbol, TradeRecord};

/// Everything one tick observes. Live ticks collapse both extremes to the
/// fetched price; backtest ticks carry the replayed candle's low/high so
/// intra-candle stop and take-profit touches are seen.
#[derive(Debug, Clone, Copy)]
pub struct TickContext<'a> {
    /// Closed candles, ascending time; never includes the forming candle
    pub closed_candles: &'a [Candle],
    pub price: Money,
    pub tick_low: Money,
    pub tick_high: Money,
    pub now: DateTime<Utc>,
}

impl<'a> TickContext<'a> {
    pub fn live(closed_candles: &'a [Candle], price: Money, now: DateTime<Utc>) -> Self {
        Self {
            closed_candles,
            price,
            tick_low: price,
            tick_high: price,
            now,
        }
    }

    /// Context for replaying `candle` (the newest entry of `closed_candles`)
    pub fn backtest(closed_candles: &'a [Candle], candle: &Candle, timeframe_ms: i64) -> Self {
        let close_time = Utc
            .timestamp_millis_opt(candle.timestamp_ms() + timeframe_ms)
            .single()
            .unwrap_or(candle.datetime);
        Self {
            closed_candles,
            price: Money::from_f64(candle.close),
            tick_low: Money::from_f64(candle.low),
            tick_high: Money::from_f64(candle.high),
            now: close_time,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FeeModel {
    taker_fee: Money,
    slippage: Money,
}

pub struct PositionController<G> {
    symbol: Symbol,
    strategy: StrategyConfig,
    fees: FeeModel,
    gateway: Arc<G>,
    engine: IndicatorEngine,
    detector: SignalDetector,
    state: SessionState,
    recorder: TradeRecorder,
    enforce_margin_check: bool,
}

impl<G: ExchangeGateway> PositionController<G> {
    pub fn new(
        symbol: Symbol,
        strategy: StrategyConfig,
        exchange: &ExchangeSettings,
        gateway: Arc<G>,
        recorder: TradeRecorder,
        state: SessionState,
    ) -> Self {
        let engine = IndicatorEngine::new(strategy.rsi.clone());
        let detector = SignalDetector::new(
            IndicatorEngine::new(strategy.rsi.clone()),
            strategy.oversold,
            strategy.overbought,
        );
        Self {
            symbol,
            strategy,
            fees: FeeModel {
                taker_fee: Money::from_f64(exchange.taker_fee),
                slippage: Money::from_f64(exchange.assumed_slippage),
            },
            gateway,
            engine,
            detector,
            state,
            recorder,
            enforce_margin_check: false,
        }
    }

    /// Backtests enable the maintenance-margin force-close; the live path
    /// leaves liquidation to the exchange.
    pub fn with_margin_check(mut self, enabled: bool) -> Self {
        self.enforce_margin_check = enabled;
        self
    }

    pub fn session(&self) -> &SessionState {
        &self.state
    }

    pub fn session_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    pub fn recorder(&self) -> &TradeRecorder {
        &self.recorder
    }

    pub fn into_parts(self) -> (SessionState, TradeRecorder) {
        (self.state, self.recorder)
    }

    /// One full pass of the state machine, in priority order: reconcile,
    /// margin check, trailing, stop hit, take-profit ladder, focus break
    /// (swap), then entry staging / wait-candle progression.
    pub async fn tick(&mut self, ctx: &TickContext<'_>) -> Result<()> {
        if self.state.is_swapping {
            // a swap never survives a tick boundary; a leftover flag means
            // the previous one was interrupted
            warn!("clearing interrupted swap flag");
            self.state.is_swapping = false;
        }

        if self.reconcile(ctx).await? {
            self.state.last_candle_time = ctx.closed_candles.last().map(|c| c.datetime);
            return Ok(());
        }

        let frames = self.engine.compute(ctx.closed_candles);
        let detection = self.detector.detect_with_frames(ctx.closed_candles, &frames);
        let atr_long = frames.last().and_then(|f| f.atr_long);

        if self.state.is_in_position {
            self.in_position_tick(ctx, &detection, atr_long).await?;
        } else {
            if let Some(signal) = detection.signal() {
                self.stage_entry(signal);
            }
            self.drive_pending_entry(ctx).await?;
        }

        self.state.last_candle_time = ctx.closed_candles.last().map(|c| c.datetime);
        Ok(())
    }

    async fn in_position_tick(
        &mut self,
        ctx: &TickContext<'_>,
        detection: &Detection,
        atr_long: Option<f64>,
    ) -> Result<()> {
        if self.enforce_margin_check && self.margin_call(ctx).await? {
            return Ok(());
        }
        self.trail_stop(ctx).await?;
        if self.stop_hit(ctx).await? {
            return Ok(());
        }
        if let Some(atr) = atr_long {
            if self.take_profits(ctx, atr).await? {
                return Ok(());
            }
        }
        if self.focus_break_swap(ctx).await? {
            return Ok(());
        }
        self.advance_wait_candle(ctx);
        self.arm_wait_candle(detection);
        Ok(())
    }

    /// Appended by the drivers once per closed candle
    pub async fn record_equity_snapshot(&mut self, ctx: &TickContext<'_>) -> Result<()> {
        let balance = self
            .gateway
            .fetch_balance()
            .await
            .context("balance fetch for equity snapshot failed")?;
        let upnl = self
            .state
            .position
            .as_ref()
            .map_or(Money::ZERO, |p| p.unrealized_pnl(ctx.price));
        self.recorder.record_equity(EquitySnapshot {
            timestamp: ctx.now,
            balance: balance.total_equity - upnl,
            equity: balance.total_equity,
            price: ctx.price,
        })
    }

    /// Close any open position at the market (backtest end)
    pub async fn force_close(&mut self, ctx: &TickContext<'_>, reason: &str) -> Result<()> {
        if self.state.position.is_some() {
            self.close_position(ctx, ctx.price, reason).await?;
        }
        Ok(())
    }

    // ==================== RECONCILE ====================

    /// Exchange is ground truth. A local position the exchange no longer
    /// holds is closed locally (the protective stop most likely filled while
    /// the process was away); the reverse direction is reported but never
    /// adopted, since the ledger cannot fabricate entry data it never saw.
    async fn reconcile(&mut self, ctx: &TickContext<'_>) -> Result<bool> {
        let remote = self
            .gateway
            .fetch_position(&self.symbol)
            .await
            .context("position fetch for reconciliation failed")?;

        match (self.state.position.clone(), remote) {
            (Some(local), None) => {
                let exit = self.state.current_stoploss.unwrap_or(ctx.price);
                warn!(
                    "⚠️ exchange reports flat but local state holds a {} position; reconciling at {}",
                    local.side, exit
                );
                self.record_close(ctx.now, &local, local.size, exit, "Reconciled (exchange flat)")?;
                self.state.reset_position();
                Ok(true)
            }
            (None, Some(remote)) => {
                error!(
                    "❌ exchange holds an untracked {} position of {} {}; operator action required",
                    remote.side, remote.size, remote.symbol
                );
                Ok(false)
            }
            (Some(local), Some(remote)) if local.side != remote.side => {
                error!(
                    "❌ exchange position side {} does not match local {}; operator action required",
                    remote.side, local.side
                );
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    // ==================== MARGIN ====================

    async fn margin_call(&mut self, ctx: &TickContext<'_>) -> Result<bool> {
        let Some(position) = self.state.position.clone() else {
            return Ok(false);
        };
        let margin = position.initial_margin();
        if !margin.is_positive() {
            return Ok(false);
        }

        let ratio = (margin + position.unrealized_pnl(ctx.price)) / margin;
        if ratio > Money::from_f64(self.strategy.maintenance_margin_ratio) {
            return Ok(false);
        }

        error!(
            "❌ Margin Call: maintenance ratio {} at price {}",
            ratio.round_dp(4),
            ctx.price
        );
        self.close_position(ctx, ctx.price, "Margin Call").await?;
        Ok(true)
    }

    // ==================== STOPS ====================

    async fn trail_stop(&mut self, ctx: &TickContext<'_>) -> Result<()> {
        let Some(position) = self.state.position.clone() else {
            return Ok(());
        };
        let elapsed = trailing::candles_closed_since(ctx.closed_candles, position.entry_time);
        if elapsed < self.strategy.trail_min_candles {
            return Ok(());
        }
        let Some(candidate) = trailing::three_candle_stop(ctx.closed_candles, position.side) else {
            return Ok(());
        };

        if let Some(stop) = trailing::tightened(self.state.current_stoploss, candidate, position.side)
        {
            self.set_stop(stop, "three-candle trail").await?;
        }
        Ok(())
    }

    async fn stop_hit(&mut self, ctx: &TickContext<'_>) -> Result<bool> {
        let Some(position) = self.state.position.clone() else {
            return Ok(false);
        };
        let Some(stop) = self.state.current_stoploss else {
            return Ok(false);
        };

        let touched = match position.side {
            Side::Long => ctx.tick_low <= stop,
            Side::Short => ctx.tick_high >= stop,
        };
        if !touched {
            return Ok(false);
        }

        // worst of stop and market, then slippage against the position
        let base = match position.side {
            Side::Long => stop.min(ctx.price),
            Side::Short => stop.max(ctx.price),
        };
        let exit = self.slipped_close(base, position.side);
        info!(
            "🛑 Stoploss Hit: {} {} stop {} fills at {}",
            position.side, self.symbol, stop, exit
        );
        self.close_position(ctx, exit, "Stoploss Hit").await?;
        Ok(true)
    }

    /// Local stop intent is applied first so the tick-level hit test works
    /// even if the exchange amendment fails; an order rejection gets one
    /// retry at a price pushed further from the market.
    async fn set_stop(&mut self, stop: Money, why: &str) -> Result<()> {
        self.state.current_stoploss = Some(stop);

        match self.gateway.change_stop(&self.symbol, stop).await {
            Ok(()) => {
                info!("🔧 stop set to {} ({})", stop, why);
                Ok(())
            }
            Err(ExchangeError::OrderRejected { reason }) => {
                let Some(position) = self.state.position.clone() else {
                    return Ok(());
                };
                let buffer = trailing::pct(self.strategy.stop_buffer_pct);
                let retry = match position.side {
                    Side::Long => stop.with_pct_offset(-buffer),
                    Side::Short => stop.with_pct_offset(buffer),
                };
                warn!(
                    "⚠️ stop {} rejected ({}); resubmitting at {}",
                    stop, reason, retry
                );
                self.gateway
                    .change_stop(&self.symbol, retry)
                    .await
                    .context("stop resubmission failed")?;
                self.state.current_stoploss = Some(retry);
                info!("🔧 stop set to {} ({}, resubmitted)", retry, why);
                Ok(())
            }
            Err(e) => Err(e).context("stop amendment failed"),
        }
    }

    // ==================== TAKE PROFITS ====================

    /// Walk the ladder low rung to high. Returns true when the position
    /// fully closed.
    async fn take_profits(&mut self, ctx: &TickContext<'_>, atr_long: f64) -> Result<bool> {
        let ladder = self.strategy.take_profits.clone();
        let last_index = ladder.len().saturating_sub(1);

        for (i, level) in ladder.iter().enumerate() {
            let Some(position) = self.state.position.clone() else {
                return Ok(true);
            };
            if position.level_hit(&level.id) {
                continue;
            }

            let tp = tp_price(
                position.side,
                position.entry_price,
                atr_long,
                level,
                self.strategy.tp_threshold,
            );
            if let Some(p) = self.state.position.as_mut() {
                p.tp_orders.insert(level.id.clone(), tp);
            }

            let touched = match position.side {
                Side::Long => ctx.tick_high >= tp,
                Side::Short => ctx.tick_low <= tp,
            };
            if !touched {
                continue;
            }

            if i == last_index || matches!(level.size, TpSize::Max) {
                info!(
                    "💰 Take Profit {} at {}: closing the remaining {}",
                    level.id, tp, position.size
                );
                self.close_position(ctx, tp, "Take Profit").await?;
                return Ok(true);
            }

            let TpSize::Portion(portion) = level.size else {
                continue;
            };
            let qty = position.size * Money::from_f64(portion);
            if !qty.is_positive() {
                continue;
            }

            info!(
                "💰 Take Profit {} at {}: closing {} of {}",
                level.id, tp, qty, position.size
            );
            self.close_portion(ctx, qty, tp, &format!("Take Profit ({})", level.id))
                .await?;

            if let Some(p) = self.state.position.as_mut() {
                p.tp_levels_hit.insert(level.id.clone(), true);
            }

            if level.move_stop {
                let buffer = trailing::pct(self.strategy.breakeven_buffer_pct);
                let breakeven = match position.side {
                    Side::Long => position.entry_price.with_pct_offset(buffer),
                    Side::Short => position.entry_price.with_pct_offset(-buffer),
                };
                if let Some(stop) =
                    trailing::tightened(self.state.current_stoploss, breakeven, position.side)
                {
                    self.set_stop(stop, "breakeven after take-profit").await?;
                }
            }
        }

        Ok(self.state.position.is_none())
    }

    // ==================== SWAP ====================

    /// Armed focus broken against the position: close it, flip the side with
    /// one double-quantity order, and re-stop from the break.
    async fn focus_break_swap(&mut self, ctx: &TickContext<'_>) -> Result<bool> {
        let Some(position) = self.state.position.clone() else {
            return Ok(false);
        };
        let Some(focus) = self.state.last_focus_price else {
            return Ok(false);
        };
        if self.state.last_candle_cross.is_none() {
            return Ok(false);
        }

        let broken = match position.side {
            Side::Long => ctx.tick_low <= focus,
            Side::Short => ctx.tick_high >= focus,
        };
        if !broken {
            return Ok(false);
        }

        let new_side = position.side.opposite();
        let base = match position.side {
            Side::Long => focus.min(ctx.price),
            Side::Short => focus.max(ctx.price),
        };
        let fill = self.slipped_close(base, position.side);

        info!(
            "🔄 focus price {} broken: swapping {} -> {} at {}",
            focus, position.side, new_side, fill
        );
        self.state.is_swapping = true;

        self.gateway
            .swap_side(&self.symbol)
            .await
            .context("swap order failed")?;
        let pnl = self.record_close(
            ctx.now,
            &position,
            position.size,
            fill,
            "Swap (focus price break)",
        )?;

        let focus_stop = self.state.last_focus_stopprice.unwrap_or(fill);
        let tick_extreme = match new_side {
            Side::Long => ctx.tick_low,
            Side::Short => ctx.tick_high,
        };
        let stop = trailing::focus_break_stop(
            focus_stop,
            tick_extreme,
            new_side,
            self.strategy.stop_buffer_pct,
        );

        let entry_candle = self
            .state
            .last_candle_cross
            .as_ref()
            .map(|s| s.candle.clone());
        self.recorder.record_trade(TradeRecord::open(
            ctx.now,
            self.symbol.clone(),
            new_side,
            fill,
            position.size,
            "Swap entry",
        ))?;

        self.state.position = Some(Position::new(
            new_side,
            position.size,
            fill,
            ctx.now,
            position.leverage,
        ));
        self.state.is_in_position = true;
        self.state.entry_candle = entry_candle;
        self.state.clear_swap_transients();

        self.set_stop(stop, "swap protective stop").await?;
        info!(
            "🔄 swapped to {} {} @ {} | closed leg PnL {}",
            new_side, position.size, fill, pnl
        );
        Ok(true)
    }

    /// One candle after the opposite cross, compute the focus levels from
    /// the signal candle and the just-closed candle.
    fn advance_wait_candle(&mut self, ctx: &TickContext<'_>) {
        if !self.state.is_wait_candle {
            return;
        }
        let Some(cross) = self.state.last_candle_cross.clone() else {
            self.state.is_wait_candle = false;
            return;
        };
        let Some(last) = ctx.closed_candles.last() else {
            return;
        };
        if last.datetime <= cross.candle.datetime {
            // the signal candle is still the newest close
            return;
        }

        let signal = &cross.candle;
        let (focus, focus_stop) = match cross.kind.side() {
            // reversal downward: watch the lower boundary, stop above
            Side::Short => (signal.low.min(last.low), signal.high.max(last.high)),
            // reversal upward: watch the upper boundary, stop below
            Side::Long => (signal.high.max(last.high), signal.low.min(last.low)),
        };

        self.state.last_focus_price = Some(Money::from_f64(focus));
        self.state.last_focus_stopprice = Some(Money::from_f64(focus_stop));
        self.state.is_wait_candle = false;
        info!("🎯 focus armed at {} (stop {})", focus, focus_stop);
    }

    /// An opposite cross while in position stages the swap consideration;
    /// a cross re-confirming the open side cancels one already staged.
    fn arm_wait_candle(&mut self, detection: &Detection) {
        let Some(position) = self.state.position.clone() else {
            return;
        };
        let Some(signal) = detection.signal() else {
            return;
        };

        if signal.kind.side() == position.side {
            if self.state.last_candle_cross.is_some() {
                info!(
                    "🎯 {} cross re-confirms the open side; disarming swap watch",
                    position.side
                );
                self.state.clear_swap_transients();
            }
            return;
        }

        // one arming per signal candle
        if let Some(existing) = &self.state.last_candle_cross {
            if existing.candle.datetime >= signal.candle.datetime {
                return;
            }
        }

        info!(
            "⏳ opposite {:?} cross while {}; waiting one candle before arming the focus",
            signal.kind, position.side
        );
        self.state.last_candle_cross = Some(signal.clone());
        self.state.is_wait_candle = true;
        self.state.last_focus_price = None;
        self.state.last_focus_stopprice = None;
    }

    // ==================== ENTRY ====================

    /// A fresh cross stages (or replaces) a pending entry while flat.
    fn stage_entry(&mut self, signal: &Signal) {
        if let Some(existing) = &self.state.last_candle_cross {
            if existing.candle.datetime >= signal.candle.datetime {
                return;
            }
        }

        let side = signal.kind.side();
        let buffer = trailing::pct(self.strategy.stop_buffer_pct);
        let trigger_offset = trailing::pct(self.strategy.entry_trigger_pct);

        let (trigger, stop) = match side {
            Side::Long => (
                Money::from_f64(signal.candle.high).with_pct_offset(trigger_offset),
                Money::from_f64(signal.candle.low).with_pct_offset(-buffer),
            ),
            Side::Short => (
                Money::from_f64(signal.candle.low).with_pct_offset(-trigger_offset),
                Money::from_f64(signal.candle.high).with_pct_offset(buffer),
            ),
        };

        info!(
            "📋 staged pending {} entry: trigger {} stop {} (rsi {:.1}, period {})",
            side, trigger, stop, signal.rsi, signal.rsi_period
        );
        self.state.pending_entry = Some(PendingEntry {
            side,
            trigger_price: trigger,
            stoploss_price: stop,
            signal_time: signal.candle.datetime,
        });
        self.state.last_candle_cross = Some(signal.clone());
        self.state.entry_candle = Some(signal.candle.clone());
    }

    /// Activate the pending entry once price trades through its trigger, or
    /// cancel it when the stop side is breached first. A tick that touches
    /// both boundaries counts as a failed confirmation, not an entry.
    async fn drive_pending_entry(&mut self, ctx: &TickContext<'_>) -> Result<()> {
        let Some(pending) = self.state.pending_entry.clone() else {
            return Ok(());
        };

        let cancelled = match pending.side {
            Side::Long => ctx.tick_low <= pending.stoploss_price,
            Side::Short => ctx.tick_high >= pending.stoploss_price,
        };
        if cancelled {
            info!(
                "⏹️ pending {} entry cancelled: price reached the stop side first",
                pending.side
            );
            self.state.pending_entry = None;
            return Ok(());
        }

        let triggered = match pending.side {
            Side::Long => ctx.tick_high >= pending.trigger_price,
            Side::Short => ctx.tick_low <= pending.trigger_price,
        };
        if !triggered {
            return Ok(());
        }

        self.open_position(ctx, &pending).await
    }

    async fn open_position(&mut self, ctx: &TickContext<'_>, pending: &PendingEntry) -> Result<()> {
        let balance = self
            .gateway
            .fetch_balance()
            .await
            .context("balance fetch before entry failed")?;

        // a breakout market order fills at the worse of trigger and market
        let base = match pending.side {
            Side::Long => pending.trigger_price.max(ctx.price),
            Side::Short => pending.trigger_price.min(ctx.price),
        };
        let entry = self.slipped_open(base, pending.side);
        let size = sizing::entry_size(&self.strategy, balance.available, entry, pending.stoploss_price);

        if !size.is_positive() || !entry.is_positive() {
            warn!(
                "cannot size {} entry (entry {}, available {}); dropping the pending order",
                pending.side, entry, balance.available
            );
            self.state.pending_entry = None;
            return Ok(());
        }

        let order = OrderRequest::market(self.symbol.clone(), OrderSide::to_open(pending.side), size)
            .with_price_hint(entry);
        self.gateway
            .create_order(&order)
            .await
            .context("entry order failed")?;

        let reason = match pending.side {
            Side::Long => "RSI crossover",
            Side::Short => "RSI crossunder",
        };
        self.recorder.record_trade(TradeRecord::open(
            ctx.now,
            self.symbol.clone(),
            pending.side,
            entry,
            size,
            reason,
        ))?;

        self.state.position = Some(Position::new(
            pending.side,
            size,
            entry,
            ctx.now,
            self.strategy.leverage,
        ));
        self.state.is_in_position = true;
        self.state.pending_entry = None;

        self.set_stop(pending.stoploss_price, "entry protective stop").await?;
        info!(
            "📈 Opened {} {} {} @ {} (stop {})",
            pending.side, size, self.symbol, entry, pending.stoploss_price
        );
        Ok(())
    }

    // ==================== CLOSE PATHS ====================

    async fn close_position(&mut self, ctx: &TickContext<'_>, exit: Money, reason: &str) -> Result<()> {
        let Some(position) = self.state.position.clone() else {
            return Ok(());
        };

        self.gateway
            .cancel_all_orders(&self.symbol)
            .await
            .context("cancel-all before close failed")?;
        let order =
            OrderRequest::market(self.symbol.clone(), OrderSide::to_close(position.side), position.size)
                .with_price_hint(exit)
                .reduce_only();
        self.gateway
            .create_order(&order)
            .await
            .context("close order failed")?;

        let pnl = self.record_close(ctx.now, &position, position.size, exit, reason)?;
        self.state.reset_position();

        let marker = if pnl.is_negative() { "📉" } else { "📈" };
        info!(
            "{} Closed {} {} @ {} | PnL {} ({})",
            marker, position.side, self.symbol, exit, pnl, reason
        );
        Ok(())
    }

    async fn close_portion(
        &mut self,
        ctx: &TickContext<'_>,
        qty: Money,
        exit: Money,
        reason: &str,
    ) -> Result<()> {
        let Some(position) = self.state.position.clone() else {
            return Ok(());
        };
        let qty = qty.min(position.size);

        let order = OrderRequest::market(self.symbol.clone(), OrderSide::to_close(position.side), qty)
            .with_price_hint(exit)
            .reduce_only();
        self.gateway
            .create_order(&order)
            .await
            .context("partial close order failed")?;

        self.record_close(ctx.now, &position, qty, exit, reason)?;

        let mut fully_closed = false;
        if let Some(p) = self.state.position.as_mut() {
            p.size = p.size - qty;
            fully_closed = !p.size.is_positive();
        }
        if fully_closed {
            self.state.reset_position();
        }
        Ok(())
    }

    /// Append the exit-side ledger row; returns the net PnL.
    fn record_close(
        &mut self,
        now: DateTime<Utc>,
        position: &Position,
        qty: Money,
        exit: Money,
        reason: &str,
    ) -> Result<Money> {
        let fee = self.round_trip_fee(position.entry_price, exit, qty);
        let record = TradeRecord::close(
            now,
            self.symbol.clone(),
            position.side,
            position.entry_price,
            exit,
            qty,
            fee,
            reason,
        );
        let pnl = record.profit_loss.unwrap_or(Money::ZERO);
        self.recorder
            .record_trade(record)
            .context("failed to record close")?;
        Ok(pnl)
    }

    // ==================== PRICING ====================

    fn slipped_close(&self, price: Money, side: Side) -> Money {
        let offset = price * self.fees.slippage;
        match side {
            Side::Long => price - offset,
            Side::Short => price + offset,
        }
    }

    fn slipped_open(&self, price: Money, side: Side) -> Money {
        let offset = price * self.fees.slippage;
        match side {
            Side::Long => price + offset,
            Side::Short => price - offset,
        }
    }

    fn round_trip_fee(&self, entry: Money, exit: Money, qty: Money) -> Money {
        qty * entry * self.fees.taker_fee + qty * exit * self.fees.taker_fee
    }
}

/// Ladder trigger: the ATR multiple plus a small threshold bias widening the
/// target in the favorable direction.
fn tp_price(
    side: Side,
    entry: Money,
    atr_long: f64,
    level: &TakeProfitLevel,
    threshold: f64,
) -> Money {
    let distance = atr_long * level.target_atr + threshold * level.target_atr * 2.0;
    match side {
        Side::Long => entry + Money::from_f64(distance),
        Side::Short => entry - Money::from_f64(distance),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::AccountSim;
    use crate::exchange::{AccountBalance, OrderAck, PositionInfo};
    use crate::signal::CrossKind;
    use crate::types::TradeAction;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Gateway double: orders run through an `AccountSim` so position and
    /// balance answers stay consistent across ticks, and every request is
    /// recorded for assertions.
    struct MockGateway {
        account: Mutex<AccountSim>,
        mark: Mutex<Money>,
        orders: Mutex<Vec<OrderRequest>>,
        stops: Mutex<Vec<Money>>,
        reject_next_stop: Mutex<bool>,
        swap_calls: Mutex<u32>,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                account: Mutex::new(AccountSim::new(Money::from_f64(10_000.0), Money::ZERO, 10)),
                mark: Mutex::new(Money::from_f64(100.0)),
                orders: Mutex::new(Vec::new()),
                stops: Mutex::new(Vec::new()),
                reject_next_stop: Mutex::new(false),
                swap_calls: Mutex::new(0),
            }
        }

        fn set_mark(&self, price: f64) {
            *self.mark.lock().unwrap() = Money::from_f64(price);
        }

        fn open_directly(&self, side: OrderSide, qty: f64, price: f64) {
            let request = OrderRequest::market(Symbol::new("BTCUSDT"), side, Money::from_f64(qty));
            self.account
                .lock()
                .unwrap()
                .fill_order(&request, Money::from_f64(price))
                .unwrap();
        }

        fn orders(&self) -> Vec<OrderRequest> {
            self.orders.lock().unwrap().clone()
        }

        fn stops(&self) -> Vec<Money> {
            self.stops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn fetch_price(&self, _symbol: &Symbol) -> Result<Money, ExchangeError> {
            Ok(*self.mark.lock().unwrap())
        }

        async fn fetch_ohlcv(
            &self,
            _symbol: &Symbol,
            _timeframe: &str,
            _since: Option<DateTime<Utc>>,
            _limit: usize,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn fetch_position(
            &self,
            symbol: &Symbol,
        ) -> Result<Option<PositionInfo>, ExchangeError> {
            let mark = *self.mark.lock().unwrap();
            Ok(self.account.lock().unwrap().position_info(symbol, mark))
        }

        async fn fetch_balance(&self) -> Result<AccountBalance, ExchangeError> {
            let mark = *self.mark.lock().unwrap();
            Ok(self.account.lock().unwrap().balance(mark))
        }

        async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
            self.orders.lock().unwrap().push(request.clone());
            let fill = request.price.unwrap_or(*self.mark.lock().unwrap());
            self.account.lock().unwrap().fill_order(request, fill)
        }

        async fn cancel_all_orders(&self, _symbol: &Symbol) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn change_stop(&self, _symbol: &Symbol, stop: Money) -> Result<(), ExchangeError> {
            let mut reject = self.reject_next_stop.lock().unwrap();
            if *reject {
                *reject = false;
                return Err(ExchangeError::OrderRejected {
                    reason: "stop would trigger immediately".to_string(),
                });
            }
            self.stops.lock().unwrap().push(stop);
            Ok(())
        }

        async fn swap_side(&self, symbol: &Symbol) -> Result<OrderAck, ExchangeError> {
            *self.swap_calls.lock().unwrap() += 1;
            let mark = *self.mark.lock().unwrap();
            self.account.lock().unwrap().flip(symbol, mark)
        }

        async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
            Ok(Utc::now())
        }
    }

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new_unchecked(
            Utc.timestamp_millis_opt(i * 60_000).single().unwrap(),
            open,
            high,
            low,
            close,
            1000.0,
        )
    }

    /// Constant-range candles around 100 (ATR settles at exactly 2.0)
    fn flat_candles(n: i64) -> Vec<Candle> {
        (0..n).map(|i| candle(i, 100.0, 101.0, 99.0, 100.0)).collect()
    }

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    fn make_controller(state: SessionState) -> (PositionController<MockGateway>, Arc<MockGateway>) {
        let gateway = Arc::new(MockGateway::new());
        let exchange = ExchangeSettings {
            taker_fee: 0.0,
            assumed_slippage: 0.0,
            ..Default::default()
        };
        let controller = PositionController::new(
            Symbol::new("BTCUSDT"),
            StrategyConfig::default(),
            &exchange,
            Arc::clone(&gateway),
            TradeRecorder::in_memory(),
            SessionState { strategy_hash: "test".to_string(), ..state },
        );
        (controller, gateway)
    }

    fn ctx<'a>(
        candles: &'a [Candle],
        price: f64,
        low: f64,
        high: f64,
        now_ms: i64,
    ) -> TickContext<'a> {
        TickContext {
            closed_candles: candles,
            price: Money::from_f64(price),
            tick_low: Money::from_f64(low),
            tick_high: Money::from_f64(high),
            now: ts(now_ms),
        }
    }

    fn pending_long() -> PendingEntry {
        PendingEntry {
            side: Side::Long,
            trigger_price: Money::from_f64(101.0),
            stoploss_price: Money::from_f64(98.0),
            signal_time: ts(0),
        }
    }

    fn long_position(size: f64, entry: f64, entry_ms: i64) -> Position {
        Position::new(
            Side::Long,
            Money::from_f64(size),
            Money::from_f64(entry),
            ts(entry_ms),
            10,
        )
    }

    fn signal_at(candle: Candle, kind: CrossKind) -> Signal {
        Signal {
            kind,
            candle,
            rsi: 60.0,
            prev_rsi: 70.0,
            rsi_period: 14,
        }
    }

    #[tokio::test]
    async fn test_pending_entry_waits_for_trigger() {
        let state = SessionState {
            pending_entry: Some(pending_long()),
            ..Default::default()
        };
        let (mut controller, gateway) = make_controller(state);
        let candles = flat_candles(5);

        controller
            .tick(&ctx(&candles, 100.0, 100.0, 100.0, 360_000))
            .await
            .unwrap();

        assert!(controller.session().pending_entry.is_some());
        assert!(!controller.session().is_in_position);
        assert!(gateway.orders().is_empty());
    }

    #[tokio::test]
    async fn test_pending_entry_activates_on_trigger() {
        let state = SessionState {
            pending_entry: Some(pending_long()),
            ..Default::default()
        };
        let (mut controller, gateway) = make_controller(state);
        let candles = flat_candles(5);

        controller
            .tick(&ctx(&candles, 101.5, 101.5, 101.5, 360_000))
            .await
            .unwrap();

        let session = controller.session();
        assert!(session.is_in_position);
        assert!(session.pending_entry.is_none());
        let position = session.position.as_ref().unwrap();
        assert_eq!(position.side, Side::Long);
        // fills at the worse of trigger and market
        assert_eq!(position.entry_price, Money::from_f64(101.5));
        assert_eq!(session.current_stoploss, Some(Money::from_f64(98.0)));
        assert_eq!(gateway.stops(), vec![Money::from_f64(98.0)]);

        let orders = gateway.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert!(!orders[0].reduce_only);

        // open leg recorded
        assert_eq!(controller.recorder().trades().len(), 1);
        assert_eq!(controller.recorder().trades()[0].action, TradeAction::OpenLong);
    }

    #[tokio::test]
    async fn test_pending_entry_cancelled_on_stop_side_breach() {
        let state = SessionState {
            pending_entry: Some(pending_long()),
            ..Default::default()
        };
        let (mut controller, gateway) = make_controller(state);
        let candles = flat_candles(5);

        // touches both boundaries; the stop side wins
        controller
            .tick(&ctx(&candles, 100.0, 97.5, 102.0, 360_000))
            .await
            .unwrap();

        assert!(controller.session().pending_entry.is_none());
        assert!(!controller.session().is_in_position);
        assert!(gateway.orders().is_empty());
        assert!(controller.recorder().trades().is_empty());
    }

    #[tokio::test]
    async fn test_stop_hit_closes_with_one_record_and_resets() {
        let state = SessionState {
            is_in_position: true,
            position: Some(long_position(1.0, 100.0, 300_000)),
            current_stoploss: Some(Money::from_f64(98.0)),
            ..Default::default()
        };
        let (mut controller, gateway) = make_controller(state);
        gateway.open_directly(OrderSide::Buy, 1.0, 100.0);
        let candles = flat_candles(5);

        controller
            .tick(&ctx(&candles, 97.5, 97.5, 100.0, 360_000))
            .await
            .unwrap();

        let session = controller.session();
        assert!(!session.is_in_position);
        assert!(session.position.is_none());
        assert!(session.current_stoploss.is_none());

        let closes: Vec<_> = controller.recorder().closed_trades().collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].reason, "Stoploss Hit");
        // fills at the worse of stop and market
        assert_eq!(closes[0].exit_price, Some(Money::from_f64(97.5)));
        assert_eq!(closes[0].profit_loss, Some(Money::from_f64(-2.5)));

        let orders = gateway.orders();
        assert_eq!(orders.len(), 1);
        assert!(orders[0].reduce_only);
        assert_eq!(orders[0].side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn test_take_profit_ladder_partial_then_breakeven_then_max() {
        let state = SessionState {
            is_in_position: true,
            position: Some(long_position(2.0, 100.0, 0)),
            current_stoploss: Some(Money::from_f64(98.0)),
            ..Default::default()
        };
        let (mut controller, gateway) = make_controller(state);
        gateway.open_directly(OrderSide::Buy, 2.0, 100.0);
        // enough history for ATR to be defined and exactly 2.0
        let candles = flat_candles(40);

        // tp1 = 100 + (2*1 + 0.05*1*2) = 102.1
        controller
            .tick(&ctx(&candles, 102.0, 101.8, 102.2, 40 * 60_000))
            .await
            .unwrap();

        {
            let session = controller.session();
            let position = session.position.as_ref().unwrap();
            assert!(position.level_hit("tp1"));
            assert_eq!(position.size, Money::from_f64(1.0));
            assert_eq!(
                position.tp_orders.get("tp1"),
                Some(&Money::from_f64(102.1))
            );
            // stop moved to breakeven: 100 * 1.0005
            assert_eq!(session.current_stoploss, Some(Money::from_f64(100.05)));
        }
        let closes: Vec<String> = controller
            .recorder()
            .closed_trades()
            .map(|t| t.reason.clone())
            .collect();
        assert_eq!(closes, vec!["Take Profit (tp1)".to_string()]);

        // tp2 = 100 + (2*2 + 0.05*2*2) = 104.2 closes the rest
        controller
            .tick(&ctx(&candles, 104.0, 103.0, 104.3, 41 * 60_000))
            .await
            .unwrap();

        assert!(!controller.session().is_in_position);
        let reasons: Vec<String> = controller
            .recorder()
            .closed_trades()
            .map(|t| t.reason.clone())
            .collect();
        assert_eq!(
            reasons,
            vec!["Take Profit (tp1)".to_string(), "Take Profit".to_string()]
        );
    }

    #[tokio::test]
    async fn test_wait_candle_computes_focus_on_next_close() {
        let signal_candle = candle(4, 100.0, 102.0, 97.0, 100.0);
        let state = SessionState {
            is_in_position: true,
            position: Some(long_position(1.0, 100.0, 0)),
            is_wait_candle: true,
            last_candle_cross: Some(signal_at(signal_candle, CrossKind::Crossunder)),
            ..Default::default()
        };
        let (mut controller, gateway) = make_controller(state);
        gateway.open_directly(OrderSide::Buy, 1.0, 100.0);

        // same candle still the newest close: nothing computed yet
        let mut candles = flat_candles(4);
        candles.push(candle(4, 100.0, 102.0, 97.0, 100.0));
        controller
            .tick(&ctx(&candles, 100.0, 99.5, 100.5, 5 * 60_000))
            .await
            .unwrap();
        assert!(controller.session().is_wait_candle);
        assert!(controller.session().last_focus_price.is_none());

        // next candle closes: focus = min of lows, stop = max of highs
        candles.push(candle(5, 100.0, 101.5, 98.0, 100.5));
        controller
            .tick(&ctx(&candles, 100.5, 100.0, 101.0, 6 * 60_000))
            .await
            .unwrap();

        let session = controller.session();
        assert!(!session.is_wait_candle);
        assert_eq!(session.last_focus_price, Some(Money::from_f64(97.0)));
        assert_eq!(session.last_focus_stopprice, Some(Money::from_f64(102.0)));
        assert!(session.is_in_position);
    }

    #[tokio::test]
    async fn test_focus_break_swaps_side() {
        let signal_candle = candle(4, 100.0, 102.0, 97.0, 100.0);
        let state = SessionState {
            is_in_position: true,
            position: Some(long_position(1.0, 100.0, 0)),
            last_candle_cross: Some(signal_at(signal_candle, CrossKind::Crossunder)),
            last_focus_price: Some(Money::from_f64(98.5)),
            last_focus_stopprice: Some(Money::from_f64(103.0)),
            ..Default::default()
        };
        let (mut controller, gateway) = make_controller(state);
        gateway.open_directly(OrderSide::Buy, 1.0, 100.0);
        gateway.set_mark(98.2);
        let candles = flat_candles(7);

        controller
            .tick(&ctx(&candles, 98.2, 98.0, 98.6, 7 * 60_000))
            .await
            .unwrap();

        let session = controller.session();
        assert!(session.is_in_position);
        assert!(!session.is_swapping);
        let position = session.position.as_ref().unwrap();
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.size, Money::from_f64(1.0));
        // close fills at the worse of focus and market
        assert_eq!(position.entry_price, Money::from_f64(98.2));
        // stop: max(focus stop 103, tick high 98.6) * 1.001
        assert_eq!(session.current_stoploss, Some(Money::from_f64(103.103)));
        assert!(session.last_focus_price.is_none());
        assert!(session.last_candle_cross.is_none());

        assert_eq!(*gateway.swap_calls.lock().unwrap(), 1);
        let actions: Vec<TradeAction> = controller
            .recorder()
            .trades()
            .iter()
            .map(|t| t.action)
            .collect();
        assert_eq!(actions, vec![TradeAction::CloseLong, TradeAction::OpenShort]);
        let close = &controller.recorder().trades()[0];
        assert_eq!(close.reason, "Swap (focus price break)");
        assert_eq!(close.profit_loss, Some(Money::from_f64(-1.8)));

        // exchange side flipped too, so the next tick reconciles cleanly
        let remote = gateway
            .fetch_position(&Symbol::new("BTCUSDT"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remote.side, Side::Short);
    }

    #[tokio::test]
    async fn test_margin_call_fires_only_when_enabled() {
        let base_state = SessionState {
            is_in_position: true,
            position: Some(long_position(1.0, 100.0, 0)),
            ..Default::default()
        };
        let candles = flat_candles(5);

        // disabled (live behavior): a deep drawdown does not force-close
        let (mut live, live_gateway) = make_controller(base_state.clone());
        live_gateway.open_directly(OrderSide::Buy, 1.0, 100.0);
        live.tick(&ctx(&candles, 91.0, 91.0, 91.0, 360_000))
            .await
            .unwrap();
        assert!(live.session().is_in_position);

        // enabled (backtest behavior): margin 10, upnl -9 -> ratio 0.1
        let (backtest, bt_gateway) = make_controller(base_state);
        bt_gateway.open_directly(OrderSide::Buy, 1.0, 100.0);
        let mut backtest = backtest.with_margin_check(true);
        backtest
            .tick(&ctx(&candles, 91.0, 91.0, 91.0, 360_000))
            .await
            .unwrap();

        assert!(!backtest.session().is_in_position);
        let closes: Vec<_> = backtest.recorder().closed_trades().collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].reason, "Margin Call");
    }

    #[tokio::test]
    async fn test_reconcile_closes_local_when_exchange_flat() {
        let state = SessionState {
            is_in_position: true,
            position: Some(long_position(1.0, 100.0, 0)),
            current_stoploss: Some(Money::from_f64(98.0)),
            ..Default::default()
        };
        // exchange account left empty on purpose
        let (mut controller, gateway) = make_controller(state);
        let candles = flat_candles(5);

        controller
            .tick(&ctx(&candles, 99.0, 99.0, 99.0, 360_000))
            .await
            .unwrap();

        let session = controller.session();
        assert!(!session.is_in_position);
        assert!(session.position.is_none());

        let closes: Vec<_> = controller.recorder().closed_trades().collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].reason, "Reconciled (exchange flat)");
        // exit estimated at the stop, the most plausible fill
        assert_eq!(closes[0].exit_price, Some(Money::from_f64(98.0)));
        // no orders were sent for a position the exchange no longer holds
        assert!(gateway.orders().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_stop_resubmits_once_further_out() {
        let state = SessionState {
            pending_entry: Some(pending_long()),
            ..Default::default()
        };
        let (mut controller, gateway) = make_controller(state);
        *gateway.reject_next_stop.lock().unwrap() = true;
        let candles = flat_candles(5);

        controller
            .tick(&ctx(&candles, 101.5, 101.5, 101.5, 360_000))
            .await
            .unwrap();

        // retry lands 0.1% below the rejected long stop
        assert_eq!(gateway.stops(), vec![Money::from_f64(97.902)]);
        assert_eq!(
            controller.session().current_stoploss,
            Some(Money::from_f64(97.902))
        );
        assert!(controller.session().is_in_position);
    }

    #[tokio::test]
    async fn test_trailing_tightens_from_rising_lows() {
        let state = SessionState {
            is_in_position: true,
            position: Some(long_position(1.0, 100.0, 0)),
            current_stoploss: Some(Money::from_f64(95.0)),
            ..Default::default()
        };
        let (mut controller, gateway) = make_controller(state);
        gateway.open_directly(OrderSide::Buy, 1.0, 100.0);

        // entry at t=0, three candles with strictly rising lows after it
        let candles = vec![
            candle(0, 100.0, 101.0, 96.0, 100.0),
            candle(1, 100.0, 102.0, 97.0, 101.0),
            candle(2, 101.0, 103.0, 98.0, 102.0),
            candle(3, 102.0, 104.0, 99.0, 103.0),
        ];

        controller
            .tick(&ctx(&candles, 103.0, 102.5, 103.5, 4 * 60_000))
            .await
            .unwrap();

        // oldest low of the last three (97) beats the 95 stop
        assert_eq!(
            controller.session().current_stoploss,
            Some(Money::from_f64(97.0))
        );
        assert!(controller.session().is_in_position);
    }

    #[tokio::test]
    async fn test_equity_snapshot_records_balance_and_price() {
        let (mut controller, _gateway) = make_controller(SessionState::default());
        let candles = flat_candles(5);

        controller
            .record_equity_snapshot(&ctx(&candles, 100.0, 100.0, 100.0, 360_000))
            .await
            .unwrap();

        let equity = controller.recorder().equity();
        assert_eq!(equity.len(), 1);
        assert_eq!(equity[0].balance, Money::from_f64(10_000.0));
        assert_eq!(equity[0].equity, Money::from_f64(10_000.0));
        assert_eq!(equity[0].price, Money::from_f64(100.0));
    }

    #[test]
    fn test_tp_price_bias_widens_target() {
        let level = TakeProfitLevel {
            id: "tp1".to_string(),
            size: TpSize::Portion(0.5),
            target_atr: 1.0,
            move_stop: true,
        };
        // entry 100, atr 2: raw target 102, bias pushes it to 102.1
        let long = tp_price(Side::Long, Money::from_f64(100.0), 2.0, &level, 0.05);
        assert_eq!(long, Money::from_f64(102.1));

        let short = tp_price(Side::Short, Money::from_f64(100.0), 2.0, &level, 0.05);
        assert_eq!(short, Money::from_f64(97.9));
    }
}
