//! Volatility-adaptive RSI and the ATR machinery behind it
//!
//! The RSI period is not fixed: it is interpolated between a configured
//! min/max from the percentage spread between a short and a long ATR, so the
//! oscillator slows down when volatility expands and speeds up when it
//! contracts. `IndicatorEngine` computes one frame per candle.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::Candle;

/// Parameters for the adaptive-period RSI stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RsiSettings {
    /// Shortest RSI period the interpolation can select
    pub period_min: usize,
    /// Longest RSI period the interpolation can select
    pub period_max: usize,
    /// Short ATR length feeding the volatility spread
    pub atr_length_short: usize,
    /// Long ATR length feeding the volatility spread and the TP ladder
    pub atr_length_long: usize,
    /// ATR spread (%) at or below which the period pins to `period_min`
    pub spread_min_pct: f64,
    /// ATR spread (%) at or above which the period pins to `period_max`
    pub spread_max_pct: f64,
    /// When false, `period_min` is used for every row
    pub dynamic_period: bool,
    /// How period changes interact with the smoothing recurrence
    pub period_policy: PeriodPolicy,
}

impl Default for RsiSettings {
    fn default() -> Self {
        Self {
            period_min: 14,
            period_max: 28,
            atr_length_short: 5,
            atr_length_long: 14,
            spread_min_pct: -10.0,
            spread_max_pct: 50.0,
            dynamic_period: true,
            period_policy: PeriodPolicy::default(),
        }
    }
}

/// How a changing period interacts with the Wilder recurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeriodPolicy {
    /// Period recomputed every row; the recurrence carries its running
    /// averages across period changes.
    #[default]
    PerRow,
    /// One clean constant-period recurrence per row, using the period
    /// selected at that row.
    Pinned,
}

/// Per-candle derived values consumed by the signal and position logic
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorFrame {
    pub atr_short: Option<f64>,
    pub atr_long: Option<f64>,
    pub rsi_period: usize,
    pub rsi: Option<f64>,
}

/// Calculate True Range per candle
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(candles.len());

    for i in 0..candles.len() {
        let c = &candles[i];
        let value = if i == 0 {
            c.high - c.low
        } else {
            let prev_close = candles[i - 1].close;
            let hl = c.high - c.low;
            let hc = (c.high - prev_close).abs();
            let lc = (c.low - prev_close).abs();
            hl.max(hc).max(lc)
        };
        tr.push(value);
    }

    tr
}

/// Wilder's smoothed moving average (RMA, alpha = 1/length)
///
/// Seeded with the simple average of the first `length` values, then
/// `rma = (rma_prev * (length - 1) + value) / length`.
pub fn wilder_rma(values: &[f64], length: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || length == 0 {
        return result;
    }

    let mut rma: Option<f64> = None;

    for (i, &value) in values.iter().enumerate() {
        if i + 1 < length {
            result.push(None);
        } else if i + 1 == length {
            let seed: f64 = values[..length].iter().sum::<f64>() / length as f64;
            rma = Some(seed);
            result.push(rma);
        } else if let Some(prev) = rma {
            let next = (prev * (length as f64 - 1.0) + value) / length as f64;
            rma = Some(next);
            result.push(Some(next));
        } else {
            result.push(None);
        }
    }

    result
}

/// Average True Range with Wilder smoothing
pub fn atr(candles: &[Candle], length: usize) -> Vec<Option<f64>> {
    wilder_rma(&true_range(candles), length)
}

/// RSI period per row, interpolated from the ATR spread
///
/// `d = (atr_short - atr_long) / atr_long * 100`. At or above
/// `spread_max_pct` the period pins to `period_max`; at or below
/// `spread_min_pct` it pins to `period_min`; in between it interpolates
/// linearly, rounded to the nearest integer. Undefined spread (ATR warmup,
/// zero long ATR) falls back to `period_min`.
pub fn dynamic_period(
    atr_short: &[Option<f64>],
    atr_long: &[Option<f64>],
    settings: &RsiSettings,
) -> Vec<usize> {
    atr_short
        .iter()
        .zip(atr_long.iter())
        .map(|(&short, &long)| interpolate_period(short, long, settings))
        .collect()
}

fn interpolate_period(atr_short: Option<f64>, atr_long: Option<f64>, s: &RsiSettings) -> usize {
    let (short, long) = match (atr_short, atr_long) {
        (Some(short), Some(long)) if long != 0.0 => (short, long),
        _ => return s.period_min,
    };

    let d = (short - long) / long * 100.0;
    if !d.is_finite() {
        return s.period_min;
    }

    if d >= s.spread_max_pct {
        s.period_max
    } else if d <= s.spread_min_pct {
        s.period_min
    } else {
        let span = s.spread_max_pct - s.spread_min_pct;
        let t = (d - s.spread_min_pct) / span;
        let period = s.period_min as f64 + (s.period_max - s.period_min) as f64 * t;
        period.round() as usize
    }
}

/// Wilder RSI with a fixed period
///
/// Average gain/loss seeded over the first `period` price changes, then the
/// Wilder recurrence. First value appears at index `period`. `rsi = 100`
/// when the average loss is zero.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = closes.len();
    let mut result = vec![None; n];

    if n < 2 || period == 0 {
        return result;
    }

    let (gains, losses) = price_changes(closes);

    let mut avg_gain: Option<f64> = None;
    let mut avg_loss = 0.0;

    for i in 1..n {
        match avg_gain {
            None => {
                if i >= period {
                    let start = i + 1 - period;
                    avg_gain = Some(gains[start..=i].iter().sum::<f64>() / period as f64);
                    avg_loss = losses[start..=i].iter().sum::<f64>() / period as f64;
                }
            }
            Some(prev_gain) => {
                let p = period as f64;
                avg_gain = Some((prev_gain * (p - 1.0) + gains[i]) / p);
                avg_loss = (avg_loss * (p - 1.0) + losses[i]) / p;
            }
        }

        if let Some(gain) = avg_gain {
            result[i] = Some(rsi_from_averages(gain, avg_loss));
        }
    }

    result
}

/// Wilder RSI with a per-row period
pub fn dynamic_rsi(closes: &[f64], periods: &[usize], policy: PeriodPolicy) -> Vec<Option<f64>> {
    debug_assert_eq!(closes.len(), periods.len());

    match policy {
        PeriodPolicy::PerRow => rsi_per_row(closes, periods),
        PeriodPolicy::Pinned => rsi_pinned(closes, periods),
    }
}

/// Single recurrence; the period in the seed and the recurrence step is
/// whatever the current row selected, and the running averages survive
/// period changes.
fn rsi_per_row(closes: &[f64], periods: &[usize]) -> Vec<Option<f64>> {
    let n = closes.len();
    let mut result = vec![None; n];

    if n < 2 {
        return result;
    }

    let (gains, losses) = price_changes(closes);

    let mut avg_gain: Option<f64> = None;
    let mut avg_loss = 0.0;

    for i in 1..n {
        let period = periods[i].max(1);

        match avg_gain {
            None => {
                if i >= period {
                    let start = i + 1 - period;
                    avg_gain = Some(gains[start..=i].iter().sum::<f64>() / period as f64);
                    avg_loss = losses[start..=i].iter().sum::<f64>() / period as f64;
                }
            }
            Some(prev_gain) => {
                let p = period as f64;
                avg_gain = Some((prev_gain * (p - 1.0) + gains[i]) / p);
                avg_loss = (avg_loss * (p - 1.0) + losses[i]) / p;
            }
        }

        if let Some(gain) = avg_gain {
            result[i] = Some(rsi_from_averages(gain, avg_loss));
        }
    }

    result
}

/// Each row reads from a clean constant-period series for the period
/// selected at that row. Distinct periods are bounded by the configured
/// min/max range, so the cache stays small.
fn rsi_pinned(closes: &[f64], periods: &[usize]) -> Vec<Option<f64>> {
    let mut by_period: HashMap<usize, Vec<Option<f64>>> = HashMap::new();
    let mut result = Vec::with_capacity(closes.len());

    for (i, &period) in periods.iter().enumerate() {
        let series = by_period
            .entry(period)
            .or_insert_with(|| rsi(closes, period));
        result.push(series.get(i).copied().flatten());
    }

    result
}

fn price_changes(closes: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let n = closes.len();
    let mut gains = vec![0.0; n];
    let mut losses = vec![0.0; n];

    for i in 1..n {
        let change = closes[i] - closes[i - 1];
        gains[i] = change.max(0.0);
        losses[i] = (-change).max(0.0);
    }

    (gains, losses)
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Computes the per-candle indicator frames the signal detector and the
/// position controller read.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    settings: RsiSettings,
}

impl IndicatorEngine {
    pub fn new(settings: RsiSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RsiSettings {
        &self.settings
    }

    /// One frame per candle, ascending time. Invariants: `rsi` in [0,100]
    /// when present, `rsi_period` within the configured bounds.
    pub fn compute(&self, candles: &[Candle]) -> Vec<IndicatorFrame> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let atr_short = atr(candles, self.settings.atr_length_short);
        let atr_long = atr(candles, self.settings.atr_length_long);

        let periods = if self.settings.dynamic_period {
            dynamic_period(&atr_short, &atr_long, &self.settings)
        } else {
            vec![self.settings.period_min; candles.len()]
        };

        let rsi_values = dynamic_rsi(&closes, &periods, self.settings.period_policy);

        (0..candles.len())
            .map(|i| IndicatorFrame {
                atr_short: atr_short[i],
                atr_long: atr_long[i],
                rsi_period: periods[i],
                rsi: rsi_values[i],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};

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

    #[test]
    fn test_true_range_with_gap() {
        let candles = vec![
            candle(0, 100.0, 105.0, 99.0, 104.0),
            // gap up: high - prev close dominates
            candle(1, 110.0, 112.0, 109.0, 111.0),
        ];
        let tr = true_range(&candles);
        assert_relative_eq!(tr[0], 6.0);
        assert_relative_eq!(tr[1], 8.0); // 112 - 104
    }

    #[test]
    fn test_wilder_rma_seed_and_recurrence() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = wilder_rma(&values, 3);

        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_relative_eq!(result[2].unwrap(), 2.0);
        assert_relative_eq!(result[3].unwrap(), (2.0 * 2.0 + 4.0) / 3.0);
        assert_relative_eq!(result[4].unwrap(), ((8.0 / 3.0) * 2.0 + 5.0) / 3.0);
    }

    #[test]
    fn test_wilder_rma_empty_and_zero_length() {
        assert!(wilder_rma(&[], 3).is_empty());
        assert!(wilder_rma(&[1.0, 2.0], 0).is_empty());
    }

    #[test]
    fn test_rsi_hand_computed() {
        // alternating +1/-1 deltas
        let closes = vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0];
        let result = rsi(&closes, 4);

        assert_eq!(result[3], None);
        assert_relative_eq!(result[4].unwrap(), 50.0);
        assert_relative_eq!(result[5].unwrap(), 62.5);
    }

    #[test]
    fn test_rsi_bounds_and_degenerate_input() {
        let closes = vec![100.0; 20];
        let result = rsi(&closes, 14);
        // all-zero deltas must still be defined
        assert_eq!(result[14], Some(100.0));

        let trending: Vec<f64> = (0..50)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        for value in rsi(&trending, 14).into_iter().flatten() {
            assert!((0.0..=100.0).contains(&value));
        }
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let result = rsi(&closes, 5);
        assert_eq!(result[9], Some(100.0));
    }

    #[test]
    fn test_dynamic_period_clamps_and_fallback() {
        let settings = RsiSettings {
            period_min: 10,
            period_max: 20,
            spread_min_pct: 0.0,
            spread_max_pct: 100.0,
            ..Default::default()
        };

        // spread = +200% -> clamp high
        assert_eq!(interpolate_period(Some(3.0), Some(1.0), &settings), 20);
        // spread = -50% -> clamp low
        assert_eq!(interpolate_period(Some(0.5), Some(1.0), &settings), 10);
        // spread = +50% -> midpoint
        assert_eq!(interpolate_period(Some(1.5), Some(1.0), &settings), 15);
        // warmup and degenerate inputs fall back to the minimum
        assert_eq!(interpolate_period(None, Some(1.0), &settings), 10);
        assert_eq!(interpolate_period(Some(1.0), None, &settings), 10);
        assert_eq!(interpolate_period(Some(1.0), Some(0.0), &settings), 10);
    }

    #[test]
    fn test_per_row_and_pinned_agree_under_constant_period() {
        let closes = vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0];
        let periods = vec![4; closes.len()];

        let per_row = dynamic_rsi(&closes, &periods, PeriodPolicy::PerRow);
        let pinned = dynamic_rsi(&closes, &periods, PeriodPolicy::Pinned);

        for (a, b) in per_row.iter().zip(pinned.iter()) {
            match (a, b) {
                (Some(x), Some(y)) => assert_relative_eq!(x, y),
                (a, b) => assert_eq!(a, b),
            }
        }
    }

    #[test]
    fn test_per_row_and_pinned_diverge_on_period_shift() {
        let closes = vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0];
        let periods = vec![2, 2, 2, 4, 4, 4];

        let per_row = dynamic_rsi(&closes, &periods, PeriodPolicy::PerRow);
        let pinned = dynamic_rsi(&closes, &periods, PeriodPolicy::Pinned);

        // per-row seeds at i=2 with period 2 and carries its averages into
        // the period-4 recurrence; pinned reads row 5 from a clean period-4
        // series.
        assert_relative_eq!(per_row[5].unwrap(), 60.15625);
        assert_relative_eq!(pinned[5].unwrap(), 62.5);
    }

    #[test]
    fn test_engine_frames_respect_bounds() {
        let mut candles = Vec::new();
        for i in 0..80 {
            let base = 100.0 + (i as f64 * 0.5).sin() * 3.0;
            // widen ranges in the back half so the ATR spread moves
            let range = if i < 40 { 1.0 } else { 4.0 };
            candles.push(candle(
                i,
                base,
                base + range,
                base - range,
                base + range * 0.3,
            ));
        }

        let settings = RsiSettings::default();
        let engine = IndicatorEngine::new(settings.clone());
        let frames = engine.compute(&candles);

        assert_eq!(frames.len(), candles.len());
        for frame in &frames {
            assert!(frame.rsi_period >= settings.period_min);
            assert!(frame.rsi_period <= settings.period_max);
            if let Some(value) = frame.rsi {
                assert!((0.0..=100.0).contains(&value));
            }
        }
        assert!(frames.last().unwrap().rsi.is_some());
        assert!(frames.last().unwrap().atr_long.is_some());
    }

    #[test]
    fn test_engine_static_mode_pins_period_min() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(i, base, base + 2.0, base - 2.0, base + 1.0)
            })
            .collect();

        let engine = IndicatorEngine::new(RsiSettings {
            dynamic_period: false,
            ..Default::default()
        });

        for frame in engine.compute(&candles) {
            assert_eq!(frame.rsi_period, 14);
        }
    }
}
