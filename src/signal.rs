//! RSI threshold-crossing detection
//!
//! Operates strictly on closed candles. The in-progress candle never reaches
//! this module: the exchange layer trims it for live mode and the backtester
//! only replays completed candles.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::indicators::{IndicatorEngine, IndicatorFrame};
use crate::types::{Candle, Side};

/// Crossing direction on the last closed candle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossKind {
    /// RSI came up through the oversold bound (bullish)
    Crossover,
    /// RSI dropped through the overbought bound (bearish)
    Crossunder,
}

impl CrossKind {
    /// Position side this crossing argues for
    pub fn side(self) -> Side {
        match self {
            CrossKind::Crossover => Side::Long,
            CrossKind::Crossunder => Side::Short,
        }
    }
}

impl std::fmt::Display for CrossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrossKind::Crossover => write!(f, "crossover"),
            CrossKind::Crossunder => write!(f, "crossunder"),
        }
    }
}

/// A confirmed threshold crossing
///
/// Carries the signal candle because downstream entry and stop pricing work
/// off its high/low, and it is persisted across restarts while a swap is
/// being staged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: CrossKind,
    /// The closed candle the crossing completed on
    pub candle: Candle,
    pub rsi: f64,
    pub prev_rsi: f64,
    /// Dynamic period in effect at the signal candle
    pub rsi_period: usize,
}

/// Outcome of one detection pass over the closed-candle history
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// A crossing completed on the last closed candle
    Cross(Signal),
    /// RSI defined on both candles, no crossing
    None,
    /// Too little history or indicator warmup; not an error
    Insufficient { reason: String },
}

impl Detection {
    pub fn signal(&self) -> Option<&Signal> {
        match self {
            Detection::Cross(signal) => Some(signal),
            _ => None,
        }
    }
}

/// Detects oversold/overbought crossings on the last two closed RSI values
#[derive(Debug, Clone)]
pub struct SignalDetector {
    engine: IndicatorEngine,
    oversold: f64,
    overbought: f64,
}

impl SignalDetector {
    pub fn new(engine: IndicatorEngine, oversold: f64, overbought: f64) -> Self {
        Self {
            engine,
            oversold,
            overbought,
        }
    }

    /// Convenience wrapper that computes the indicator frames itself
    pub fn detect(&self, closed_candles: &[Candle]) -> Detection {
        let frames = self.engine.compute(closed_candles);
        self.detect_with_frames(closed_candles, &frames)
    }

    /// Detection over frames already computed this tick
    pub fn detect_with_frames(
        &self,
        closed_candles: &[Candle],
        frames: &[IndicatorFrame],
    ) -> Detection {
        let n = closed_candles.len();
        let min_required = self.engine.settings().period_min + 2;
        if n < min_required {
            return Detection::Insufficient {
                reason: format!("need at least {} closed candles, have {}", min_required, n),
            };
        }

        let last_frame = &frames[n - 1];
        let prev_frame = &frames[n - 2];
        let (last_rsi, prev_rsi) = match (last_frame.rsi, prev_frame.rsi) {
            (Some(last), Some(prev)) => (last, prev),
            _ => {
                return Detection::Insufficient {
                    reason: format!(
                        "rsi warmup incomplete ({} candles, period {})",
                        n, last_frame.rsi_period
                    ),
                }
            }
        };

        match self.classify(prev_rsi, last_rsi) {
            Some(kind) => Detection::Cross(Signal {
                kind,
                candle: closed_candles[n - 1].clone(),
                rsi: last_rsi,
                prev_rsi,
                rsi_period: last_frame.rsi_period,
            }),
            None => Detection::None,
        }
    }

    /// Combined strict + loose crossing classification
    ///
    /// Strict wins when both fire. The two checks cannot produce opposite
    /// kinds for one `(prev, last)` pair as long as oversold < overbought,
    /// but a disagreement is logged rather than guessed at if it ever shows
    /// up.
    pub fn classify(&self, prev_rsi: f64, last_rsi: f64) -> Option<CrossKind> {
        let strict = self.strict_cross(prev_rsi, last_rsi);
        let loose = self.loose_cross(prev_rsi, last_rsi);

        match (strict, loose) {
            (Some(s), Some(l)) if s != l => {
                warn!(
                    prev_rsi,
                    last_rsi,
                    strict = %s,
                    loose = %l,
                    "strict and loose crossing checks disagree, keeping strict"
                );
                Some(s)
            }
            (Some(s), _) => Some(s),
            (None, Some(l)) => {
                debug!(prev_rsi, last_rsi, kind = %l, "loose-bound crossing");
                Some(l)
            }
            (None, None) => None,
        }
    }

    fn strict_cross(&self, prev: f64, last: f64) -> Option<CrossKind> {
        if prev >= self.overbought && last < self.overbought {
            Some(CrossKind::Crossunder)
        } else if prev <= self.oversold && last > self.oversold {
            Some(CrossKind::Crossover)
        } else {
            None
        }
    }

    fn loose_cross(&self, prev: f64, last: f64) -> Option<CrossKind> {
        if prev < self.overbought && last >= self.overbought {
            Some(CrossKind::Crossover)
        } else if prev > self.oversold && last <= self.oversold {
            Some(CrossKind::Crossunder)
        } else {
            None
        }
    }
}
