//! Stop-loss trailing rules
//!
//! Two mechanisms, both monotone: the three-candle-sequence rule that runs
//! every tick while in position, and the focus-break stop computed when a
//! swap fires. Neither ever loosens the stop.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{Candle, Money, Side};

/// Three-candle monotonic sequence rule.
///
/// Looks at the last three closed candles. Strictly increasing lows (long)
/// or strictly decreasing highs (short) propose the *oldest* extreme of the
/// triple as the new stop; anything else proposes nothing.
pub fn three_candle_stop(closed: &[Candle], side: Side) -> Option<Money> {
    if closed.len() < 3 {
        return None;
    }
    let window = &closed[closed.len() - 3..];
    let (a, b, c) = (&window[0], &window[1], &window[2]);

    match side {
        Side::Long => {
            (a.low < b.low && b.low < c.low).then(|| Money::from_f64(a.low))
        }
        Side::Short => {
            (a.high > b.high && b.high > c.high).then(|| Money::from_f64(a.high))
        }
    }
}

/// Apply a candidate stop only if it tightens the current one: higher for
/// longs, lower for shorts. `None` means no change.
pub fn tightened(current: Option<Money>, candidate: Money, side: Side) -> Option<Money> {
    match (current, side) {
        (None, _) => Some(candidate),
        (Some(stop), Side::Long) if candidate > stop => Some(candidate),
        (Some(stop), Side::Short) if candidate < stop => Some(candidate),
        _ => None,
    }
}

/// Stop for the position opened by a focus-price break: the more
/// conservative of the armed focus stop and the breaking tick's extreme,
/// buffered away from the market.
pub fn focus_break_stop(
    focus_stop: Money,
    tick_extreme: Money,
    new_side: Side,
    buffer_pct: f64,
) -> Money {
    match new_side {
        Side::Long => focus_stop.min(tick_extreme).with_pct_offset(-pct(buffer_pct)),
        Side::Short => focus_stop.max(tick_extreme).with_pct_offset(pct(buffer_pct)),
    }
}

/// Closed candles that opened at or after `since`. The candle an entry fell
/// inside does not count; only candles that started after the entry do.
pub fn candles_closed_since(closed: &[Candle], since: DateTime<Utc>) -> usize {
    closed
        .iter()
        .rev()
        .take_while(|c| c.datetime >= since)
        .count()
}

/// Percentage as a `Decimal` offset factor argument
pub(crate) fn pct(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or_default()
}
