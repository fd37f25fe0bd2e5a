//! Position sizing
//!
//! Base notional (fixed quote amount or a balance percentage) is scaled so
//! the stop distance risks a configured share of it, then the resulting size
//! is floored to the exchange minimum notional.

use crate::config::StrategyConfig;
use crate::types::Money;

/// Quote-currency notional before risk adjustment
pub fn base_notional(strategy: &StrategyConfig, balance: Money) -> Money {
    match strategy.entry_balance_pct {
        Some(pct) => balance * Money::from_f64(pct) / Money::HUNDRED,
        None => Money::from_f64(strategy.entry_notional),
    }
}

/// Scale the notional so that the stop distance risks `fixed_risk_pct` of
/// it: `notional × fixed_risk_pct / raw_risk_pct`, where the raw risk is the
/// entry-to-stop distance as a percentage of entry. No-op when the target is
/// unset or the distance degenerate.
pub fn risk_adjusted_notional(
    notional: Money,
    entry: Money,
    stop: Money,
    fixed_risk_pct: Option<f64>,
) -> Money {
    let Some(target) = fixed_risk_pct else {
        return notional;
    };
    if entry.is_zero() {
        return notional;
    }

    let raw_risk_pct = (entry - stop).abs() / entry * Money::HUNDRED;
    if raw_risk_pct.is_zero() {
        return notional;
    }

    notional * Money::from_f64(target) / raw_risk_pct
}

/// Contracts for the notional at `entry`, floored so that
/// `size × entry >= min_notional`.
pub fn position_size(notional: Money, entry: Money, min_notional: Money) -> Money {
    if entry.is_zero() {
        return Money::ZERO;
    }
    (notional / entry).max(min_notional / entry)
}

/// Balance-to-contracts pipeline for a new entry
pub fn entry_size(strategy: &StrategyConfig, balance: Money, entry: Money, stop: Money) -> Money {
    let base = base_notional(strategy, balance);
    let adjusted = risk_adjusted_notional(base, entry, stop, strategy.fixed_risk_pct);
    position_size(adjusted, entry, Money::from_f64(strategy.min_notional))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_risk_doubles_notional_at_half_risk() {
        // entry 100, stop 98 -> raw risk 2%; target 4% doubles the notional
        let adjusted = risk_adjusted_notional(
            Money::from_f64(1000.0),
            Money::from_f64(100.0),
            Money::from_f64(98.0),
            Some(4.0),
        );
        assert_eq!(adjusted, Money::from_f64(2000.0));
    }

    #[test]
    fn test_fixed_risk_shrinks_wide_stops() {
        // raw risk 8% with a 4% target halves the notional
        let adjusted = risk_adjusted_notional(
            Money::from_f64(1000.0),
            Money::from_f64(100.0),
            Money::from_f64(108.0),
            Some(4.0),
        );
        assert_eq!(adjusted, Money::from_f64(500.0));
    }

    #[test]
    fn test_unset_fixed_risk_is_a_no_op() {
        let notional = Money::from_f64(1000.0);
        assert_eq!(
            risk_adjusted_notional(notional, Money::from_f64(100.0), Money::from_f64(98.0), None),
            notional
        );
    }

    #[test]
    fn test_degenerate_stop_distance_is_a_no_op() {
        let notional = Money::from_f64(1000.0);
        assert_eq!(
            risk_adjusted_notional(
                notional,
                Money::from_f64(100.0),
                Money::from_f64(100.0),
                Some(4.0)
            ),
            notional
        );
    }

    #[test]
    fn test_min_notional_floor() {
        // 1 quote unit of notional at entry 100 would be size 0.01, but the
        // 5-unit minimum floors it at 0.05
        let size = position_size(
            Money::from_f64(1.0),
            Money::from_f64(100.0),
            Money::from_f64(5.0),
        );
        assert_eq!(size, Money::from_f64(0.05));
        assert!(size * Money::from_f64(100.0) >= Money::from_f64(5.0));
    }

    #[test]
    fn test_balance_percentage_base() {
        let strategy = StrategyConfig {
            entry_balance_pct: Some(10.0),
            ..Default::default()
        };
        assert_eq!(
            base_notional(&strategy, Money::from_f64(5000.0)),
            Money::from_f64(500.0)
        );

        let fixed = StrategyConfig::default();
        assert_eq!(
            base_notional(&fixed, Money::from_f64(5000.0)),
            Money::from_f64(1000.0)
        );
    }

    #[test]
    fn test_entry_size_pipeline() {
        let strategy = StrategyConfig {
            entry_notional: 1000.0,
            fixed_risk_pct: Some(4.0),
            min_notional: 5.0,
            ..Default::default()
        };

        // raw risk 2% -> notional 2000 -> size 20 at entry 100
        let size = entry_size(
            &strategy,
            Money::from_f64(10_000.0),
            Money::from_f64(100.0),
            Money::from_f64(98.0),
        );
        assert_eq!(size, Money::from_f64(20.0));
        assert!(size * Money::from_f64(100.0) >= Money::from_f64(strategy.min_notional));
    }
}
