//! Historical-simulation value-at-risk on the post-trade book.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::config::VarConfig;
use crate::market::MarketState;
use crate::models::{RejectionCode, RejectionReason};

/// Result of a VaR estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VarEstimate {
    /// One-day loss at the configured confidence, in currency units.
    Estimated {
        /// Loss estimate (non-negative).
        var: f64,
        /// Observations used.
        observations: usize,
    },
    /// Too few aligned returns.
    Insufficient {
        /// Observations available.
        observations: usize,
    },
}

/// Estimate one-day VaR for a book of signed quantities.
///
/// Scenario P&L is `Σ notionalᵢ × rᵢ[t]` over the most recent returns common
/// to every held symbol; VaR is the loss at index `floor((1 - c) × n)` of the
/// ascending P&L distribution.
#[must_use]
pub fn estimate(
    config: &VarConfig,
    book: &BTreeMap<String, Decimal>,
    market: &MarketState,
) -> VarEstimate {
    let mut legs = Vec::with_capacity(book.len());
    for (symbol, quantity) in book {
        if quantity.is_zero() {
            continue;
        }
        let (Some(price), Some(returns)) = (market.last_price(symbol), market.returns(symbol)) else {
            return VarEstimate::Insufficient { observations: 0 };
        };
        let notional = (quantity * price).to_f64().unwrap_or(0.0);
        legs.push((notional, returns));
    }
    if legs.is_empty() {
        return VarEstimate::Estimated {
            var: 0.0,
            observations: 0,
        };
    }

    let n = legs
        .iter()
        .map(|(_, r)| r.len())
        .min()
        .unwrap_or(0)
        .min(config.window);
    if n < config.min_observations || n == 0 {
        return VarEstimate::Insufficient { observations: n };
    }

    let mut pnl: Vec<f64> = (0..n)
        .map(|t| {
            legs.iter()
                .map(|(notional, returns)| notional * returns[returns.len() - n + t])
                .sum()
        })
        .collect();
    pnl.sort_by(f64::total_cmp);

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = (((1.0 - config.confidence) * n as f64).floor() as usize).min(n - 1);
    VarEstimate::Estimated {
        var: (-pnl[index]).max(0.0),
        observations: n,
    }
}

/// Gate check: reject when post-trade VaR exceeds the allowed fraction of value.
pub(super) fn check(
    config: &VarConfig,
    post_trade: &BTreeMap<String, Decimal>,
    market: &MarketState,
    portfolio_value: Decimal,
) -> Option<RejectionReason> {
    if !config.enabled {
        return None;
    }
    match estimate(config, post_trade, market) {
        VarEstimate::Insufficient { observations } => config.require_history.then(|| {
            RejectionReason::new(
                RejectionCode::VarInsufficientHistory,
                format!(
                    "{observations} aligned returns available, {} required",
                    config.min_observations
                ),
            )
        }),
        VarEstimate::Estimated { var, .. } => {
            let limit = (config.max_var_fraction * portfolio_value).to_f64().unwrap_or(0.0);
            (var > limit).then(|| {
                RejectionReason::new(
                    RejectionCode::VarLimit,
                    format!(
                        "post-trade {:.0}% one-day VaR {var:.2} exceeds limit {limit:.2}",
                        config.confidence * 100.0
                    ),
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bar;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn market_with(closes: &[Decimal]) -> MarketState {
        let mut market = MarketState::new(252);
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap();
        for (i, close) in closes.iter().enumerate() {
            let ts = start + Duration::days(i64::try_from(i).unwrap());
            market.observe(&Bar::new("SPY", ts, *close, *close, *close, *close, dec!(1)));
        }
        market
    }

    fn config(min_observations: usize) -> VarConfig {
        VarConfig {
            min_observations,
            ..VarConfig::default()
        }
    }

    #[test]
    fn worst_tail_scenario_sets_var() {
        // 20 returns: one -10% day, the rest +1%.
        let mut closes = vec![dec!(100)];
        for i in 0..20 {
            let last = *closes.last().unwrap();
            let next = if i == 5 { last * dec!(0.9) } else { last * dec!(1.01) };
            closes.push(next);
        }
        let market = market_with(&closes);
        let book = BTreeMap::from([("SPY".to_string(), dec!(10))]);
        let price = market.last_price("SPY").unwrap().to_f64().unwrap();

        let VarEstimate::Estimated { var, observations } = estimate(&config(20), &book, &market)
        else {
            panic!("expected an estimate");
        };
        assert_eq!(observations, 20);
        // floor(0.05 * 20) = 1: the second-worst scenario, a +1% day, is no loss.
        assert!(var.abs() < 1e-9);

        let strict = VarConfig {
            confidence: 0.99,
            ..config(20)
        };
        let VarEstimate::Estimated { var, .. } = estimate(&strict, &book, &market) else {
            panic!("expected an estimate");
        };
        assert!((var - price * 10.0 * 0.1).abs() < 1e-6);
    }

    #[test]
    fn short_history_is_insufficient() {
        let market = market_with(&[dec!(100), dec!(101), dec!(102)]);
        let book = BTreeMap::from([("SPY".to_string(), dec!(10))]);
        assert_eq!(
            estimate(&config(20), &book, &market),
            VarEstimate::Insufficient { observations: 2 }
        );
        assert!(check(&config(20), &book, &market, dec!(100000)).is_none());

        let strict = VarConfig {
            require_history: true,
            ..config(20)
        };
        let reason = check(&strict, &book, &market, dec!(100000)).unwrap();
        assert_eq!(reason.code, RejectionCode::VarInsufficientHistory);
    }

    #[test]
    fn large_position_breaches_limit() {
        let closes: Vec<Decimal> = (0..30)
            .map(|i| if i % 2 == 0 { dec!(100) } else { dec!(90) })
            .collect();
        let market = market_with(&closes);
        let book = BTreeMap::from([("SPY".to_string(), dec!(1000))]);
        let reason = check(&config(20), &book, &market, dec!(100000)).unwrap();
        assert_eq!(reason.code, RejectionCode::VarLimit);
    }
}
