//! Moving-average crossover reference strategy.

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::Strategy;
use crate::market::MarketState;
use crate::models::{Bar, Direction, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trend {
    Above,
    Below,
}

/// Goes long when the fast average crosses above the slow one and closes
/// when it crosses back below. Long only.
#[derive(Debug, Clone)]
pub struct SmaCrossStrategy {
    id: String,
    fast: usize,
    slow: usize,
    strength: f64,
    closes: BTreeMap<String, VecDeque<Decimal>>,
    trend: BTreeMap<String, Trend>,
}

impl SmaCrossStrategy {
    /// Create a crossover strategy.
    ///
    /// Windows are clamped so that `1 <= fast < slow`.
    #[must_use]
    pub fn new(fast: usize, slow: usize) -> Self {
        let fast = fast.max(1);
        Self {
            id: format!("sma_cross_{fast}_{}", slow.max(fast + 1)),
            fast,
            slow: slow.max(fast + 1),
            strength: 1.0,
            closes: BTreeMap::new(),
            trend: BTreeMap::new(),
        }
    }

    /// Signal strength for entries (clamped to `[0.0, 1.0]`).
    #[must_use]
    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength.clamp(0.0, 1.0);
        self
    }

    fn average(closes: &VecDeque<Decimal>, n: usize) -> Decimal {
        let sum: Decimal = closes.iter().rev().take(n).sum();
        sum / Decimal::from(n)
    }
}

impl Default for SmaCrossStrategy {
    fn default() -> Self {
        Self::new(5, 20)
    }
}

impl Strategy for SmaCrossStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_bar(&mut self, bar: &Bar, _market: &MarketState) -> Option<Signal> {
        let closes = self.closes.entry(bar.symbol.clone()).or_default();
        closes.push_back(bar.close);
        while closes.len() > self.slow {
            closes.pop_front();
        }
        if closes.len() < self.slow {
            return None;
        }

        let fast = Self::average(closes, self.fast);
        let slow = Self::average(closes, self.slow);
        let now = if fast > slow { Trend::Above } else { Trend::Below };
        let before = self.trend.insert(bar.symbol.clone(), now);

        let direction = match (before, now) {
            (Some(Trend::Below), Trend::Above) => Direction::Long,
            (Some(Trend::Above), Trend::Below) => Direction::Close,
            _ => return None,
        };
        debug!(symbol = %bar.symbol, fast = %fast, slow = %slow, direction = %direction, "Crossover");

        let strength = if direction == Direction::Close { 1.0 } else { self.strength };
        match Signal::new(&bar.symbol, direction, strength, bar.timestamp, &self.id) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(symbol = %bar.symbol, error = %e, "Dropping malformed signal");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn feed(strategy: &mut SmaCrossStrategy, closes: &[Decimal]) -> Vec<Option<Direction>> {
        let mut market = MarketState::new(10);
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                let bar = Bar::new("SPY", start + Duration::days(i as i64), *close, *close, *close, *close, dec!(1));
                market.observe(&bar);
                strategy.on_bar(&bar, &market).map(|s| s.direction())
            })
            .collect()
    }

    #[test]
    fn silent_until_slow_window_fills() {
        let mut strategy = SmaCrossStrategy::new(1, 3);
        let out = feed(&mut strategy, &[dec!(10), dec!(10)]);
        assert_eq!(out, vec![None, None]);
    }

    #[test]
    fn crossing_up_then_down_emits_long_then_close() {
        let mut strategy = SmaCrossStrategy::new(1, 3);
        let out = feed(
            &mut strategy,
            &[dec!(10), dec!(10), dec!(9), dec!(12), dec!(13), dec!(8)],
        );
        assert_eq!(
            out,
            vec![None, None, None, Some(Direction::Long), None, Some(Direction::Close)]
        );
    }

    #[test]
    fn windows_are_clamped() {
        let strategy = SmaCrossStrategy::new(0, 0);
        assert_eq!(strategy.id(), "sma_cross_1_2");
    }
}
