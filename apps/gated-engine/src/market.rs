//! Rolling per-symbol market state built from observed bars.
//!
//! Supplies reference prices for sizing, marks for valuation, and the return
//! history used by the value-at-risk gate. Only bars already observed are
//! visible, so anything derived from it is free of lookahead.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::models::Bar;

#[derive(Debug, Clone, PartialEq)]
struct SymbolHistory {
    last_close: Decimal,
    last_timestamp: DateTime<Utc>,
    returns: VecDeque<f64>,
}

/// Latest prices and bounded return history per symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketState {
    window: usize,
    symbols: BTreeMap<String, SymbolHistory>,
}

impl MarketState {
    /// Create an empty state keeping at most `window` returns per symbol.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            symbols: BTreeMap::new(),
        }
    }

    /// Record a bar's close.
    pub fn observe(&mut self, bar: &Bar) {
        let window = self.window;
        match self.symbols.get_mut(&bar.symbol) {
            Some(history) => {
                if history.last_close > Decimal::ZERO {
                    let change = (bar.close - history.last_close) / history.last_close;
                    if let Some(r) = change.to_f64() {
                        history.returns.push_back(r);
                        while history.returns.len() > window {
                            history.returns.pop_front();
                        }
                    }
                }
                history.last_close = bar.close;
                history.last_timestamp = bar.timestamp;
            }
            None => {
                self.symbols.insert(
                    bar.symbol.clone(),
                    SymbolHistory {
                        last_close: bar.close,
                        last_timestamp: bar.timestamp,
                        returns: VecDeque::with_capacity(window),
                    },
                );
            }
        }
    }

    /// Latest close for `symbol`.
    #[must_use]
    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.symbols.get(symbol).map(|h| h.last_close)
    }

    /// Timestamp of the latest bar for `symbol`.
    #[must_use]
    pub fn last_timestamp(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.symbols.get(symbol).map(|h| h.last_timestamp)
    }

    /// Simple close-to-close returns for `symbol`, oldest first.
    #[must_use]
    pub fn returns(&self, symbol: &str) -> Option<&VecDeque<f64>> {
        self.symbols.get(symbol).map(|h| &h.returns)
    }

    /// Latest close of every observed symbol.
    #[must_use]
    pub fn marks(&self) -> BTreeMap<String, Decimal> {
        self.symbols
            .iter()
            .map(|(symbol, h)| (symbol.clone(), h.last_close))
            .collect()
    }
}
