//! In-memory portfolio state.
//!
//! Cash and positions change only through [`PortfolioState::apply_fill`].
//! [`PortfolioState::record_equity`] marks the book to market for the
//! equity curve, high-water mark and daily P&L without touching either.

mod fill;
mod position;

pub use fill::Fill;
pub use position::Position;

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::risk::TradingDay;

/// Fill application errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortfolioError {
    /// Fill quantity is zero or negative.
    #[error("fill {fill_id} has non-positive quantity {quantity}")]
    NonPositiveQuantity {
        /// Fill ID.
        fill_id: String,
        /// Offending quantity.
        quantity: Decimal,
    },

    /// Fill price is zero or negative.
    #[error("fill {fill_id} has non-positive price {price}")]
    NonPositivePrice {
        /// Fill ID.
        fill_id: String,
        /// Offending price.
        price: Decimal,
    },

    /// Commission is negative.
    #[error("fill {fill_id} has negative commission {commission}")]
    NegativeCommission {
        /// Fill ID.
        fill_id: String,
        /// Offending commission.
        commission: Decimal,
    },
}

/// Result of applying a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// Fill changed cash and positions.
    Applied {
        /// P&L realized by any reduction the fill caused, net of commission.
        realized_pnl: Decimal,
    },
    /// Fill ID already applied; nothing changed.
    Duplicate,
}

/// One point on the equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquityPoint {
    /// When the book was marked.
    pub timestamp: DateTime<Utc>,
    /// Cash plus marked position value.
    pub equity: Decimal,
}

/// Cash, positions and equity tracking for one running engine.
///
/// With a history limit only the newest fills and equity points are kept.
/// Fill deduplication covers the retained fills, and the drawdown figures
/// are tracked as marks arrive so trimming does not change them.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioState {
    base_currency: String,
    cash: Decimal,
    positions: BTreeMap<String, Position>,
    high_water_mark: Decimal,
    day_start_equity: Decimal,
    current_day: Option<NaiveDate>,
    daily_pnl: Decimal,
    realized_pnl: Decimal,
    consecutive_losses: u32,
    curve_peak: Decimal,
    max_drawdown: Decimal,
    equity_curve: VecDeque<EquityPoint>,
    fills: VecDeque<Fill>,
    applied_fill_ids: HashSet<String>,
    history_limit: Option<usize>,
    calendar: TradingDay,
}

impl PortfolioState {
    /// Create a flat portfolio holding `initial_cash`.
    #[must_use]
    pub fn new(base_currency: impl Into<String>, initial_cash: Decimal) -> Self {
        Self {
            base_currency: base_currency.into(),
            cash: initial_cash,
            positions: BTreeMap::new(),
            high_water_mark: initial_cash,
            day_start_equity: initial_cash,
            current_day: None,
            daily_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            consecutive_losses: 0,
            curve_peak: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            equity_curve: VecDeque::new(),
            fills: VecDeque::new(),
            applied_fill_ids: HashSet::new(),
            history_limit: None,
            calendar: TradingDay::default(),
        }
    }

    /// Keep at most `limit` fills and equity points.
    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    /// Roll daily P&L over on `calendar` instead of the UTC date.
    #[must_use]
    pub const fn with_trading_day(mut self, calendar: TradingDay) -> Self {
        self.calendar = calendar;
        self
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Apply a fill to cash and positions.
    ///
    /// Fills are deduplicated by ID, so replaying a fill is harmless.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<FillOutcome, PortfolioError> {
        if self.applied_fill_ids.contains(&fill.fill_id) {
            debug!(fill_id = %fill.fill_id, "Duplicate fill ignored");
            return Ok(FillOutcome::Duplicate);
        }
        if fill.quantity <= Decimal::ZERO {
            return Err(PortfolioError::NonPositiveQuantity {
                fill_id: fill.fill_id.clone(),
                quantity: fill.quantity,
            });
        }
        if fill.price <= Decimal::ZERO {
            return Err(PortfolioError::NonPositivePrice {
                fill_id: fill.fill_id.clone(),
                price: fill.price,
            });
        }
        if fill.commission < Decimal::ZERO {
            return Err(PortfolioError::NegativeCommission {
                fill_id: fill.fill_id.clone(),
                commission: fill.commission,
            });
        }

        let delta = fill.signed_quantity();
        self.cash -= delta * fill.price;
        self.cash -= fill.commission;

        let position = self
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| Position::flat(fill.symbol.clone(), self.base_currency.clone()));

        let old_quantity = position.quantity;
        let mut realized = Decimal::ZERO;
        let mut reduced = false;

        if old_quantity.is_zero() || old_quantity.is_sign_positive() == delta.is_sign_positive() {
            let old_abs = old_quantity.abs();
            let total = old_abs + fill.quantity;
            position.average_cost =
                (old_abs * position.average_cost + fill.quantity * fill.price) / total;
            position.quantity += delta;
        } else {
            reduced = true;
            let closed = old_quantity.abs().min(fill.quantity);
            let direction = if old_quantity.is_sign_positive() {
                Decimal::ONE
            } else {
                Decimal::NEGATIVE_ONE
            };
            realized = (fill.price - position.average_cost) * closed * direction;
            position.quantity += delta;
            if fill.quantity > old_quantity.abs() {
                // Flipped through zero; the remainder opens at the fill price.
                position.average_cost = fill.price;
            }
        }

        if position.is_flat() {
            self.positions.remove(&fill.symbol);
        }

        let realized_net = if reduced {
            realized - fill.commission
        } else {
            Decimal::ZERO
        };
        if reduced {
            self.realized_pnl += realized_net;
            if realized_net < Decimal::ZERO {
                self.consecutive_losses += 1;
            } else if realized_net > Decimal::ZERO {
                self.consecutive_losses = 0;
            }
        }

        if self.cash < Decimal::ZERO {
            warn!(cash = %self.cash, fill_id = %fill.fill_id, "Cash balance negative after fill");
        }

        self.applied_fill_ids.insert(fill.fill_id.clone());
        self.fills.push_back(fill.clone());
        if let Some(limit) = self.history_limit {
            while self.fills.len() > limit {
                if let Some(evicted) = self.fills.pop_front() {
                    self.applied_fill_ids.remove(&evicted.fill_id);
                }
            }
        }

        debug!(
            fill_id = %fill.fill_id,
            symbol = %fill.symbol,
            side = %fill.side,
            quantity = %fill.quantity,
            price = %fill.price,
            cash = %self.cash,
            "Fill applied"
        );

        Ok(FillOutcome::Applied {
            realized_pnl: realized_net,
        })
    }

    /// Mark the book to market and extend the equity curve.
    ///
    /// Rolls the trading day when the trading date of `timestamp` changes.
    pub fn record_equity(
        &mut self,
        timestamp: DateTime<Utc>,
        marks: &BTreeMap<String, Decimal>,
    ) -> Decimal {
        let equity = self.portfolio_value(marks);
        let day = self.calendar.of(timestamp);
        if self.current_day != Some(day) {
            self.day_start_equity = self.equity_curve.back().map_or(equity, |p| p.equity);
            self.current_day = Some(day);
        }
        self.daily_pnl = equity - self.day_start_equity;
        if equity > self.high_water_mark {
            self.high_water_mark = equity;
        }
        if equity > self.curve_peak {
            self.curve_peak = equity;
        }
        if self.curve_peak > Decimal::ZERO {
            self.max_drawdown = self.max_drawdown.max((self.curve_peak - equity) / self.curve_peak);
        }
        self.equity_curve.push_back(EquityPoint { timestamp, equity });
        if let Some(limit) = self.history_limit {
            while self.equity_curve.len() > limit {
                self.equity_curve.pop_front();
            }
        }
        equity
    }

    // ========================================================================
    // Valuation
    // ========================================================================

    /// Cash plus positions marked at `marks` (average cost when unmarked).
    #[must_use]
    pub fn portfolio_value(&self, marks: &BTreeMap<String, Decimal>) -> Decimal {
        self.cash
            + self
                .positions
                .values()
                .map(|p| p.market_value(Self::mark_for(p, marks)))
                .sum::<Decimal>()
    }

    /// Absolute marked exposure in `symbol`.
    #[must_use]
    pub fn exposure(&self, symbol: &str, marks: &BTreeMap<String, Decimal>) -> Decimal {
        self.positions
            .get(symbol)
            .map_or(Decimal::ZERO, |p| p.market_value(Self::mark_for(p, marks)).abs())
    }

    fn mark_for(position: &Position, marks: &BTreeMap<String, Decimal>) -> Decimal {
        marks
            .get(&position.symbol)
            .copied()
            .unwrap_or(position.average_cost)
    }

    /// Largest peak-to-trough decline of every recorded mark, as a fraction.
    #[must_use]
    pub const fn max_drawdown(&self) -> Decimal {
        self.max_drawdown
    }

    // ========================================================================
    // Getters
    // ========================================================================

    /// Base currency.
    #[must_use]
    pub fn base_currency(&self) -> &str {
        &self.base_currency
    }

    /// Cash balance.
    #[must_use]
    pub const fn cash(&self) -> Decimal {
        self.cash
    }

    /// Open positions keyed by symbol.
    #[must_use]
    pub const fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    /// Position in `symbol`, if any.
    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Signed quantity held in `symbol`.
    #[must_use]
    pub fn quantity(&self, symbol: &str) -> Decimal {
        self.positions.get(symbol).map_or(Decimal::ZERO, |p| p.quantity)
    }

    /// Equity high-water mark.
    #[must_use]
    pub const fn high_water_mark(&self) -> Decimal {
        self.high_water_mark
    }

    /// Equity at the start of the current trading day.
    #[must_use]
    pub const fn day_start_equity(&self) -> Decimal {
        self.day_start_equity
    }

    /// P&L since the start of the current trading day, as of the last mark.
    #[must_use]
    pub const fn daily_pnl(&self) -> Decimal {
        self.daily_pnl
    }

    /// Cumulative realized P&L.
    #[must_use]
    pub const fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    /// Consecutive reductions that realized a loss.
    #[must_use]
    pub const fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    /// Retained equity curve, oldest first.
    #[must_use]
    pub const fn equity_curve(&self) -> &VecDeque<EquityPoint> {
        &self.equity_curve
    }

    /// Retained applied fills in order.
    #[must_use]
    pub const fn fills(&self) -> &VecDeque<Fill> {
        &self.fills
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderId, OrderSide};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn fill(id: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Fill {
        Fill {
            fill_id: id.to_string(),
            order_id: OrderId::new("ord-1"),
            symbol: "AAPL".to_string(),
            side,
            quantity,
            price,
            commission: Decimal::ZERO,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap(),
        }
    }

    #[test]
    fn buy_then_sell_realizes_pnl() {
        let mut portfolio = PortfolioState::new("USD", dec!(10000));
        portfolio
            .apply_fill(&fill("f1", OrderSide::Buy, dec!(10), dec!(100)))
            .unwrap();
        assert_eq!(portfolio.cash(), dec!(9000));
        assert_eq!(portfolio.quantity("AAPL"), dec!(10));

        let outcome = portfolio
            .apply_fill(&fill("f2", OrderSide::Sell, dec!(10), dec!(110)))
            .unwrap();
        assert_eq!(
            outcome,
            FillOutcome::Applied {
                realized_pnl: dec!(100)
            }
        );
        assert_eq!(portfolio.cash(), dec!(10100));
        assert!(portfolio.position("AAPL").is_none());
        assert_eq!(portfolio.consecutive_losses(), 0);
    }

    #[test]
    fn average_cost_is_weighted() {
        let mut portfolio = PortfolioState::new("USD", dec!(10000));
        portfolio
            .apply_fill(&fill("f1", OrderSide::Buy, dec!(10), dec!(100)))
            .unwrap();
        portfolio
            .apply_fill(&fill("f2", OrderSide::Buy, dec!(10), dec!(110)))
            .unwrap();
        assert_eq!(portfolio.position("AAPL").unwrap().average_cost, dec!(105));
    }

    #[test]
    fn losing_reductions_count_consecutively() {
        let mut portfolio = PortfolioState::new("USD", dec!(10000));
        portfolio
            .apply_fill(&fill("f1", OrderSide::Buy, dec!(10), dec!(100)))
            .unwrap();
        portfolio
            .apply_fill(&fill("f2", OrderSide::Sell, dec!(5), dec!(90)))
            .unwrap();
        portfolio
            .apply_fill(&fill("f3", OrderSide::Sell, dec!(5), dec!(95)))
            .unwrap();
        assert_eq!(portfolio.consecutive_losses(), 2);
        assert_eq!(portfolio.realized_pnl(), dec!(-75));
    }

    #[test]
    fn flipping_through_zero_resets_cost() {
        let mut portfolio = PortfolioState::new("USD", dec!(10000));
        portfolio
            .apply_fill(&fill("f1", OrderSide::Buy, dec!(10), dec!(100)))
            .unwrap();
        portfolio
            .apply_fill(&fill("f2", OrderSide::Sell, dec!(15), dec!(120)))
            .unwrap();
        let position = portfolio.position("AAPL").unwrap();
        assert_eq!(position.quantity, dec!(-5));
        assert_eq!(position.average_cost, dec!(120));
        assert_eq!(portfolio.realized_pnl(), dec!(200));
    }

    #[test]
    fn duplicate_fill_is_ignored() {
        let mut portfolio = PortfolioState::new("USD", dec!(10000));
        let f = fill("f1", OrderSide::Buy, dec!(10), dec!(100));
        portfolio.apply_fill(&f).unwrap();
        assert_eq!(portfolio.apply_fill(&f).unwrap(), FillOutcome::Duplicate);
        assert_eq!(portfolio.cash(), dec!(9000));
        assert_eq!(portfolio.fills().len(), 1);
    }

    #[test]
    fn invalid_fill_changes_nothing() {
        let mut portfolio = PortfolioState::new("USD", dec!(10000));
        let before = portfolio.clone();
        let result = portfolio.apply_fill(&fill("f1", OrderSide::Buy, dec!(0), dec!(100)));
        assert!(matches!(
            result,
            Err(PortfolioError::NonPositiveQuantity { .. })
        ));
        assert_eq!(portfolio, before);
    }

    #[test]
    fn equity_marks_track_high_water_and_daily_pnl() {
        let mut portfolio = PortfolioState::new("USD", dec!(10000));
        portfolio
            .apply_fill(&fill("f1", OrderSide::Buy, dec!(10), dec!(100)))
            .unwrap();

        let day1 = Utc.with_ymd_and_hms(2024, 3, 1, 16, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 2, 16, 0, 0).unwrap();
        let mut marks = BTreeMap::new();

        marks.insert("AAPL".to_string(), dec!(120));
        assert_eq!(portfolio.record_equity(day1, &marks), dec!(10200));
        assert_eq!(portfolio.high_water_mark(), dec!(10200));

        marks.insert("AAPL".to_string(), dec!(90));
        assert_eq!(portfolio.record_equity(day2, &marks), dec!(9900));
        assert_eq!(portfolio.day_start_equity(), dec!(10200));
        assert_eq!(portfolio.daily_pnl(), dec!(-300));
        assert_eq!(portfolio.high_water_mark(), dec!(10200));
        assert_eq!(portfolio.cash(), dec!(9000));
    }

    #[test]
    fn max_drawdown_from_curve() {
        let mut portfolio = PortfolioState::new("USD", dec!(100));
        let marks = BTreeMap::new();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 16, 0, 0).unwrap();
        portfolio.record_equity(t, &marks);
        portfolio.cash = dec!(80);
        portfolio.record_equity(t, &marks);
        assert_eq!(portfolio.max_drawdown(), dec!(0.2));
    }

    #[test]
    fn history_limit_bounds_fills_and_curve() {
        let mut portfolio = PortfolioState::new("USD", dec!(100000)).with_history_limit(3);
        let marks = BTreeMap::new();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 16, 0, 0).unwrap();
        for i in 0..10 {
            portfolio
                .apply_fill(&fill(&format!("f{i}"), OrderSide::Buy, dec!(1), dec!(100)))
                .unwrap();
            portfolio.record_equity(t + chrono::Duration::minutes(i), &marks);
        }
        assert_eq!(portfolio.fills().len(), 3);
        assert_eq!(portfolio.equity_curve().len(), 3);
        assert_eq!(portfolio.applied_fill_ids.len(), 3);
        assert_eq!(portfolio.fills()[0].fill_id, "f7");
        assert_eq!(portfolio.quantity("AAPL"), dec!(10));

        let replay = fill("f9", OrderSide::Buy, dec!(1), dec!(100));
        assert_eq!(portfolio.apply_fill(&replay).unwrap(), FillOutcome::Duplicate);
    }

    #[test]
    fn drawdown_survives_trimming() {
        let mut portfolio = PortfolioState::new("USD", dec!(100)).with_history_limit(2);
        let marks = BTreeMap::new();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 16, 0, 0).unwrap();
        portfolio.record_equity(t, &marks);
        portfolio.cash = dec!(50);
        portfolio.record_equity(t, &marks);
        portfolio.cash = dec!(90);
        portfolio.record_equity(t, &marks);
        portfolio.record_equity(t, &marks);
        assert!(portfolio.equity_curve().iter().all(|p| p.equity == dec!(90)));
        assert_eq!(portfolio.max_drawdown(), dec!(0.5));
    }

    #[test]
    fn day_start_rolls_on_the_session_date() {
        let session = crate::risk::SessionWindow::from_config(&crate::config::SessionConfig::default())
            .unwrap();
        let mut portfolio =
            PortfolioState::new("USD", dec!(100)).with_trading_day(session.trading_day());
        let marks = BTreeMap::new();
        // 20:00 and 23:30 New York time on March 1st, the second already March 2nd in UTC.
        let close = Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 3, 2, 4, 30, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2024, 3, 2, 15, 0, 0).unwrap();

        portfolio.record_equity(close, &marks);
        portfolio.cash = dec!(90);
        portfolio.record_equity(late, &marks);
        assert_eq!(portfolio.day_start_equity(), dec!(100));
        assert_eq!(portfolio.daily_pnl(), dec!(-10));

        portfolio.record_equity(next_day, &marks);
        assert_eq!(portfolio.day_start_equity(), dec!(90));
        assert_eq!(portfolio.daily_pnl(), Decimal::ZERO);
    }
}
