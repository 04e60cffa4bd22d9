//! Positions held in the portfolio.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A signed position in one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Symbol.
    pub symbol: String,
    /// Signed quantity (negative when short).
    pub quantity: Decimal,
    /// Weighted average entry cost.
    pub average_cost: Decimal,
    /// Currency the position is valued in.
    pub currency: String,
}

impl Position {
    /// Create a flat position.
    #[must_use]
    pub fn flat(symbol: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            average_cost: Decimal::ZERO,
            currency: currency.into(),
        }
    }

    /// Returns true if no quantity is held.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Signed market value at `mark`.
    #[must_use]
    pub fn market_value(&self, mark: Decimal) -> Decimal {
        self.quantity * mark
    }

    /// Unrealized P&L at `mark`.
    #[must_use]
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        (mark - self.average_cost) * self.quantity
    }
}
