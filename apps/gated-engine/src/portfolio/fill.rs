//! Executions applied to the portfolio.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{OrderId, OrderSide};

/// One execution increment of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Unique fill identifier (order ID plus sequence).
    pub fill_id: String,
    /// Order the fill belongs to.
    pub order_id: OrderId,
    /// Symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Filled quantity (always positive).
    pub quantity: Decimal,
    /// Execution price.
    pub price: Decimal,
    /// Commission charged.
    pub commission: Decimal,
    /// Execution time.
    pub timestamp: DateTime<Utc>,
}

impl Fill {
    /// Signed quantity (`+` for buys, `-` for sells).
    #[must_use]
    pub fn signed_quantity(&self) -> Decimal {
        self.side.sign() * self.quantity
    }

    /// Cash moved by the fill, excluding commission.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}
