//! Orders owned by the order lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::decision::OrderIntent;

/// Engine-side order identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Wrap a raw identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerOrderId(String);

impl BrokerOrderId {
    /// Wrap a raw identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl OrderSide {
    /// `+1` for buys, `-1` for sells.
    #[must_use]
    pub const fn sign(&self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Fill at the prevailing price.
    Market,
    /// Fill at the limit price or better.
    Limit,
}

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Approved by the gate, not yet accepted by the broker.
    Created,
    /// Accepted by the broker, nothing filled yet.
    Submitted,
    /// Some but not all quantity filled.
    PartiallyFilled,
    /// Entire quantity filled.
    Filled,
    /// Refused by the broker or timed out unfilled.
    Rejected,
    /// Cancel honoured by the broker.
    Cancelled,
    /// Exceeded the maximum open duration.
    Expired,
}

impl OrderState {
    /// Returns true if no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Rejected | Self::Cancelled | Self::Expired
        )
    }

    /// Returns true if the order is working at the broker.
    #[must_use]
    pub const fn is_working(&self) -> bool {
        matches!(self, Self::Submitted | Self::PartiallyFilled)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// An order tracked by the lifecycle.
///
/// Built only from an approved [`OrderIntent`]; mutated only by the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    symbol: String,
    side: OrderSide,
    quantity: Decimal,
    order_type: OrderType,
    reference_price: Decimal,
    state: OrderState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    filled_quantity: Decimal,
    average_fill_price: Option<Decimal>,
    rejection_reason: Option<String>,
    broker_order_id: Option<BrokerOrderId>,
    strategy_id: String,
    signal_timestamp: DateTime<Utc>,
}

impl Order {
    pub(crate) fn from_intent(id: OrderId, intent: OrderIntent, now: DateTime<Utc>) -> Self {
        Self {
            id,
            symbol: intent.symbol().to_string(),
            side: intent.side(),
            quantity: intent.quantity(),
            order_type: intent.order_type(),
            reference_price: intent.reference_price(),
            state: OrderState::Created,
            created_at: now,
            updated_at: now,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            rejection_reason: None,
            broker_order_id: None,
            strategy_id: intent.strategy_id().to_string(),
            signal_timestamp: intent.signal_timestamp(),
        }
    }

    // ========================================================================
    // Getters
    // ========================================================================

    /// Engine order ID.
    #[must_use]
    pub const fn id(&self) -> &OrderId {
        &self.id
    }

    /// Symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Side.
    #[must_use]
    pub const fn side(&self) -> OrderSide {
        self.side
    }

    /// Requested quantity.
    #[must_use]
    pub const fn quantity(&self) -> Decimal {
        self.quantity
    }

    /// Order type.
    #[must_use]
    pub const fn order_type(&self) -> OrderType {
        self.order_type
    }

    /// Price the order was sized against.
    #[must_use]
    pub const fn reference_price(&self) -> Decimal {
        self.reference_price
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> OrderState {
        self.state
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last update time.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Cumulative filled quantity.
    #[must_use]
    pub const fn filled_quantity(&self) -> Decimal {
        self.filled_quantity
    }

    /// Quantity still open.
    #[must_use]
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    /// Volume-weighted average fill price.
    #[must_use]
    pub const fn average_fill_price(&self) -> Option<Decimal> {
        self.average_fill_price
    }

    /// Why the order was rejected, if it was.
    #[must_use]
    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    /// Broker-assigned ID once submitted.
    #[must_use]
    pub const fn broker_order_id(&self) -> Option<&BrokerOrderId> {
        self.broker_order_id.as_ref()
    }

    /// Strategy that produced the triggering signal.
    #[must_use]
    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    /// Timestamp of the triggering signal.
    #[must_use]
    pub const fn signal_timestamp(&self) -> DateTime<Utc> {
        self.signal_timestamp
    }

    // ========================================================================
    // Lifecycle mutations
    // ========================================================================

    pub(crate) fn set_state(&mut self, state: OrderState, now: DateTime<Utc>) {
        self.state = state;
        self.updated_at = now;
    }

    pub(crate) fn set_broker_order_id(&mut self, broker_order_id: BrokerOrderId) {
        self.broker_order_id = Some(broker_order_id);
    }

    pub(crate) fn set_rejection_reason(&mut self, reason: impl Into<String>) {
        self.rejection_reason = Some(reason.into());
    }

    /// Record an execution increment and update the average fill price.
    pub(crate) fn record_execution(&mut self, quantity: Decimal, price: Decimal) {
        let previous_notional = self.average_fill_price.unwrap_or(Decimal::ZERO) * self.filled_quantity;
        self.filled_quantity += quantity;
        if self.filled_quantity > Decimal::ZERO {
            self.average_fill_price =
                Some((previous_notional + quantity * price) / self.filled_quantity);
        }
    }
}
