//! Broker capability contract.
//!
//! Adapters report raw statuses and cumulative fills; they never build
//! domain [`Order`](crate::models::Order)s.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{BrokerOrderId, Order, OrderId, OrderSide, OrderType};
use crate::portfolio::Position;

/// Errors reported by broker adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Call did not complete in time.
    #[error("{operation} timed out")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// Connection could not be established or was dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// Broker asked us to slow down.
    #[error("rate limited")]
    RateLimited {
        /// Broker-suggested wait.
        retry_after: Option<Duration>,
    },

    /// Broker-side failure.
    #[error("server error {status}: {message}")]
    Server {
        /// Status code.
        status: u16,
        /// Message.
        message: String,
    },

    /// Credentials refused.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Order refused by the broker or exchange.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Request is malformed.
    #[error("invalid request: {0}")]
    InvalidOrder(String),

    /// Unknown order or resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else; classified by message.
    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// Broker-suggested delay before retrying, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Order as sent to a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Engine order ID (client order ID at the broker).
    pub client_order_id: OrderId,
    /// Symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Quantity.
    pub quantity: Decimal,
    /// Order type.
    pub order_type: OrderType,
    /// Limit price for limit orders.
    pub limit_price: Option<Decimal>,
}

impl From<&Order> for OrderRequest {
    fn from(order: &Order) -> Self {
        Self {
            client_order_id: order.id().clone(),
            symbol: order.symbol().to_string(),
            side: order.side(),
            quantity: order.quantity(),
            order_type: order.order_type(),
            limit_price: (order.order_type() == OrderType::Limit).then(|| order.reference_price()),
        }
    }
}

/// Raw order status as reported by a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BrokerOrderStatus {
    /// Working, nothing filled.
    Accepted,
    /// Working, partially filled.
    PartiallyFilled {
        /// Total filled so far.
        cumulative_quantity: Decimal,
        /// Average price of everything filled so far.
        average_price: Decimal,
    },
    /// Completely filled.
    Filled {
        /// Total filled.
        cumulative_quantity: Decimal,
        /// Average fill price.
        average_price: Decimal,
    },
    /// Refused.
    Rejected {
        /// Broker's reason.
        reason: String,
    },
    /// Cancelled.
    Cancelled,
    /// Expired at the broker.
    Expired,
}

impl BrokerOrderStatus {
    /// Whether the broker still considers the order working.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Accepted | Self::PartiallyFilled { .. })
    }
}

impl fmt::Display for BrokerOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::PartiallyFilled {
                cumulative_quantity,
                ..
            } => write!(f, "partially_filled({cumulative_quantity})"),
            Self::Filled {
                cumulative_quantity,
                ..
            } => write!(f, "filled({cumulative_quantity})"),
            Self::Rejected { reason } => write!(f, "rejected({reason})"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// What every broker adapter provides.
#[async_trait]
pub trait BrokerPort: Send + Sync + fmt::Debug {
    /// Adapter name for logs and metrics.
    fn name(&self) -> &str;

    /// Submit an order; returns the broker's ID.
    async fn submit(&self, order: &OrderRequest) -> Result<BrokerOrderId, BrokerError>;

    /// Request cancellation.
    async fn cancel(&self, id: &BrokerOrderId) -> Result<(), BrokerError>;

    /// Current positions.
    async fn positions(&self) -> Result<Vec<Position>, BrokerError>;

    /// Current cash balance.
    async fn cash(&self) -> Result<Decimal, BrokerError>;

    /// Status of one order.
    async fn order_status(&self, id: &BrokerOrderId) -> Result<BrokerOrderStatus, BrokerError>;

    /// IDs of every order the broker considers open.
    async fn open_orders(&self) -> Result<Vec<BrokerOrderId>, BrokerError>;

    /// Latest price hint for simulated venues. Real venues ignore it.
    fn observe_price(&self, _symbol: &str, _price: Decimal) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderIntent;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn market_request_has_no_limit() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap();
        let intent = OrderIntent::new(
            "AAPL",
            OrderSide::Buy,
            dec!(10),
            OrderType::Market,
            dec!(150),
            "s",
            ts,
            false,
        );
        let order = Order::from_intent(OrderId::new("o-1"), intent, ts);
        let request = OrderRequest::from(&order);
        assert_eq!(request.client_order_id.as_str(), "o-1");
        assert!(request.limit_price.is_none());
    }

    #[test]
    fn status_serializes_tagged() {
        let status = BrokerOrderStatus::Filled {
            cumulative_quantity: dec!(5),
            average_price: dec!(10),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "filled");
        assert!(!status.is_open());
    }
}
