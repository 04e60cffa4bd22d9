//! Risk gate decisions.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{OrderSide, OrderType};

/// Machine-readable reason a signal was rejected.
///
/// Variants are declared in gate evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    /// Kill switch is tripped.
    Halted,
    /// Daily order-count limit reached.
    DailyOrderLimit,
    /// Too many rejects in the trailing hour.
    RejectRateLimit,
    /// Symbol is cooling down after a recent reject.
    SymbolCooldown,
    /// Signal falls outside the trading session.
    OutsideSession,
    /// Consecutive-reject auto-stop engaged.
    ConsecutiveRejectStop,
    /// Post-trade value-at-risk exceeds the limit.
    VarLimit,
    /// Not enough return history to estimate value-at-risk.
    VarInsufficientHistory,
    /// Drawdown from the equity high-water mark exceeds the limit.
    DrawdownBreaker,
    /// Intraday loss exceeds the limit.
    IntradayLossBreaker,
    /// Too many consecutive losing trades.
    ConsecutiveLossBreaker,
    /// Single-symbol exposure exceeds the limit.
    SymbolConcentration,
    /// Sector exposure exceeds the limit.
    SectorConcentration,
    /// Exposure to correlated symbols exceeds the limit.
    CorrelatedExposure,
    /// No price to size against.
    NoReferencePrice,
    /// Close requested but no position is open.
    NoPosition,
    /// Sized quantity rounds to zero.
    ZeroQuantity,
    /// Sized quantity is negative or could not be computed.
    InvalidQuantity,
}

impl RejectionCode {
    /// Wire form of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Halted => "halted",
            Self::DailyOrderLimit => "daily_order_limit",
            Self::RejectRateLimit => "reject_rate_limit",
            Self::SymbolCooldown => "symbol_cooldown",
            Self::OutsideSession => "outside_session",
            Self::ConsecutiveRejectStop => "consecutive_reject_stop",
            Self::VarLimit => "var_limit",
            Self::VarInsufficientHistory => "var_insufficient_history",
            Self::DrawdownBreaker => "drawdown_breaker",
            Self::IntradayLossBreaker => "intraday_loss_breaker",
            Self::ConsecutiveLossBreaker => "consecutive_loss_breaker",
            Self::SymbolConcentration => "symbol_concentration",
            Self::SectorConcentration => "sector_concentration",
            Self::CorrelatedExposure => "correlated_exposure",
            Self::NoReferencePrice => "no_reference_price",
            Self::NoPosition => "no_position",
            Self::ZeroQuantity => "zero_quantity",
            Self::InvalidQuantity => "invalid_quantity",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed check: code plus explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionReason {
    /// Machine-readable code.
    pub code: RejectionCode,
    /// Human-readable explanation.
    pub message: String,
}

impl RejectionReason {
    /// Create a reason.
    #[must_use]
    pub fn new(code: RejectionCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// All reasons a signal was rejected, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Symbol of the rejected signal.
    pub symbol: String,
    /// Ordered reasons; never empty.
    pub reasons: Vec<RejectionReason>,
}

impl Rejection {
    /// Codes in evaluation order.
    #[must_use]
    pub fn codes(&self) -> Vec<RejectionCode> {
        self.reasons.iter().map(|r| r.code).collect()
    }

    /// Whether a particular code is present.
    #[must_use]
    pub fn has(&self, code: RejectionCode) -> bool {
        self.reasons.iter().any(|r| r.code == code)
    }
}

/// An approved order skeleton.
///
/// Only the risk gate can construct one; the lifecycle turns it into an
/// [`Order`](super::Order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    symbol: String,
    side: OrderSide,
    quantity: Decimal,
    order_type: OrderType,
    reference_price: Decimal,
    strategy_id: String,
    signal_timestamp: DateTime<Utc>,
    scaled_down: bool,
}

impl OrderIntent {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        order_type: OrderType,
        reference_price: Decimal,
        strategy_id: impl Into<String>,
        signal_timestamp: DateTime<Utc>,
        scaled_down: bool,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type,
            reference_price,
            strategy_id: strategy_id.into(),
            signal_timestamp,
            scaled_down,
        }
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

    /// Approved quantity (always positive).
    #[must_use]
    pub const fn quantity(&self) -> Decimal {
        self.quantity
    }

    /// Order type.
    #[must_use]
    pub const fn order_type(&self) -> OrderType {
        self.order_type
    }

    /// Price the quantity was sized against.
    #[must_use]
    pub const fn reference_price(&self) -> Decimal {
        self.reference_price
    }

    /// Producing strategy.
    #[must_use]
    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    /// Timestamp of the triggering signal.
    #[must_use]
    pub const fn signal_timestamp(&self) -> DateTime<Utc> {
        self.signal_timestamp
    }

    /// Whether a concentration limit reduced the sized quantity.
    #[must_use]
    pub const fn scaled_down(&self) -> bool {
        self.scaled_down
    }
}

/// Output of the risk gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RiskDecision {
    /// Signal passed every check.
    Approved(OrderIntent),
    /// Signal failed one or more checks.
    Rejected(Rejection),
}

impl RiskDecision {
    pub(crate) fn reject(symbol: impl Into<String>, reasons: Vec<RejectionReason>) -> Self {
        Self::Rejected(Rejection {
            symbol: symbol.into(),
            reasons,
        })
    }

    /// Returns true if approved.
    #[must_use]
    pub const fn is_approved(&self) -> bool {
        matches!(self, Self::Approved(_))
    }

    /// The approved intent, if any.
    #[must_use]
    pub const fn intent(&self) -> Option<&OrderIntent> {
        match self {
            Self::Approved(intent) => Some(intent),
            Self::Rejected(_) => None,
        }
    }

    /// The rejection, if any.
    #[must_use]
    pub const fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Approved(_) => None,
            Self::Rejected(rejection) => Some(rejection),
        }
    }

    /// Rejection codes in order (empty when approved).
    #[must_use]
    pub fn reason_codes(&self) -> Vec<RejectionCode> {
        self.rejection().map(Rejection::codes).unwrap_or_default()
    }
}
