//! Reconciliation result types.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::broker::BrokerOrderStatus;
use crate::models::{BrokerOrderId, OrderId, OrderState};

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Every category within tolerance.
    Clean,
    /// Some drift, below the severe thresholds.
    Drift,
    /// Drift beyond the severe thresholds.
    Severe,
}

impl Severity {
    /// Lowercase label for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Drift => "drift",
            Self::Severe => "severe",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "CLEAN"),
            Self::Drift => write!(f, "DRIFT"),
            Self::Severe => write!(f, "SEVERE"),
        }
    }
}

/// Per-symbol position comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionDelta {
    /// Symbol.
    pub symbol: String,
    /// Engine's signed quantity.
    pub internal: Decimal,
    /// Broker's signed quantity.
    pub broker: Decimal,
    /// `internal - broker`.
    pub delta: Decimal,
    /// Whether `|delta|` is within tolerance.
    pub within_tolerance: bool,
}

/// Kind of lifecycle disagreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MismatchKind {
    /// Engine believes open; broker reports a different status.
    MissedTransition,
    /// Closed locally by timeout; broker still has it open.
    OpenAtBroker,
    /// Closed locally by timeout; broker confirms closed.
    ConfirmedClosed,
    /// Broker has an open order the engine does not know.
    UnknownAtBroker,
    /// Engine believes open; broker has no record.
    MissingAtBroker,
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissedTransition => write!(f, "MISSED_TRANSITION"),
            Self::OpenAtBroker => write!(f, "OPEN_AT_BROKER"),
            Self::ConfirmedClosed => write!(f, "CONFIRMED_CLOSED"),
            Self::UnknownAtBroker => write!(f, "UNKNOWN_AT_BROKER"),
            Self::MissingAtBroker => write!(f, "MISSING_AT_BROKER"),
        }
    }
}

/// One lifecycle disagreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMismatch {
    /// Kind.
    pub kind: MismatchKind,
    /// Engine order, if known.
    pub order_id: Option<OrderId>,
    /// Broker order.
    pub broker_order_id: BrokerOrderId,
    /// Engine state before reconciliation.
    pub local_state: Option<OrderState>,
    /// Broker's status, if reported.
    pub broker_status: Option<BrokerOrderStatus>,
    /// Engine state after adopting broker truth.
    pub resolved_state: Option<OrderState>,
}

impl OrderMismatch {
    /// Whether the mismatch is drift (a confirmation is not).
    #[must_use]
    pub const fn is_drift(&self) -> bool {
        !matches!(self.kind, MismatchKind::ConfirmedClosed)
    }
}

/// Write-once record of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    /// When the run happened.
    pub timestamp: DateTime<Utc>,
    /// Position comparison for every symbol held on either side.
    pub position_deltas: Vec<PositionDelta>,
    /// Engine cash.
    pub internal_cash: Decimal,
    /// Broker cash.
    pub broker_cash: Decimal,
    /// `internal_cash - broker_cash`.
    pub cash_delta: Decimal,
    /// Engine portfolio value.
    pub internal_value: Decimal,
    /// Broker portfolio value at the same marks.
    pub broker_value: Decimal,
    /// `|internal - broker| / broker × 100`.
    pub value_delta_pct: Decimal,
    /// Positions within tolerance.
    pub positions_pass: bool,
    /// Cash within tolerance.
    pub cash_pass: bool,
    /// Value within tolerance.
    pub value_pass: bool,
    /// No lifecycle drift.
    pub orders_pass: bool,
    /// Lifecycle disagreements found (and resolutions applied).
    pub order_mismatches: Vec<OrderMismatch>,
    /// Overall verdict.
    pub severity: Severity,
    /// Human-readable explanations of every failing category.
    pub reasons: Vec<String>,
}

impl ReconciliationResult {
    /// Whether every category passed.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.positions_pass && self.cash_pass && self.value_pass && self.orders_pass
    }

    /// Delta for one symbol.
    #[must_use]
    pub fn position_delta(&self, symbol: &str) -> Option<&PositionDelta> {
        self.position_deltas.iter().find(|d| d.symbol == symbol)
    }

    /// Pass/fail verdicts only, for comparing runs.
    #[must_use]
    pub const fn verdicts(&self) -> (bool, bool, bool, bool, Severity) {
        (
            self.positions_pass,
            self.cash_pass,
            self.value_pass,
            self.orders_pass,
            self.severity,
        )
    }
}
