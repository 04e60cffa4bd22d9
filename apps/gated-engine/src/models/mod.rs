//! Core domain models for the engine.
//!
//! Signals come in from strategies, bars come in from the data feed, and
//! orders are produced only by the risk gate's approved intents.

mod bar;
mod decision;
mod order;
mod signal;

pub use bar::{Bar, BarError};
pub use decision::{OrderIntent, Rejection, RejectionCode, RejectionReason, RiskDecision};
pub use order::{BrokerOrderId, Order, OrderId, OrderSide, OrderState, OrderType};
pub use signal::{Direction, Signal, SignalError};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Why a timestamp string could not be accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimestampIssue {
    /// Parsed as a date/time but carries no offset.
    Naive,
    /// Not a recognizable timestamp at all.
    Unparseable(String),
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse an RFC 3339 timestamp, refusing anything without an offset.
pub(crate) fn parse_aware_timestamp(input: &str) -> Result<DateTime<Utc>, TimestampIssue> {
    let trimmed = input.trim();
    match DateTime::parse_from_rfc3339(trimmed) {
        Ok(parsed) => Ok(parsed.with_timezone(&Utc)),
        Err(err) => {
            let naive = NAIVE_FORMATS
                .iter()
                .any(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).is_ok())
                || NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_ok();
            if naive {
                Err(TimestampIssue::Naive)
            } else {
                Err(TimestampIssue::Unparseable(err.to_string()))
            }
        }
    }
}
