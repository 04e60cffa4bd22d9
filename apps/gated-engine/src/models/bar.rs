//! OHLCV bars delivered by the data feed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{TimestampIssue, parse_aware_timestamp};

/// Bar parsing and data-quality errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarError {
    /// Timestamp carries no timezone.
    #[error("bar timestamp '{input}' has no timezone offset")]
    NaiveTimestamp {
        /// The raw timestamp.
        input: String,
    },

    /// Timestamp could not be parsed.
    #[error("bar timestamp '{input}' is invalid: {reason}")]
    InvalidTimestamp {
        /// The raw timestamp.
        input: String,
        /// Parser message.
        reason: String,
    },

    /// A price field is zero or negative.
    #[error("{symbol}: {field} price {value} is not positive")]
    NonPositivePrice {
        /// Symbol.
        symbol: String,
        /// Which price field.
        field: &'static str,
        /// The offending value.
        value: Decimal,
    },

    /// High/low do not bracket open and close.
    #[error("{symbol}: inconsistent range (high {high}, low {low})")]
    InconsistentRange {
        /// Symbol.
        symbol: String,
        /// Reported high.
        high: Decimal,
        /// Reported low.
        low: Decimal,
    },

    /// Volume is negative.
    #[error("{symbol}: negative volume {volume}")]
    NegativeVolume {
        /// Symbol.
        symbol: String,
        /// The offending volume.
        volume: Decimal,
    },

    /// Bar does not advance past the previous bar for the symbol.
    #[error("{symbol}: bar at {current} does not follow previous bar at {previous}")]
    OutOfOrder {
        /// Symbol.
        symbol: String,
        /// Timestamp of the last accepted bar.
        previous: DateTime<Utc>,
        /// Timestamp of this bar.
        current: DateTime<Utc>,
    },
}

/// One OHLCV bar for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBar")]
pub struct Bar {
    /// Symbol.
    pub symbol: String,
    /// Bar timestamp (always UTC-normalized).
    pub timestamp: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Volume.
    pub volume: Decimal,
}

impl Bar {
    /// Create a new bar.
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Parse a feed timestamp, rejecting naive values.
    pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, BarError> {
        parse_aware_timestamp(input).map_err(|issue| match issue {
            TimestampIssue::Naive => BarError::NaiveTimestamp {
                input: input.to_string(),
            },
            TimestampIssue::Unparseable(reason) => BarError::InvalidTimestamp {
                input: input.to_string(),
                reason,
            },
        })
    }

    /// Check the bar's internal consistency.
    ///
    /// Ordering against previous bars is checked by the pipeline, which
    /// knows the per-symbol history.
    pub fn validate(&self) -> Result<(), BarError> {
        for (field, value) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ] {
            if value <= Decimal::ZERO {
                return Err(BarError::NonPositivePrice {
                    symbol: self.symbol.clone(),
                    field,
                    value,
                });
            }
        }

        let brackets = self.high >= self.low
            && self.open <= self.high
            && self.open >= self.low
            && self.close <= self.high
            && self.close >= self.low;
        if !brackets {
            return Err(BarError::InconsistentRange {
                symbol: self.symbol.clone(),
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < Decimal::ZERO {
            return Err(BarError::NegativeVolume {
                symbol: self.symbol.clone(),
                volume: self.volume,
            });
        }

        Ok(())
    }
}

#[derive(Deserialize)]
struct RawBar {
    symbol: String,
    timestamp: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    #[serde(default)]
    volume: Decimal,
}

impl TryFrom<RawBar> for Bar {
    type Error = BarError;

    fn try_from(raw: RawBar) -> Result<Self, Self::Error> {
        let timestamp = Self::parse_timestamp(&raw.timestamp)?;
        Ok(Self::new(
            raw.symbol, timestamp, raw.open, raw.high, raw.low, raw.close, raw.volume,
        ))
    }
}
