//! Trading signals produced by strategies.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{TimestampIssue, parse_aware_timestamp};

/// What the strategy wants done with the symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Open or add to a long position.
    Long,
    /// Open or add to a short position.
    Short,
    /// Flatten the existing position.
    Close,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Signal construction errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalError {
    /// Strength outside `[0.0, 1.0]` (or NaN).
    #[error("signal strength {strength} is outside [0.0, 1.0]")]
    StrengthOutOfRange {
        /// The rejected strength.
        strength: f64,
    },

    /// Timestamp carries no timezone.
    #[error("signal timestamp '{input}' has no timezone offset")]
    NaiveTimestamp {
        /// The raw timestamp.
        input: String,
    },

    /// Timestamp could not be parsed.
    #[error("signal timestamp '{input}' is invalid: {reason}")]
    InvalidTimestamp {
        /// The raw timestamp.
        input: String,
        /// Parser message.
        reason: String,
    },

    /// Symbol is empty.
    #[error("signal symbol is empty")]
    EmptySymbol,
}

/// A strategy's trade recommendation.
///
/// Immutable once built. Construction enforces the strength range and a
/// timezone-aware timestamp, so an invalid signal never reaches the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSignal")]
pub struct Signal {
    symbol: String,
    direction: Direction,
    strength: f64,
    timestamp: DateTime<Utc>,
    strategy_id: String,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl Signal {
    /// Create a new signal.
    pub fn new(
        symbol: impl Into<String>,
        direction: Direction,
        strength: f64,
        timestamp: DateTime<Utc>,
        strategy_id: impl Into<String>,
    ) -> Result<Self, SignalError> {
        let symbol = symbol.into();
        if symbol.trim().is_empty() {
            return Err(SignalError::EmptySymbol);
        }
        // NaN fails `contains` as well.
        if !(0.0..=1.0).contains(&strength) {
            return Err(SignalError::StrengthOutOfRange { strength });
        }

        Ok(Self {
            symbol,
            direction,
            strength,
            timestamp,
            strategy_id: strategy_id.into(),
            metadata: BTreeMap::new(),
        })
    }

    /// Create a signal from an RFC 3339 timestamp string.
    pub fn from_rfc3339(
        symbol: impl Into<String>,
        direction: Direction,
        strength: f64,
        timestamp: &str,
        strategy_id: impl Into<String>,
    ) -> Result<Self, SignalError> {
        let parsed = parse_aware_timestamp(timestamp).map_err(|issue| match issue {
            TimestampIssue::Naive => SignalError::NaiveTimestamp {
                input: timestamp.to_string(),
            },
            TimestampIssue::Unparseable(reason) => SignalError::InvalidTimestamp {
                input: timestamp.to_string(),
                reason,
            },
        })?;
        Self::new(symbol, direction, strength, parsed, strategy_id)
    }

    /// Attach an opaque metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Symbol the signal is for.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Requested direction.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Confidence in `[0.0, 1.0]`.
    #[must_use]
    pub const fn strength(&self) -> f64 {
        self.strength
    }

    /// When the signal was produced.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Producing strategy.
    #[must_use]
    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    /// Opaque metadata.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }
}

#[derive(Deserialize)]
struct RawSignal {
    symbol: String,
    direction: Direction,
    strength: f64,
    timestamp: String,
    strategy_id: String,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<RawSignal> for Signal {
    type Error = SignalError;

    fn try_from(raw: RawSignal) -> Result<Self, Self::Error> {
        let mut signal = Self::from_rfc3339(
            raw.symbol,
            raw.direction,
            raw.strength,
            &raw.timestamp,
            raw.strategy_id,
        )?;
        signal.metadata = raw.metadata;
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use test_case::test_case;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap()
    }

    #[test_case(0.0 ; "zero")]
    #[test_case(0.5 ; "middle")]
    #[test_case(1.0 ; "one")]
    fn accepts_strength_in_range(strength: f64) {
        let signal = Signal::new("AAPL", Direction::Long, strength, ts(), "sma").unwrap();
        assert_eq!(signal.strength(), strength);
    }

    #[test_case(1.5 ; "above one")]
    #[test_case(-0.1 ; "negative")]
    #[test_case(f64::NAN ; "nan")]
    #[test_case(f64::INFINITY ; "infinite")]
    fn rejects_strength_out_of_range(strength: f64) {
        let result = Signal::new("AAPL", Direction::Long, strength, ts(), "sma");
        assert!(matches!(
            result,
            Err(SignalError::StrengthOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_naive_timestamp_string() {
        let result = Signal::from_rfc3339("AAPL", Direction::Long, 0.5, "2024-03-01T15:00:00", "sma");
        assert_eq!(
            result,
            Err(SignalError::NaiveTimestamp {
                input: "2024-03-01T15:00:00".to_string()
            })
        );
    }

    #[test]
    fn rejects_empty_symbol() {
        let result = Signal::new("  ", Direction::Short, 0.5, ts(), "sma");
        assert_eq!(result, Err(SignalError::EmptySymbol));
    }

    #[test]
    fn deserialization_validates() {
        let ok = r#"{"symbol":"MSFT","direction":"short","strength":0.25,
            "timestamp":"2024-03-01T15:00:00Z","strategy_id":"x","metadata":{"k":1}}"#;
        let signal: Signal = serde_json::from_str(ok).unwrap();
        assert_eq!(signal.direction(), Direction::Short);
        assert_eq!(signal.metadata()["k"], serde_json::json!(1));

        let bad = r#"{"symbol":"MSFT","direction":"long","strength":1.5,
            "timestamp":"2024-03-01T15:00:00Z","strategy_id":"x"}"#;
        assert!(serde_json::from_str::<Signal>(bad).is_err());
    }
}
