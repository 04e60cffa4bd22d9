//! Exchange-local trading session window.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

use crate::config::{ConfigError, GuardrailConfig, SessionConfig};

/// A parsed session: local open/close times in an IANA timezone.
///
/// `close` before `open` describes an overnight session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    timezone: Tz,
    open: NaiveTime,
    close: NaiveTime,
    weekdays_only: bool,
}

impl SessionWindow {
    /// Parse a session from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an unknown timezone, an
    /// unparsable time, or an empty window.
    pub fn from_config(config: &SessionConfig) -> Result<Self, ConfigError> {
        let timezone: Tz = config.timezone.parse().map_err(|_| {
            ConfigError::ValidationError(format!(
                "guardrails.session.timezone '{}' is not a known timezone",
                config.timezone
            ))
        })?;
        let open = parse_time("open", &config.open)?;
        let close = parse_time("close", &config.close)?;
        if open == close {
            return Err(ConfigError::ValidationError(
                "guardrails.session open and close must differ".to_string(),
            ));
        }
        Ok(Self {
            timezone,
            open,
            close,
            weekdays_only: config.weekdays_only,
        })
    }

    /// Whether `at` falls inside the session.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.timezone);
        if self.weekdays_only && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let time = local.time();
        if self.open < self.close {
            time >= self.open && time < self.close
        } else {
            time >= self.open || time < self.close
        }
    }

    /// Session timezone.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Calendar the session's daily counters roll over on.
    #[must_use]
    pub fn trading_day(&self) -> TradingDay {
        TradingDay {
            timezone: self.timezone,
            rollover: (self.close < self.open).then_some(self.open),
        }
    }
}

/// Maps instants to the trading day daily limits and daily P&L key on.
///
/// Days follow the session's local calendar. An overnight session belongs
/// to the day it closes on, so instants from its open onwards count toward
/// the next date. Without a session the day is the UTC date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingDay {
    timezone: Tz,
    rollover: Option<NaiveTime>,
}

impl Default for TradingDay {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            rollover: None,
        }
    }
}

impl TradingDay {
    /// Trading day for the configured session, UTC dates when there is none.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an invalid session.
    pub fn from_config(config: &GuardrailConfig) -> Result<Self, ConfigError> {
        config
            .session
            .as_ref()
            .map_or(Ok(Self::default()), |s| Ok(SessionWindow::from_config(s)?.trading_day()))
    }

    /// Trading date `at` belongs to.
    #[must_use]
    pub fn of(&self, at: DateTime<Utc>) -> NaiveDate {
        let local = at.with_timezone(&self.timezone);
        let date = local.date_naive();
        match self.rollover {
            Some(open) if local.time() >= open => date.checked_add_days(Days::new(1)).unwrap_or(date),
            _ => date,
        }
    }
}

fn parse_time(field: &str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| {
        ConfigError::ValidationError(format!(
            "guardrails.session.{field} '{value}' is not HH:MM: {e}"
        ))
    })
}
