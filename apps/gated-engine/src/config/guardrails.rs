//! Operational guardrails and the trading session window.

use serde::{Deserialize, Serialize};

/// Guardrail thresholds. Count limits are disabled when set to `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Orders allowed per trading day (session-local date, UTC without a session).
    #[serde(default = "default_max_daily_orders")]
    pub max_daily_orders: Option<u32>,
    /// Order rejects tolerated in the trailing hour.
    #[serde(default = "default_max_rejects_per_hour")]
    pub max_rejects_per_hour: Option<u32>,
    /// Seconds a symbol is blocked after an order reject (0 disables).
    #[serde(default = "default_symbol_cooldown_secs")]
    pub symbol_cooldown_secs: u64,
    /// Consecutive order rejects that stop trading and trip the kill switch.
    #[serde(default = "default_max_consecutive_rejects")]
    pub max_consecutive_rejects: Option<u32>,
    /// Trading session; signals outside it are rejected. Absent means always open.
    #[serde(default)]
    pub session: Option<SessionConfig>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_daily_orders: default_max_daily_orders(),
            max_rejects_per_hour: default_max_rejects_per_hour(),
            symbol_cooldown_secs: default_symbol_cooldown_secs(),
            max_consecutive_rejects: default_max_consecutive_rejects(),
            session: None,
        }
    }
}

const fn default_max_daily_orders() -> Option<u32> {
    Some(100)
}

const fn default_max_rejects_per_hour() -> Option<u32> {
    Some(10)
}

const fn default_symbol_cooldown_secs() -> u64 {
    300
}

const fn default_max_consecutive_rejects() -> Option<u32> {
    Some(5)
}

/// Exchange-local trading hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// IANA timezone name, e.g. `America/New_York`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Session open, `HH:MM` local time.
    #[serde(default = "default_open")]
    pub open: String,
    /// Session close, `HH:MM` local time.
    #[serde(default = "default_close")]
    pub close: String,
    /// Only trade Monday through Friday.
    #[serde(default = "default_weekdays_only")]
    pub weekdays_only: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            open: default_open(),
            close: default_close(),
            weekdays_only: default_weekdays_only(),
        }
    }
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_open() -> String {
    "09:30".to_string()
}

fn default_close() -> String {
    "16:00".to_string()
}

const fn default_weekdays_only() -> bool {
    true
}
