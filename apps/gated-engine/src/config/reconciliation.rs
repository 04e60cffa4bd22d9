//! Reconciliation trigger and tolerance settings.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Run reconciliation in live and paper modes.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between runs (0 disables the interval trigger).
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Run after this many fills (`null` disables the fill trigger).
    #[serde(default = "default_every_n_fills")]
    pub every_n_fills: Option<u32>,
    /// Position tolerance in units.
    #[serde(default)]
    pub position_tolerance: Decimal,
    /// Cash tolerance in currency units.
    #[serde(default = "default_cash_tolerance")]
    pub cash_tolerance: Decimal,
    /// Portfolio value tolerance in percent.
    #[serde(default = "default_value_tolerance_pct")]
    pub value_tolerance_pct: Decimal,
    /// Portfolio value drift in percent treated as severe.
    #[serde(default = "default_severe_value_pct")]
    pub severe_value_pct: Decimal,
    /// Position drift in units treated as severe (`null` disables).
    #[serde(default)]
    pub severe_position_units: Option<Decimal>,
    /// Trip the kill switch on severe drift.
    #[serde(default = "default_halt_on_severe")]
    pub halt_on_severe: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            every_n_fills: default_every_n_fills(),
            position_tolerance: Decimal::ZERO,
            cash_tolerance: default_cash_tolerance(),
            value_tolerance_pct: default_value_tolerance_pct(),
            severe_value_pct: default_severe_value_pct(),
            severe_position_units: None,
            halt_on_severe: default_halt_on_severe(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

const fn default_interval_secs() -> u64 {
    300
}

const fn default_every_n_fills() -> Option<u32> {
    Some(10)
}

fn default_cash_tolerance() -> Decimal {
    dec!(1.00)
}

fn default_value_tolerance_pct() -> Decimal {
    dec!(0.5)
}

fn default_severe_value_pct() -> Decimal {
    dec!(5)
}

const fn default_halt_on_severe() -> bool {
    true
}
