//! Engine mode, broker selection, backtest and kill switch settings.

use std::fmt;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// How the engine is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Deterministic historical replay.
    #[default]
    Backtest,
    /// Live loop against a paper broker.
    Paper,
    /// Live loop against a real venue.
    Live,
}

impl EngineMode {
    /// Returns true for backtest mode.
    #[must_use]
    pub const fn is_backtest(&self) -> bool {
        matches!(self, Self::Backtest)
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backtest => write!(f, "BACKTEST"),
            Self::Paper => write!(f, "PAPER"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Driving mode.
    #[serde(default)]
    pub mode: EngineMode,
    /// Currency cash is held in.
    #[serde(default = "default_base_currency")]
    pub base_currency: String,
    /// Starting cash balance.
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::default(),
            base_currency: default_base_currency(),
            initial_cash: default_initial_cash(),
        }
    }
}

fn default_base_currency() -> String {
    "USD".to_string()
}

fn default_initial_cash() -> Decimal {
    dec!(100000)
}

/// Broker adapter variants selectable at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process simulated broker.
    #[default]
    Paper,
}

/// Broker selection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrokerConfig {
    /// Adapter to build.
    #[serde(default)]
    pub kind: BrokerKind,
    /// Paper adapter settings.
    #[serde(default)]
    pub paper: PaperBrokerConfig,
}

/// Paper broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperBrokerConfig {
    /// Status polls needed to fill an order completely.
    #[serde(default = "default_fill_slices")]
    pub fill_slices: u32,
    /// Commission charged per share.
    #[serde(default)]
    pub commission_per_share: Decimal,
}

impl Default for PaperBrokerConfig {
    fn default() -> Self {
        Self {
            fill_slices: default_fill_slices(),
            commission_per_share: Decimal::ZERO,
        }
    }
}

const fn default_fill_slices() -> u32 {
    1
}

/// Backtest settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BacktestConfig {
    /// Commission charged per simulated share.
    #[serde(default)]
    pub commission_per_share: Decimal,
}

/// Kill switch persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    /// File the circuit state is persisted to.
    #[serde(default = "default_state_path")]
    pub state_path: String,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
        }
    }
}

fn default_state_path() -> String {
    "state/kill_switch.json".to_string()
}
