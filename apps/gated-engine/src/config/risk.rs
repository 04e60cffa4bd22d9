//! Risk gate limits: sizing, value-at-risk, circuit breakers, concentration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Risk gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of portfolio value a full-strength signal may commit.
    #[serde(default = "default_max_position_fraction")]
    pub max_position_fraction: Decimal,
    /// Value-at-risk gate.
    #[serde(default)]
    pub var: VarConfig,
    /// Loss-based circuit breakers.
    #[serde(default)]
    pub circuit_breakers: CircuitBreakerConfig,
    /// Concentration limits.
    #[serde(default)]
    pub concentration: ConcentrationConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_fraction: default_max_position_fraction(),
            var: VarConfig::default(),
            circuit_breakers: CircuitBreakerConfig::default(),
            concentration: ConcentrationConfig::default(),
        }
    }
}

fn default_max_position_fraction() -> Decimal {
    dec!(0.10)
}

/// Historical-simulation value-at-risk settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarConfig {
    /// Enable the gate.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Confidence level of the one-day loss estimate.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Rolling window of daily returns.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Fewest observations the estimate is computed from.
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
    /// Largest acceptable loss estimate as a fraction of portfolio value.
    #[serde(default = "default_max_var_fraction")]
    pub max_var_fraction: Decimal,
    /// Reject when history is too short instead of skipping the check.
    #[serde(default)]
    pub require_history: bool,
}

impl Default for VarConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence: default_confidence(),
            window: default_window(),
            min_observations: default_min_observations(),
            max_var_fraction: default_max_var_fraction(),
            require_history: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_confidence() -> f64 {
    0.95
}

const fn default_window() -> usize {
    252
}

const fn default_min_observations() -> usize {
    20
}

fn default_max_var_fraction() -> Decimal {
    dec!(0.05)
}

/// Circuit breakers. Each limit is disabled when set to `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Largest tolerated decline from the equity high-water mark.
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown_fraction: Option<Decimal>,
    /// Largest tolerated loss since the start of the day, as a fraction of day-start equity.
    #[serde(default = "default_intraday_loss")]
    pub intraday_loss_fraction: Option<Decimal>,
    /// Losing trades in a row before new entries stop.
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: Option<u32>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_drawdown_fraction: default_max_drawdown(),
            intraday_loss_fraction: default_intraday_loss(),
            max_consecutive_losses: default_max_consecutive_losses(),
        }
    }
}

fn default_max_drawdown() -> Option<Decimal> {
    Some(dec!(0.20))
}

fn default_intraday_loss() -> Option<Decimal> {
    Some(dec!(0.05))
}

const fn default_max_consecutive_losses() -> Option<u32> {
    Some(5)
}

/// What to do when a concentration limit would be breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcentrationMode {
    /// Reject the signal.
    #[default]
    Reject,
    /// Shrink the order to the largest compliant quantity.
    ScaleDown,
}

/// Exposure concentration limits, as fractions of portfolio value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentrationConfig {
    /// Largest single-symbol exposure.
    #[serde(default = "default_max_symbol_fraction")]
    pub max_symbol_fraction: Decimal,
    /// Largest single-sector exposure.
    #[serde(default = "default_max_sector_fraction")]
    pub max_sector_fraction: Decimal,
    /// Largest exposure to a symbol plus everything correlated with it.
    #[serde(default = "default_max_correlated_fraction")]
    pub max_correlated_fraction: Decimal,
    /// Breach handling.
    #[serde(default)]
    pub mode: ConcentrationMode,
}

impl Default for ConcentrationConfig {
    fn default() -> Self {
        Self {
            max_symbol_fraction: default_max_symbol_fraction(),
            max_sector_fraction: default_max_sector_fraction(),
            max_correlated_fraction: default_max_correlated_fraction(),
            mode: ConcentrationMode::default(),
        }
    }
}

fn default_max_symbol_fraction() -> Decimal {
    dec!(0.25)
}

fn default_max_sector_fraction() -> Decimal {
    dec!(0.40)
}

fn default_max_correlated_fraction() -> Decimal {
    dec!(0.50)
}
