//! Configuration loading, validation and environment variable interpolation.
//!
//! One YAML document configures a run. Every section is optional and falls
//! back to defaults, and values are fixed for the lifetime of the process.
//!
//! # Usage
//!
//! ```rust,ignore
//! use gated_engine::config::load_config;
//!
//! // Load from the default path (config.yaml)
//! let config = load_config(None)?;
//!
//! println!("max position fraction: {}", config.risk.max_position_fraction);
//! ```

mod correlation;
mod engine;
mod guardrails;
mod lifecycle;
mod live;
mod observability;
mod reconciliation;
mod resilience;
mod risk;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use correlation::{CorrelationConfig, CorrelationPair};
pub use engine::{
    BacktestConfig, BrokerConfig, BrokerKind, EngineConfig, EngineMode, KillSwitchConfig,
    PaperBrokerConfig,
};
pub use guardrails::{GuardrailConfig, SessionConfig};
pub use lifecycle::{LifecycleConfig, MIN_NOT_FILLED_TIMEOUT_SECS};
pub use live::LiveConfig;
pub use observability::{LoggingConfig, MetricsConfig, ObservabilityConfig};
pub use reconciliation::ReconciliationConfig;
pub use resilience::ResilienceConfig;
pub use risk::{CircuitBreakerConfig, ConcentrationConfig, ConcentrationMode, RiskConfig, VarConfig};

use crate::risk::SessionWindow;

/// Longest accepted timeout, cooldown or interval: one leap year.
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 60 * 60;

/// Whole seconds as a chrono duration, saturating instead of overflowing.
#[must_use]
pub fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Mode, currency and starting cash.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Sizing, value-at-risk, circuit breakers and concentration.
    #[serde(default)]
    pub risk: RiskConfig,
    /// Operational guardrails.
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    /// Sector map and correlation table.
    #[serde(default)]
    pub correlation: CorrelationConfig,
    /// Broker retry and failure limits.
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Order timeouts.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Reconciliation cadence and tolerances.
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Live loop cadence.
    #[serde(default)]
    pub live: LiveConfig,
    /// Backtest simulation.
    #[serde(default)]
    pub backtest: BacktestConfig,
    /// Kill switch persistence.
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,
    /// Broker adapter selection.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================
// Configuration Loading
// ============================================

/// Load configuration from a YAML file with environment variable interpolation.
///
/// # Arguments
///
/// * `path` - Optional path to the config file. Defaults to "config.yaml".
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or("config.yaml");

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_string(),
        source: e,
    })?;

    load_config_from_string(&contents)
}

/// Load configuration from a YAML string.
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax.
#[allow(clippy::expect_used)] // Regex is compile-time constant
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map(|m| m.as_str());
        match cap.get(1).map(|m| std::env::var(m.as_str())) {
            Some(Ok(v)) if !v.is_empty() => v,
            _ => default_value.map_or_else(String::new, str::to_string),
        }
    })
    .into_owned()
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

fn check_fraction(name: &str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO || value > Decimal::ONE {
        return Err(invalid(format!("{name} must be in (0, 1], got {value}")));
    }
    Ok(())
}

fn check_duration(name: &str, secs: u64) -> Result<(), ConfigError> {
    if secs > MAX_DURATION_SECS {
        return Err(invalid(format!(
            "{name} must not exceed {MAX_DURATION_SECS} seconds, got {secs}"
        )));
    }
    Ok(())
}

fn check_non_negative(name: &str, value: Decimal) -> Result<(), ConfigError> {
    if value < Decimal::ZERO {
        return Err(invalid(format!("{name} must not be negative, got {value}")));
    }
    Ok(())
}

/// Validate configuration values.
fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.engine.initial_cash < Decimal::ZERO {
        return Err(invalid("engine.initial_cash must not be negative"));
    }
    if config.engine.base_currency.trim().is_empty() {
        return Err(invalid("engine.base_currency must not be empty"));
    }

    validate_risk(&config.risk)?;

    if let Some(session) = &config.guardrails.session {
        SessionWindow::from_config(session)?;
    }
    check_duration("guardrails.symbol_cooldown_secs", config.guardrails.symbol_cooldown_secs)?;

    let corr = &config.correlation;
    if !(0.0..=1.0).contains(&corr.threshold) {
        return Err(invalid("correlation.threshold must be between 0.0 and 1.0"));
    }
    if let Some(pair) = corr.pairs.iter().find(|p| !(-1.0..=1.0).contains(&p.rho)) {
        return Err(invalid(format!(
            "correlation between {} and {} must be between -1.0 and 1.0",
            pair.a, pair.b
        )));
    }

    let res = &config.resilience;
    if res.failure_limit == 0 {
        return Err(invalid("resilience.failure_limit must be at least 1"));
    }
    if res.backoff_multiplier < 1.0 {
        return Err(invalid("resilience.backoff_multiplier must be at least 1.0"));
    }
    if !(0.0..=1.0).contains(&res.jitter_factor) {
        return Err(invalid("resilience.jitter_factor must be between 0.0 and 1.0"));
    }
    if res.initial_backoff_ms > res.max_backoff_ms {
        return Err(invalid(
            "resilience.initial_backoff_ms must not exceed max_backoff_ms",
        ));
    }
    if res.call_timeout_ms == 0 {
        return Err(invalid("resilience.call_timeout_ms must be positive"));
    }

    let life = &config.lifecycle;
    if life.not_filled_timeout_secs < MIN_NOT_FILLED_TIMEOUT_SECS {
        return Err(invalid(format!(
            "lifecycle.not_filled_timeout_secs must be at least {MIN_NOT_FILLED_TIMEOUT_SECS}, got {}",
            life.not_filled_timeout_secs
        )));
    }
    if life.max_open_secs < life.not_filled_timeout_secs {
        return Err(invalid(
            "lifecycle.max_open_secs must not be shorter than not_filled_timeout_secs",
        ));
    }
    check_duration("lifecycle.not_filled_timeout_secs", life.not_filled_timeout_secs)?;
    check_duration("lifecycle.max_open_secs", life.max_open_secs)?;

    let rec = &config.reconciliation;
    check_non_negative("reconciliation.position_tolerance", rec.position_tolerance)?;
    check_non_negative("reconciliation.cash_tolerance", rec.cash_tolerance)?;
    check_non_negative("reconciliation.value_tolerance_pct", rec.value_tolerance_pct)?;
    if rec.severe_value_pct < rec.value_tolerance_pct {
        return Err(invalid(
            "reconciliation.severe_value_pct must not be below value_tolerance_pct",
        ));
    }
    if rec.every_n_fills == Some(0) {
        return Err(invalid("reconciliation.every_n_fills must be at least 1"));
    }
    check_duration("reconciliation.interval_secs", rec.interval_secs)?;

    let live = &config.live;
    if live.fill_poll_interval_ms == 0 || live.heartbeat_interval_ms == 0 {
        return Err(invalid("live poll and heartbeat intervals must be positive"));
    }
    if live.max_feed_failures == 0 {
        return Err(invalid("live.max_feed_failures must be at least 1"));
    }
    check_duration("live.silence_timeout_secs", live.silence_timeout_secs)?;
    if live.history_limit == 0 {
        return Err(invalid("live.history_limit must be at least 1"));
    }

    check_non_negative(
        "backtest.commission_per_share",
        config.backtest.commission_per_share,
    )?;
    if config.broker.paper.fill_slices == 0 {
        return Err(invalid("broker.paper.fill_slices must be at least 1"));
    }
    if config.kill_switch.state_path.trim().is_empty() {
        return Err(invalid("kill_switch.state_path must not be empty"));
    }

    let valid_formats = ["json", "compact", "pretty"];
    if !valid_formats.contains(&config.observability.logging.format.as_str()) {
        return Err(invalid(format!(
            "observability.logging.format must be one of: {valid_formats:?}"
        )));
    }

    Ok(())
}

fn validate_risk(risk: &RiskConfig) -> Result<(), ConfigError> {
    check_fraction("risk.max_position_fraction", risk.max_position_fraction)?;

    let var = &risk.var;
    if !(var.confidence > 0.0 && var.confidence < 1.0) {
        return Err(invalid("risk.var.confidence must be between 0.0 and 1.0 (exclusive)"));
    }
    if var.window < 2 {
        return Err(invalid("risk.var.window must be at least 2"));
    }
    if var.min_observations == 0 || var.min_observations > var.window {
        return Err(invalid(
            "risk.var.min_observations must be between 1 and the window length",
        ));
    }
    check_fraction("risk.var.max_var_fraction", var.max_var_fraction)?;

    let breakers = &risk.circuit_breakers;
    if let Some(dd) = breakers.max_drawdown_fraction {
        check_fraction("risk.circuit_breakers.max_drawdown_fraction", dd)?;
    }
    if let Some(loss) = breakers.intraday_loss_fraction {
        check_fraction("risk.circuit_breakers.intraday_loss_fraction", loss)?;
    }
    if breakers.max_consecutive_losses == Some(0) {
        return Err(invalid(
            "risk.circuit_breakers.max_consecutive_losses must be at least 1",
        ));
    }

    let conc = &risk.concentration;
    check_fraction("risk.concentration.max_symbol_fraction", conc.max_symbol_fraction)?;
    check_fraction("risk.concentration.max_sector_fraction", conc.max_sector_fraction)?;
    check_fraction(
        "risk.concentration.max_correlated_fraction",
        conc.max_correlated_fraction,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.engine.mode, EngineMode::Backtest);
        assert!((config.risk.var.confidence - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.risk.var.window, 252);
        assert_eq!(config.risk.max_position_fraction, dec!(0.10));
        assert!(config.guardrails.session.is_none());
    }

    #[test]
    fn test_load_empty_document_uses_defaults() {
        let config = match load_config_from_string("{}") {
            Ok(c) => c,
            Err(e) => panic!("should load empty config: {e}"),
        };
        assert_eq!(config.engine.initial_cash, dec!(100000));
        assert_eq!(config.lifecycle.not_filled_timeout_secs, 60);
    }

    #[test]
    fn test_env_var_with_default_when_missing() {
        let input = "mode: ${GATED_ENGINE_TEST_NONEXISTENT_VAR:-paper}";
        assert_eq!(interpolate_env_vars(input), "mode: paper");
    }

    #[test]
    #[expect(clippy::literal_string_with_formatting_args)] // ${...} is env var syntax, not format args
    fn test_env_var_with_default_uses_existing() {
        let input = "path: ${PATH:-default}";
        let result = interpolate_env_vars(input);
        assert_ne!(result, "path: default");
        assert!(result.starts_with("path: "));
    }

    #[test]
    fn test_env_var_without_default_becomes_empty() {
        let input = "state_path: ${GATED_ENGINE_TEST_UNLIKELY_TO_EXIST}";
        assert_eq!(interpolate_env_vars(input), "state_path: ");
    }

    #[test]
    fn test_short_fill_timeout_is_rejected() {
        let yaml = r"
lifecycle:
  not_filled_timeout_secs: 2
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for a 2s fill timeout");
        };
        assert!(err.to_string().contains("not_filled_timeout_secs"));
    }

    #[test]
    fn test_oversized_durations_are_rejected() {
        for yaml in [
            "lifecycle:\n  max_open_secs: 18446744073709551615\n",
            "lifecycle:\n  not_filled_timeout_secs: 9223372036854775807\n  max_open_secs: 18446744073709551615\n",
            "guardrails:\n  symbol_cooldown_secs: 9223372036854775807\n",
            "reconciliation:\n  interval_secs: 9223372036854775807\n",
        ] {
            let Err(err) = load_config_from_string(yaml) else {
                panic!("expected error for {yaml}");
            };
            assert!(err.to_string().contains("must not exceed"), "{err}");
        }
    }

    #[test]
    fn test_history_limit_must_be_positive() {
        let Err(err) = load_config_from_string("live:\n  history_limit: 0\n") else {
            panic!("expected error for empty history");
        };
        assert!(err.to_string().contains("history_limit"));
        let config = load_config_from_string("{}").unwrap();
        assert_eq!(config.live.history_limit, 10_000);
        assert_eq!(config.live.retained_closed_orders, 1_000);
    }

    #[test]
    fn test_seconds_saturates() {
        assert_eq!(seconds(90), chrono::Duration::seconds(90));
        assert_eq!(seconds(u64::MAX), chrono::Duration::MAX);
        assert_eq!(seconds(i64::MAX as u64), chrono::Duration::MAX);
    }

    #[test]
    fn test_position_fraction_out_of_range() {
        let yaml = r"
risk:
  max_position_fraction: 1.5
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for fraction above 1");
        };
        assert!(err.to_string().contains("max_position_fraction"));
    }

    #[test]
    fn test_unknown_session_timezone() {
        let yaml = r#"
guardrails:
  session:
    timezone: "Mars/Olympus_Mons"
"#;
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for unknown timezone");
        };
        assert!(err.to_string().contains("timezone"));
    }

    #[test]
    fn test_full_config_parse() {
        let yaml = r#"
engine:
  mode: paper
  base_currency: "USD"
  initial_cash: 250000

risk:
  max_position_fraction: 0.05
  var:
    confidence: 0.99
    window: 500
    max_var_fraction: 0.02
  circuit_breakers:
    max_drawdown_fraction: 0.15
    intraday_loss_fraction: null
  concentration:
    max_symbol_fraction: 0.2
    mode: scale_down

guardrails:
  max_daily_orders: 20
  symbol_cooldown_secs: 600
  session:
    timezone: "America/New_York"
    open: "09:30"
    close: "16:00"

correlation:
  sectors:
    AAPL: tech
    MSFT: tech
  pairs:
    - { a: AAPL, b: MSFT, rho: 0.8 }

resilience:
  max_attempts: 3
  failure_limit: 4

reconciliation:
  cash_tolerance: 50
  every_n_fills: 5

observability:
  logging:
    level: "debug"
    format: "pretty"
"#;

        let config = match load_config_from_string(yaml) {
            Ok(c) => c,
            Err(e) => panic!("should load full config: {e}"),
        };

        assert_eq!(config.engine.mode, EngineMode::Paper);
        assert_eq!(config.engine.initial_cash, dec!(250000));
        assert_eq!(config.risk.max_position_fraction, dec!(0.05));
        assert_eq!(config.risk.var.window, 500);
        assert!(config.risk.circuit_breakers.intraday_loss_fraction.is_none());
        assert_eq!(
            config.risk.circuit_breakers.max_consecutive_losses,
            Some(5)
        );
        assert_eq!(config.risk.concentration.mode, ConcentrationMode::ScaleDown);
        assert_eq!(config.guardrails.max_daily_orders, Some(20));
        assert_eq!(config.correlation.sector("MSFT"), Some("tech"));
        assert_eq!(config.resilience.failure_limit, 4);
        assert_eq!(config.reconciliation.cash_tolerance, dec!(50));
        assert_eq!(config.observability.logging.format, "pretty");
    }
}
