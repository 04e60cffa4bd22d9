//! Engine-wide fault taxonomy.
//!
//! Every failure that crosses the engine boundary resolves to an
//! [`EngineFault`], which carries a machine-readable [`ErrorCode`] and the
//! [`FaultCategory`] it belongs to.
//!
//! # Categories
//!
//! | Category | Example | Handling |
//! |----------|---------|----------|
//! | `Rejection` | Signal fails a risk gate | Logged, no retry |
//! | `TransientBroker` | Timeout, connection reset | Retried with backoff |
//! | `TerminalBroker` | Authentication failure, invalid order | Order rejected, no retry |
//! | `Consistency` | Reconciliation drift | Reported, optionally halts |
//! | `Fatal` | Kill switch tripped | All submissions halted until reset |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::execution::LifecycleError;
use crate::models::{BarError, SignalError};
use crate::portfolio::PortfolioError;
use crate::resilience::ResilienceError;
use crate::safety::KillSwitchError;
use crate::scheduler::{FeedError, SchedulerError};

/// The five fault categories every engine failure resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultCategory {
    /// A signal failed a risk check. Expected and recoverable.
    Rejection,
    /// Broker trouble that may clear on retry.
    TransientBroker,
    /// Broker refusal that will not clear on retry.
    TerminalBroker,
    /// Internal state diverged from the broker.
    Consistency,
    /// The kill switch is tripped.
    Fatal,
}

impl std::fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejection => write!(f, "REJECTION"),
            Self::TransientBroker => write!(f, "TRANSIENT_BROKER"),
            Self::TerminalBroker => write!(f, "TERMINAL_BROKER"),
            Self::Consistency => write!(f, "CONSISTENCY"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Error codes for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Rejections
    /// Signal rejected by the risk gate.
    RiskRejected,
    /// Signal failed construction-time validation.
    InvalidSignal,
    /// Bar failed data-quality validation.
    InvalidBar,

    // Transient broker faults
    /// Broker call retried until the attempt cap or budget ran out.
    BrokerRetriesExhausted,

    // Terminal broker faults
    /// Broker refused the call outright.
    BrokerTerminal,

    // Consistency faults
    /// Lifecycle received an update that violates its state machine.
    LifecycleViolation,
    /// Portfolio refused a fill.
    InvalidFill,
    /// Reconciliation found drift beyond tolerance.
    ReconciliationDrift,

    // Fatal faults
    /// Kill switch is tripped; submissions halted.
    Halted,
    /// Consecutive broker failures tripped the kill switch.
    BrokerCircuitBreaker,
    /// Repeated data-feed failures tripped the kill switch.
    FeedFailure,
    /// Kill switch state could not be read or written.
    KillSwitchPersistence,

    // Startup
    /// Configuration failed to load or validate.
    ConfigInvalid,
}

impl ErrorCode {
    /// Get the error reason string.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::RiskRejected => "RISK_REJECTED",
            Self::InvalidSignal => "INVALID_SIGNAL",
            Self::InvalidBar => "INVALID_BAR",
            Self::BrokerRetriesExhausted => "BROKER_RETRIES_EXHAUSTED",
            Self::BrokerTerminal => "BROKER_TERMINAL",
            Self::LifecycleViolation => "LIFECYCLE_VIOLATION",
            Self::InvalidFill => "INVALID_FILL",
            Self::ReconciliationDrift => "RECONCILIATION_DRIFT",
            Self::Halted => "HALTED",
            Self::BrokerCircuitBreaker => "BROKER_CIRCUIT_BREAKER",
            Self::FeedFailure => "FEED_FAILURE",
            Self::KillSwitchPersistence => "KILL_SWITCH_PERSISTENCE",
            Self::ConfigInvalid => "CONFIG_INVALID",
        }
    }

    /// Get the fault category this code belongs to.
    #[must_use]
    pub const fn category(&self) -> FaultCategory {
        match self {
            Self::RiskRejected | Self::InvalidSignal | Self::InvalidBar => FaultCategory::Rejection,
            Self::BrokerRetriesExhausted => FaultCategory::TransientBroker,
            Self::BrokerTerminal => FaultCategory::TerminalBroker,
            Self::LifecycleViolation | Self::InvalidFill | Self::ReconciliationDrift => {
                FaultCategory::Consistency
            }
            Self::Halted
            | Self::BrokerCircuitBreaker
            | Self::FeedFailure
            | Self::KillSwitchPersistence
            | Self::ConfigInvalid => FaultCategory::Fatal,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// A fault with code, message, and context.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{}] {message}", .code.reason())]
pub struct EngineFault {
    code: ErrorCode,
    message: String,
    context: Vec<(String, String)>,
}

impl EngineFault {
    /// Create a new fault.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: Vec::new(),
        }
    }

    /// Add context to the fault.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    /// Get the error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the fault category.
    #[must_use]
    pub const fn category(&self) -> FaultCategory {
        self.code.category()
    }

    /// Get the message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the context.
    #[must_use]
    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }
}

impl From<SignalError> for EngineFault {
    fn from(err: SignalError) -> Self {
        Self::new(ErrorCode::InvalidSignal, err.to_string())
    }
}

impl From<BarError> for EngineFault {
    fn from(err: BarError) -> Self {
        Self::new(ErrorCode::InvalidBar, err.to_string())
    }
}

impl From<ConfigError> for EngineFault {
    fn from(err: ConfigError) -> Self {
        Self::new(ErrorCode::ConfigInvalid, err.to_string())
    }
}

impl From<LifecycleError> for EngineFault {
    fn from(err: LifecycleError) -> Self {
        Self::new(ErrorCode::LifecycleViolation, err.to_string())
    }
}

impl From<PortfolioError> for EngineFault {
    fn from(err: PortfolioError) -> Self {
        Self::new(ErrorCode::InvalidFill, err.to_string())
    }
}

impl From<KillSwitchError> for EngineFault {
    fn from(err: KillSwitchError) -> Self {
        Self::new(ErrorCode::KillSwitchPersistence, err.to_string())
    }
}

impl From<BrokerError> for EngineFault {
    fn from(err: BrokerError) -> Self {
        Self::new(ErrorCode::BrokerTerminal, err.to_string())
    }
}

impl From<FeedError> for EngineFault {
    fn from(err: FeedError) -> Self {
        Self::new(ErrorCode::FeedFailure, err.to_string())
    }
}

impl From<SchedulerError> for EngineFault {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Feed(e) => e.into(),
            SchedulerError::FeedFailed { failures, .. } => {
                Self::new(ErrorCode::FeedFailure, err.to_string())
                    .with_context("failures", failures.to_string())
            }
            SchedulerError::Portfolio(e) => e.into(),
            SchedulerError::Lifecycle(e) => e.into(),
            SchedulerError::Config(e) => e.into(),
            SchedulerError::Report(e) => Self::new(ErrorCode::ConfigInvalid, e.to_string()),
        }
    }
}

impl From<ResilienceError> for EngineFault {
    fn from(err: ResilienceError) -> Self {
        let code = match &err {
            ResilienceError::Halted { .. } => ErrorCode::Halted,
            ResilienceError::CircuitTripped { .. } => ErrorCode::BrokerCircuitBreaker,
            ResilienceError::RetriesExhausted { .. } => ErrorCode::BrokerRetriesExhausted,
            ResilienceError::Terminal { .. } => ErrorCode::BrokerTerminal,
        };
        Self::new(code, err.to_string()).with_context("operation", err.operation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_maps_to_a_category() {
        assert_eq!(ErrorCode::RiskRejected.category(), FaultCategory::Rejection);
        assert_eq!(
            ErrorCode::BrokerRetriesExhausted.category(),
            FaultCategory::TransientBroker
        );
        assert_eq!(
            ErrorCode::BrokerTerminal.category(),
            FaultCategory::TerminalBroker
        );
        assert_eq!(
            ErrorCode::ReconciliationDrift.category(),
            FaultCategory::Consistency
        );
        assert_eq!(
            ErrorCode::BrokerCircuitBreaker.category(),
            FaultCategory::Fatal
        );
    }

    #[test]
    fn fault_display_includes_reason() {
        let fault = EngineFault::new(ErrorCode::Halted, "kill switch tripped")
            .with_context("reason", "broker_circuit_breaker");

        assert_eq!(fault.to_string(), "[HALTED] kill switch tripped");
        assert_eq!(fault.category(), FaultCategory::Fatal);
        assert_eq!(
            fault.context(),
            &[("reason".to_string(), "broker_circuit_breaker".to_string())]
        );
    }

    #[test]
    fn signal_error_becomes_rejection() {
        let fault = EngineFault::from(SignalError::StrengthOutOfRange { strength: 1.5 });
        assert_eq!(fault.code(), ErrorCode::InvalidSignal);
        assert_eq!(fault.category(), FaultCategory::Rejection);
    }
}
