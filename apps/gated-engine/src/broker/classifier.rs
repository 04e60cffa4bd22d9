//! Transient/terminal classification of broker errors.

use std::fmt;

use super::BrokerError;

/// How the resilience layer should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying; counts toward the failure circuit.
    Transient,
    /// Retrying cannot help; propagate immediately.
    Terminal,
}

/// Per-adapter error classification.
pub trait ErrorClassifier: Send + Sync + fmt::Debug {
    /// Classify an error.
    fn classify(&self, error: &BrokerError) -> ErrorClass;
}

/// Classifier for adapters that report errors through [`BrokerError`]
/// faithfully.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &BrokerError) -> ErrorClass {
        match error {
            BrokerError::Timeout { .. }
            | BrokerError::Connection(_)
            | BrokerError::RateLimited { .. } => ErrorClass::Transient,
            BrokerError::Server { status, .. } => classify_status(*status),
            BrokerError::Unauthorized(_)
            | BrokerError::Rejected(_)
            | BrokerError::InvalidOrder(_)
            | BrokerError::NotFound(_) => ErrorClass::Terminal,
            BrokerError::Other(message) => classify_message(message),
        }
    }
}

/// Classify an HTTP-style status code.
#[must_use]
pub const fn classify_status(status: u16) -> ErrorClass {
    match status {
        408 | 429 | 500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Terminal,
    }
}

/// Classify by message keywords; unknown messages are treated as transient.
#[must_use]
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("temporary failure")
        || lower.contains("network")
        || lower.contains("broken pipe")
        || lower.contains("unavailable")
    {
        return ErrorClass::Transient;
    }

    if lower.contains("invalid")
        || lower.contains("bad request")
        || lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("not found")
        || lower.contains("insufficient")
        || lower.contains("rejected")
    {
        return ErrorClass::Terminal;
    }

    ErrorClass::Transient
}
