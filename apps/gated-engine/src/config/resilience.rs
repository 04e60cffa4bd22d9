//! Broker retry, backoff and failure-limit settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::RetryPolicy;

/// Resilience wrapper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Retries allowed per call after the first attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor per retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the delay (0.2 = +/-20%).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Consecutive transient failures that trip the kill switch.
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
    /// Timeout applied to each broker call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Total time one wrapped call may spend across retries.
    #[serde(default = "default_retry_budget_ms")]
    pub retry_budget_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            failure_limit: default_failure_limit(),
            call_timeout_ms: default_call_timeout_ms(),
            retry_budget_ms: default_retry_budget_ms(),
        }
    }
}

impl ResilienceConfig {
    /// Build the retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
        }
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Retry budget.
    #[must_use]
    pub const fn retry_budget(&self) -> Duration {
        Duration::from_millis(self.retry_budget_ms)
    }
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_jitter_factor() -> f64 {
    0.2
}

const fn default_failure_limit() -> u32 {
    5
}

const fn default_call_timeout_ms() -> u64 {
    10_000
}

const fn default_retry_budget_ms() -> u64 {
    60_000
}
