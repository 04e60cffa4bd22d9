//! Order lifecycle timeouts.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::seconds;

/// Shortest accepted not-filled timeout. Shorter values race real fill latency.
pub const MIN_NOT_FILLED_TIMEOUT_SECS: u64 = 15;

/// Lifecycle timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Seconds a submitted order may sit with nothing filled before it is rejected as NOT_FILLED.
    #[serde(default = "default_not_filled_timeout_secs")]
    pub not_filled_timeout_secs: u64,
    /// Seconds any order may stay open before it expires.
    #[serde(default = "default_max_open_secs")]
    pub max_open_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            not_filled_timeout_secs: default_not_filled_timeout_secs(),
            max_open_secs: default_max_open_secs(),
        }
    }
}

impl LifecycleConfig {
    /// Not-filled timeout.
    #[must_use]
    pub fn not_filled_timeout(&self) -> Duration {
        seconds(self.not_filled_timeout_secs)
    }

    /// Maximum open duration.
    #[must_use]
    pub fn max_open(&self) -> Duration {
        seconds(self.max_open_secs)
    }
}

const fn default_not_filled_timeout_secs() -> u64 {
    60
}

const fn default_max_open_secs() -> u64 {
    3600
}
