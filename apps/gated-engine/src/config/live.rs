//! Live event loop cadence and feed failure handling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::RetryPolicy;

/// Live scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Milliseconds between fill polls.
    #[serde(default = "default_fill_poll_interval_ms")]
    pub fill_poll_interval_ms: u64,
    /// Milliseconds between heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Seconds without feed activity before the feed is considered dead.
    #[serde(default = "default_silence_timeout_secs")]
    pub silence_timeout_secs: u64,
    /// Consecutive feed failures that trip the kill switch.
    #[serde(default = "default_max_feed_failures")]
    pub max_feed_failures: u32,
    /// First reconnect delay.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Reconnect delay ceiling.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Fills and equity points kept in memory; older ones live in the audit log.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Closed orders kept in memory once the broker has confirmed them.
    #[serde(default = "default_retained_closed_orders")]
    pub retained_closed_orders: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            fill_poll_interval_ms: default_fill_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            silence_timeout_secs: default_silence_timeout_secs(),
            max_feed_failures: default_max_feed_failures(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            history_limit: default_history_limit(),
            retained_closed_orders: default_retained_closed_orders(),
        }
    }
}

impl LiveConfig {
    /// Fill poll interval.
    #[must_use]
    pub const fn fill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }

    /// Heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Feed silence timeout.
    #[must_use]
    pub const fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }

    /// Reconnect backoff. Attempts are bounded by the feed failure limit.
    #[must_use]
    pub const fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_feed_failures,
            initial_backoff: Duration::from_millis(self.reconnect_initial_ms),
            max_backoff: Duration::from_millis(self.reconnect_max_ms),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

const fn default_fill_poll_interval_ms() -> u64 {
    1000
}

const fn default_heartbeat_interval_ms() -> u64 {
    5000
}

const fn default_silence_timeout_secs() -> u64 {
    120
}

const fn default_max_feed_failures() -> u32 {
    5
}

const fn default_reconnect_initial_ms() -> u64 {
    500
}

const fn default_reconnect_max_ms() -> u64 {
    30_000
}

const fn default_history_limit() -> usize {
    10_000
}

const fn default_retained_closed_orders() -> usize {
    1_000
}
