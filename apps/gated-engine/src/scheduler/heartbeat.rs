//! Feed liveness tracking for the live loop.

use std::time::Duration;

use tokio::time::Instant;

/// Outcome of a heartbeat check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Feed delivered something within the silence timeout.
    Alive {
        /// Time since the last delivery.
        since_last: Duration,
    },
    /// Feed has been silent too long and should be reconnected.
    Silent {
        /// Time since the last delivery.
        since_last: Duration,
    },
}

/// Tracks when the feed last delivered a bar.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    silence_timeout: Duration,
    last_activity: Instant,
    beats: u64,
}

impl HeartbeatMonitor {
    /// Start tracking now.
    #[must_use]
    pub fn new(silence_timeout: Duration) -> Self {
        Self {
            silence_timeout,
            last_activity: Instant::now(),
            beats: 0,
        }
    }

    /// Record feed activity.
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last activity.
    #[must_use]
    pub fn since_last(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Heartbeats checked so far.
    #[must_use]
    pub const fn beats(&self) -> u64 {
        self.beats
    }

    /// Run one heartbeat check.
    pub fn check(&mut self) -> HeartbeatEvent {
        self.beats += 1;
        let since_last = self.since_last();
        if since_last > self.silence_timeout {
            tracing::warn!(
                silent_secs = since_last.as_secs(),
                timeout_secs = self.silence_timeout.as_secs(),
                "Feed silence detected"
            );
            HeartbeatEvent::Silent { since_last }
        } else {
            HeartbeatEvent::Alive { since_last }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn silence_is_detected_after_timeout() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(10));
        assert!(matches!(monitor.check(), HeartbeatEvent::Alive { .. }));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(monitor.check(), HeartbeatEvent::Silent { .. }));

        monitor.record_activity();
        assert!(matches!(monitor.check(), HeartbeatEvent::Alive { .. }));
        assert_eq!(monitor.beats(), 3);
    }
}
