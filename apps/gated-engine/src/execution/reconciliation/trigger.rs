//! When to reconcile: on an interval or after every N fills.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ReconciliationConfig, seconds};

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// Interval elapsed.
    Interval,
    /// Fill count reached.
    Fills,
    /// Requested explicitly.
    Manual,
}

/// Tracks elapsed time and fills since the last run.
#[derive(Debug, Clone)]
pub struct ReconcileTrigger {
    interval: Option<Duration>,
    every_n_fills: Option<u32>,
    last_run: Option<DateTime<Utc>>,
    fills_since: u32,
}

impl ReconcileTrigger {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &ReconciliationConfig) -> Self {
        let interval = (config.interval_secs > 0).then(|| seconds(config.interval_secs));
        Self {
            interval,
            every_n_fills: config.every_n_fills.filter(|n| *n > 0),
            last_run: None,
            fills_since: 0,
        }
    }

    /// Count a fill.
    pub const fn record_fill(&mut self) {
        self.fills_since = self.fills_since.saturating_add(1);
    }

    /// Whether a run is due at `now`. The first check starts the interval.
    pub fn due(&mut self, now: DateTime<Utc>) -> Option<TriggerReason> {
        if let Some(n) = self.every_n_fills
            && self.fills_since >= n
        {
            return Some(TriggerReason::Fills);
        }
        let interval = self.interval?;
        match self.last_run {
            None => {
                self.last_run = Some(now);
                None
            }
            Some(last) if now - last >= interval => Some(TriggerReason::Interval),
            Some(_) => None,
        }
    }

    /// Record that a run completed.
    pub const fn mark_run(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.fills_since = 0;
    }

    /// Fills since the last run.
    #[must_use]
    pub const fn fills_since(&self) -> u32 {
        self.fills_since
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
    }

    #[test]
    fn fires_on_interval() {
        let mut trigger = ReconcileTrigger::new(&ReconciliationConfig::default());
        assert_eq!(trigger.due(t0()), None);
        assert_eq!(trigger.due(t0() + Duration::seconds(299)), None);
        assert_eq!(trigger.due(t0() + Duration::seconds(300)), Some(TriggerReason::Interval));
        trigger.mark_run(t0() + Duration::seconds(300));
        assert_eq!(trigger.due(t0() + Duration::seconds(301)), None);
    }

    #[test]
    fn fires_after_n_fills() {
        let config = ReconciliationConfig {
            interval_secs: 0,
            every_n_fills: Some(2),
            ..ReconciliationConfig::default()
        };
        let mut trigger = ReconcileTrigger::new(&config);
        trigger.record_fill();
        assert_eq!(trigger.due(t0()), None);
        trigger.record_fill();
        assert_eq!(trigger.due(t0()), Some(TriggerReason::Fills));
        trigger.mark_run(t0());
        assert_eq!(trigger.fills_since(), 0);
    }
}
