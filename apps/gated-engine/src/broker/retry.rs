//! Retry policy and exponential backoff for broker calls.
//!
//! Delays grow as `initial × multiplier^attempt`, capped at the maximum,
//! then spread by ±`jitter_factor` so a fleet of retrying callers does not
//! hammer a recovering broker in lockstep.
//!
//! ```text
//! attempt 0 → ~100ms
//! attempt 1 → ~200ms
//! attempt 2 → ~400ms
//! ...       → capped at max_backoff
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for broker calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per call, the first included (default: 5).
    pub max_attempts: u32,
    /// Delay before the first retry (default: 100ms).
    pub initial_backoff: Duration,
    /// Delay ceiling (default: 30s).
    pub max_backoff: Duration,
    /// Growth factor per attempt (default: 2.0).
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the delay (default: 0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy with jitter disabled, for reproducible delays.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }
}

/// Calculator for exponential backoff with jitter.
#[derive(Debug)]
pub struct ExponentialBackoffCalculator {
    current_attempt: u32,
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    backoff_multiplier: f64,
    jitter_factor: f64,
}

impl ExponentialBackoffCalculator {
    /// Create a calculator from a policy.
    ///
    /// A policy of `n` attempts allows `n - 1` delays.
    #[must_use]
    pub const fn new(policy: &RetryPolicy) -> Self {
        Self {
            current_attempt: 0,
            max_retries: policy.max_attempts.saturating_sub(1),
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            jitter_factor: policy.jitter_factor,
            backoff_multiplier: policy.backoff_multiplier,
        }
    }

    /// Create an unbounded calculator (reconnect loops).
    #[must_use]
    pub const fn unbounded(policy: &RetryPolicy) -> Self {
        let mut calculator = Self::new(policy);
        calculator.max_retries = u32::MAX;
        calculator
    }

    /// Next delay, or `None` when retries are exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.max_retries {
            return None;
        }

        let base_backoff_ms = self.calculate_base_backoff_ms();
        let jittered_ms = self.apply_jitter(base_backoff_ms);
        let capped_ms = jittered_ms.min(self.max_backoff_ms);

        self.current_attempt = self.current_attempt.saturating_add(1);

        Some(Duration::from_millis(capped_ms))
    }

    /// Next delay, preferring a broker-supplied hint (rate limits).
    pub fn next_backoff_with_hint(&mut self, hint: Option<Duration>) -> Option<Duration> {
        let computed = self.next_backoff()?;
        Some(hint.map_or(computed, |h| h.min(Duration::from_millis(self.max_backoff_ms))))
    }

    fn calculate_base_backoff_ms(&self) -> u64 {
        let exponent = i32::try_from(self.current_attempt).unwrap_or(i32::MAX);
        let multiplier = self.backoff_multiplier.powi(exponent);
        let backoff = self.initial_backoff_ms as f64 * multiplier;
        if backoff.is_finite() && backoff < self.max_backoff_ms as f64 {
            backoff as u64
        } else {
            self.max_backoff_ms
        }
    }

    /// Uniform jitter in `[backoff × (1 − j), backoff × (1 + j)]`.
    fn apply_jitter(&self, backoff_ms: u64) -> u64 {
        if self.jitter_factor <= 0.0 || backoff_ms == 0 {
            return backoff_ms;
        }
        let mut rng = rand::rng();
        let jitter_range = backoff_ms as f64 * self.jitter_factor;
        let min = (backoff_ms as f64 - jitter_range).max(0.0);
        let max = backoff_ms as f64 + jitter_range;

        rng.random_range(min..=max) as u64
    }

    /// Delays handed out so far.
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Whether another delay is available.
    #[must_use]
    pub const fn has_remaining_attempts(&self) -> bool {
        self.current_attempt < self.max_retries
    }

    /// Start over.
    pub const fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert!((policy.jitter_factor - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_exponential_backoff_sequence() {
        let policy = RetryPolicy::default().without_jitter();
        let mut backoff = ExponentialBackoffCalculator::new(&policy);

        // Five attempts leave four delays: 100ms, 200ms, 400ms, 800ms.
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(800)));
        assert!(backoff.next_backoff().is_none());
    }

    #[test]
    fn test_max_backoff_cap() {
        let policy = RetryPolicy {
            max_attempts: 20,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 10.0,
            jitter_factor: 0.0,
        };
        let mut backoff = ExponentialBackoffCalculator::new(&policy);

        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(5)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_jitter_range() {
        let policy = RetryPolicy::default();

        for _ in 0..100 {
            let mut backoff = ExponentialBackoffCalculator::new(&policy);
            let duration = backoff.next_backoff().unwrap();

            // Base is 100ms, jitter is ±20%.
            assert!(
                duration >= Duration::from_millis(80) && duration <= Duration::from_millis(120),
                "Duration {duration:?} not in expected range 80-120ms"
            );
        }
    }

    #[test]
    fn test_hint_is_capped() {
        let policy = RetryPolicy::default().without_jitter();
        let mut backoff = ExponentialBackoffCalculator::new(&policy);
        assert_eq!(
            backoff.next_backoff_with_hint(Some(Duration::from_secs(2))),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            backoff.next_backoff_with_hint(Some(Duration::from_secs(120))),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_unbounded_never_exhausts() {
        let policy = RetryPolicy::default().without_jitter();
        let mut backoff = ExponentialBackoffCalculator::unbounded(&policy);
        for _ in 0..50 {
            assert!(backoff.next_backoff().is_some());
        }
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_reset_backoff() {
        let policy = RetryPolicy::default();
        let mut backoff = ExponentialBackoffCalculator::new(&policy);

        let _ = backoff.next_backoff();
        let _ = backoff.next_backoff();
        assert_eq!(backoff.current_attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.current_attempt(), 0);
        assert!(backoff.has_remaining_attempts());
    }
}
