//! Retry, backoff and failure-circuit wrapper around broker calls.
//!
//! # Behaviour
//!
//! ```text
//! tripped? ──yes──▶ Halted (no broker call)
//!    │ no
//!    ▼
//! call ──ok──▶ reset streak ─▶ (recovered event if retried) ─▶ Ok
//!    │ err
//!    ├─terminal──▶ terminal event ─▶ Terminal (streak untouched)
//!    └─transient─▶ streak += 1
//!                    ├─ streak ≥ limit ─▶ trip kill switch ─▶ CircuitTripped
//!                    ├─ attempts/budget spent ─▶ RetriesExhausted
//!                    └─ retry event, sleep backoff, call again
//! ```
//!
//! The consecutive-failure streak lives in the [`KillSwitch`] so it survives
//! restarts together with the trip itself.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::audit::{self, AuditKind, SharedAuditSink};
use crate::broker::{
    BrokerError, BrokerHandle, BrokerOrderStatus, BrokerPort, ErrorClass, ErrorClassifier,
    ExponentialBackoffCalculator, OrderRequest, RetryPolicy,
};
use crate::config::ResilienceConfig;
use crate::models::BrokerOrderId;
use crate::observability::metrics;
use crate::portfolio::Position;
use crate::safety::KillSwitch;

/// Kill-switch reason used when the failure circuit trips.
pub const BROKER_CIRCUIT_BREAKER: &str = "broker_circuit_breaker";

/// Failures surfaced by the wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResilienceError {
    /// Kill switch is tripped; the broker was not called.
    #[error("{operation}: trading halted ({reason})")]
    Halted {
        /// Operation refused.
        operation: String,
        /// Trip reason.
        reason: String,
    },

    /// This failure tripped the kill switch.
    #[error("{operation}: {failures} consecutive broker failures, circuit tripped (last: {last_error})")]
    CircuitTripped {
        /// Operation.
        operation: String,
        /// Streak length at trip.
        failures: u32,
        /// Final error.
        last_error: BrokerError,
    },

    /// Transient failures outlasted the attempt cap or retry budget.
    #[error("{operation}: gave up after {attempts} attempts (last: {last_error})")]
    RetriesExhausted {
        /// Operation.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Final error.
        last_error: BrokerError,
    },

    /// Error that retrying cannot fix.
    #[error("{operation}: {error}")]
    Terminal {
        /// Operation.
        operation: String,
        /// The error.
        error: BrokerError,
    },
}

impl ResilienceError {
    /// Operation that failed.
    #[must_use]
    pub fn operation(&self) -> &str {
        match self {
            Self::Halted { operation, .. }
            | Self::CircuitTripped { operation, .. }
            | Self::RetriesExhausted { operation, .. }
            | Self::Terminal { operation, .. } => operation,
        }
    }

    /// Underlying broker error, when the broker was reached.
    #[must_use]
    pub const fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            Self::Halted { .. } => None,
            Self::CircuitTripped { last_error, .. } | Self::RetriesExhausted { last_error, .. } => {
                Some(last_error)
            }
            Self::Terminal { error, .. } => Some(error),
        }
    }
}

#[derive(Serialize)]
struct RetryRecord<'a> {
    operation: &'a str,
    attempt: u32,
    delay_ms: u128,
    consecutive_failures: u32,
    error: String,
}

#[derive(Serialize)]
struct TerminalRecord<'a> {
    operation: &'a str,
    attempt: u32,
    error: String,
}

#[derive(Serialize)]
struct RecoveredRecord<'a> {
    operation: &'a str,
    attempts: u32,
}

/// Wraps every broker call.
#[derive(Debug, Clone)]
pub struct ResilienceWrapper {
    broker: Arc<dyn BrokerPort>,
    classifier: Arc<dyn ErrorClassifier>,
    kill_switch: Arc<KillSwitch>,
    audit: SharedAuditSink,
    policy: RetryPolicy,
    failure_limit: u32,
    call_timeout: Duration,
    retry_budget: Duration,
}

impl ResilienceWrapper {
    /// Wrap a broker.
    #[must_use]
    pub fn new(
        broker: BrokerHandle,
        kill_switch: Arc<KillSwitch>,
        audit: SharedAuditSink,
        config: &ResilienceConfig,
    ) -> Self {
        Self {
            broker: broker.port,
            classifier: broker.classifier,
            kill_switch,
            audit,
            policy: config.retry_policy(),
            failure_limit: config.failure_limit.max(1),
            call_timeout: config.call_timeout(),
            retry_budget: config.retry_budget(),
        }
    }

    /// Override the retry policy (tests disable jitter).
    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The wrapped broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn BrokerPort> {
        &self.broker
    }

    /// Run `call` under the retry, backoff and circuit rules.
    ///
    /// # Errors
    ///
    /// See [`ResilienceError`].
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let started = Instant::now();
        let mut backoff = ExponentialBackoffCalculator::new(&self.policy);
        let mut attempt: u32 = 0;

        loop {
            if self.kill_switch.is_tripped() {
                let reason = self
                    .kill_switch
                    .state()
                    .trip_reason
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(ResilienceError::Halted {
                    operation: operation.to_string(),
                    reason,
                });
            }

            attempt += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout {
                    operation: operation.to_string(),
                }),
            };

            let err = match outcome {
                Ok(value) => {
                    self.kill_switch.record_success();
                    if attempt > 1 {
                        info!(operation, attempts = attempt, "Broker call recovered");
                        metrics::record_resilience_event("recovered");
                        audit::emit(
                            self.audit.as_ref(),
                            AuditKind::ResilienceRecovered,
                            Utc::now(),
                            &RecoveredRecord {
                                operation,
                                attempts: attempt,
                            },
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if self.classifier.classify(&err) == ErrorClass::Terminal {
                error!(operation, attempt, error = %err, "Terminal broker error");
                metrics::record_resilience_event("terminal");
                audit::emit(
                    self.audit.as_ref(),
                    AuditKind::ResilienceTerminal,
                    Utc::now(),
                    &TerminalRecord {
                        operation,
                        attempt,
                        error: err.to_string(),
                    },
                );
                return Err(ResilienceError::Terminal {
                    operation: operation.to_string(),
                    error: err,
                });
            }

            let failures = self.kill_switch.record_failure();
            if failures >= self.failure_limit {
                self.kill_switch.trip(BROKER_CIRCUIT_BREAKER, Utc::now());
                metrics::record_resilience_event("circuit_tripped");
                return Err(ResilienceError::CircuitTripped {
                    operation: operation.to_string(),
                    failures,
                    last_error: err,
                });
            }

            let delay = backoff
                .next_backoff_with_hint(err.retry_after())
                .filter(|delay| started.elapsed() + *delay <= self.retry_budget);
            let Some(delay) = delay else {
                warn!(operation, attempts = attempt, error = %err, "Broker retries exhausted");
                metrics::record_resilience_event("exhausted");
                return Err(ResilienceError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: err,
                });
            };

            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                consecutive_failures = failures,
                error = %err,
                "Transient broker error, retrying"
            );
            metrics::record_resilience_event("retry");
            metrics::record_retry_delay(delay);
            audit::emit(
                self.audit.as_ref(),
                AuditKind::ResilienceRetry,
                Utc::now(),
                &RetryRecord {
                    operation,
                    attempt,
                    delay_ms: delay.as_millis(),
                    consecutive_failures: failures,
                    error: err.to_string(),
                },
            );
            tokio::time::sleep(delay).await;
        }
    }

    // ========================================================================
    // Broker operations
    // ========================================================================

    /// Submit an order.
    pub async fn submit(&self, order: &OrderRequest) -> Result<BrokerOrderId, ResilienceError> {
        self.execute("submit", || self.broker.submit(order)).await
    }

    /// Cancel an order.
    pub async fn cancel(&self, id: &BrokerOrderId) -> Result<(), ResilienceError> {
        self.execute("cancel", || self.broker.cancel(id)).await
    }

    /// Broker positions.
    pub async fn positions(&self) -> Result<Vec<Position>, ResilienceError> {
        self.execute("positions", || self.broker.positions()).await
    }

    /// Broker cash.
    pub async fn cash(&self) -> Result<Decimal, ResilienceError> {
        self.execute("cash", || self.broker.cash()).await
    }

    /// Status of one order.
    pub async fn order_status(&self, id: &BrokerOrderId) -> Result<BrokerOrderStatus, ResilienceError> {
        self.execute("order_status", || self.broker.order_status(id)).await
    }

    /// Orders the broker considers open.
    pub async fn open_orders(&self) -> Result<Vec<BrokerOrderId>, ResilienceError> {
        self.execute("open_orders", || self.broker.open_orders()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::broker::{DefaultClassifier, PaperBroker};
    use crate::config::PaperBrokerConfig;
    use rust_decimal_macros::dec;

    fn setup(failure_limit: u32) -> (ResilienceWrapper, Arc<PaperBroker>, Arc<KillSwitch>, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let kill_switch = KillSwitch::in_memory(sink.clone());
        let paper = Arc::new(PaperBroker::new(&PaperBrokerConfig::default(), "USD", dec!(1000)));
        let handle = BrokerHandle {
            port: paper.clone(),
            classifier: Arc::new(DefaultClassifier),
        };
        let config = ResilienceConfig {
            failure_limit,
            ..ResilienceConfig::default()
        };
        let wrapper = ResilienceWrapper::new(handle, kill_switch.clone(), sink.clone(), &config)
            .with_policy(config.retry_policy().without_jitter());
        (wrapper, paper, kill_switch, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let (wrapper, paper, kill_switch, sink) = setup(10);
        paper.inject_faults(2, &BrokerError::Connection("reset".into()));

        let cash = wrapper.cash().await.unwrap();
        assert_eq!(cash, dec!(1000));
        assert_eq!(paper.call_count(), 3);
        assert_eq!(kill_switch.consecutive_failures(), 0);
        assert_eq!(sink.count(AuditKind::ResilienceRetry), 2);
        assert_eq!(sink.count(AuditKind::ResilienceRecovered), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_is_not_retried() {
        let (wrapper, paper, kill_switch, sink) = setup(3);
        paper.inject_faults(1, &BrokerError::Unauthorized("bad key".into()));

        let err = wrapper.cash().await.unwrap_err();
        assert!(matches!(err, ResilienceError::Terminal { .. }));
        assert_eq!(paper.call_count(), 1);
        assert_eq!(kill_switch.consecutive_failures(), 0);
        assert_eq!(sink.count(AuditKind::ResilienceTerminal), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempt_cap() {
        let (wrapper, paper, kill_switch, _) = setup(100);
        paper.inject_faults(10, &BrokerError::Timeout { operation: "cash".into() });

        let err = wrapper.cash().await.unwrap_err();
        let ResilienceError::RetriesExhausted { attempts, .. } = err else {
            panic!("expected exhaustion, got {err:?}");
        };
        assert_eq!(attempts, 5);
        assert_eq!(paper.call_count(), 5);
        assert_eq!(kill_switch.consecutive_failures(), 5);
        assert!(!kill_switch.is_tripped());
    }

    #[tokio::test(start_paused = true)]
    async fn streak_trips_kill_switch_and_blocks_calls() {
        let (wrapper, paper, kill_switch, _) = setup(3);
        paper.inject_faults(10, &BrokerError::Connection("down".into()));

        let err = wrapper.cash().await.unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitTripped { failures: 3, .. }));
        assert!(kill_switch.is_tripped());
        assert_eq!(paper.call_count(), 3);

        let err = wrapper.positions().await.unwrap_err();
        assert!(matches!(err, ResilienceError::Halted { .. }));
        assert_eq!(paper.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let (wrapper, _, _, _) = setup(1);
        let err = wrapper
            .execute("slow", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, BrokerError>(())
            })
            .await
            .unwrap_err();
        let Some(BrokerError::Timeout { operation }) = err.broker_error() else {
            panic!("expected timeout, got {err:?}");
        };
        assert_eq!(operation, "slow");
    }
}
