//! Prometheus metrics for the engine.
//!
//! Recorders go through the `metrics` facade and are no-ops until
//! [`init_metrics`] installs the exporter, so backtests and tests pay
//! nothing for them.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::config::MetricsConfig;
use crate::models::{OrderSide, OrderState, RejectionCode};

/// Retry delay buckets, 10ms to 60s.
const DELAY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Listen address does not parse.
    #[error("invalid metrics listen address '{addr}': {reason}")]
    InvalidAddress {
        /// Configured address.
        addr: String,
        /// Parser message.
        reason: String,
    },
    /// Failed to configure metrics exporter.
    #[error("metrics configuration error: {0}")]
    Configuration(String),
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

/// Start the Prometheus exporter when enabled.
///
/// This starts an HTTP listener that exposes metrics at `/metrics`.
///
/// # Errors
///
/// Returns an error if the address is invalid or the exporter fails to
/// start (e.g., port already in use).
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e: std::net::AddrParseError| MetricsError::InvalidAddress {
            addr: config.listen_addr.clone(),
            reason: e.to_string(),
        })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(DELAY_BUCKETS)
        .map_err(|e| MetricsError::Configuration(e.to_string()))?
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    tracing::info!(addr = %addr, "Prometheus metrics exporter started");

    Ok(())
}

// ============================================================================
// Risk Gate Metrics
// ============================================================================

/// Record a gate decision and, for rejections, each reason.
pub fn record_risk_decision(approved: bool, reasons: &[RejectionCode]) {
    let outcome = if approved { "approved" } else { "rejected" };
    counter!("risk_decisions_total", "outcome" => outcome).increment(1);
    for reason in reasons {
        counter!("risk_rejection_reasons_total", "reason" => reason.as_str()).increment(1);
    }
}

// ============================================================================
// Order Lifecycle Metrics
// ============================================================================

/// Record an order entering `state`.
pub fn record_order_transition(state: OrderState) {
    counter!("order_transitions_total", "state" => state.to_string()).increment(1);
}

/// Record a fill applied to the portfolio.
pub fn record_fill(symbol: &str, side: OrderSide) {
    counter!(
        "fills_total",
        "symbol" => symbol.to_string(),
        "side" => side.to_string()
    )
    .increment(1);
}

// ============================================================================
// Resilience Metrics
// ============================================================================

/// Record a resilience event (`retry`, `recovered`, `terminal`,
/// `exhausted`, `circuit_tripped`).
pub fn record_resilience_event(kind: &'static str) {
    counter!("broker_resilience_events_total", "kind" => kind).increment(1);
}

/// Record a retry delay.
pub fn record_retry_delay(delay: Duration) {
    histogram!("broker_retry_delay_seconds").record(delay.as_secs_f64());
}

/// Record the kill switch state.
pub fn record_kill_switch(tripped: bool) {
    gauge!("kill_switch_tripped").set(if tripped { 1.0 } else { 0.0 });
}

// ============================================================================
// Reconciliation, Feed and Portfolio Metrics
// ============================================================================

/// Record a reconciliation run by verdict.
pub fn record_reconciliation(verdict: &'static str) {
    counter!("reconciliation_runs_total", "verdict" => verdict).increment(1);
}

/// Record a data feed reconnect attempt.
pub fn record_feed_reconnect() {
    counter!("feed_reconnects_total").increment(1);
}

/// Record a bar skipped by the data-quality check.
pub fn record_bar_flagged(reason: &'static str) {
    counter!("bars_flagged_total", "reason" => reason).increment(1);
}

/// Record marked portfolio equity.
pub fn record_equity(equity: Decimal) {
    if let Some(value) = equity.to_f64() {
        gauge!("portfolio_equity").set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_exporter_is_not_started() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn bad_address_is_reported() {
        let config = MetricsConfig {
            enabled: true,
            listen_addr: "not-an-address".to_string(),
        };
        let err = init_metrics(&config).unwrap_err();
        assert!(matches!(err, MetricsError::InvalidAddress { .. }));
    }

    #[test]
    fn recorders_without_exporter_are_noops() {
        record_risk_decision(false, &[RejectionCode::Halted]);
        record_order_transition(OrderState::Filled);
        record_retry_delay(Duration::from_millis(100));
        record_equity(Decimal::ONE_HUNDRED);
    }
}
