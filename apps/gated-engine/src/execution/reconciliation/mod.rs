//! Broker state reconciliation.
//!
//! Compares, independently, per-symbol positions, cash and total value
//! against a [`BrokerSnapshot`], then cross-references the lifecycle's open
//! and unconfirmed orders with the broker's view. Drift is reported, never
//! corrected, with one exception: lifecycle mismatches adopt the broker's
//! status, and any fills that adoption uncovers are handed back for the
//! caller to apply to the portfolio.

mod report;
mod snapshot;
mod trigger;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

pub use report::{MismatchKind, OrderMismatch, PositionDelta, ReconciliationResult, Severity};
pub use snapshot::BrokerSnapshot;
pub use trigger::{ReconcileTrigger, TriggerReason};

use super::OrderLifecycle;
use crate::audit::{self, AuditKind, SharedAuditSink};
use crate::broker::BrokerOrderStatus;
use crate::config::ReconciliationConfig;
use crate::models::{BrokerOrderId, OrderId, OrderState};
use crate::observability::metrics;
use crate::portfolio::{Fill, PortfolioState};
use crate::safety::KillSwitch;

/// Kill-switch reason used when severe drift halts trading.
pub const RECONCILIATION_DRIFT: &str = "reconciliation_drift";

/// A result plus the fills discovered while adopting broker truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// The audit record.
    pub result: ReconciliationResult,
    /// Fills the engine had not observed; apply them to the portfolio.
    pub adopted_fills: Vec<Fill>,
}

/// Compares engine state with broker state.
#[derive(Debug, Clone)]
pub struct Reconciler {
    config: ReconciliationConfig,
    kill_switch: Option<Arc<KillSwitch>>,
    audit: SharedAuditSink,
}

impl Reconciler {
    /// Create a reconciler that reports only.
    #[must_use]
    pub fn new(config: ReconciliationConfig, audit: SharedAuditSink) -> Self {
        Self {
            config,
            kill_switch: None,
            audit,
        }
    }

    /// Halt through `kill_switch` on severe drift when configured to.
    #[must_use]
    pub fn with_kill_switch(mut self, kill_switch: Arc<KillSwitch>) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Run one reconciliation.
    pub fn reconcile(
        &self,
        snapshot: &BrokerSnapshot,
        portfolio: &PortfolioState,
        lifecycle: &mut OrderLifecycle,
        marks: &BTreeMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let mut reasons = Vec::new();

        let position_deltas = self.compare_positions(snapshot, portfolio);
        let positions_pass = position_deltas.iter().all(|d| d.within_tolerance);
        for d in position_deltas.iter().filter(|d| !d.within_tolerance) {
            reasons.push(format!(
                "{}: engine holds {} but broker holds {} (delta {})",
                d.symbol, d.internal, d.broker, d.delta
            ));
        }

        let internal_cash = portfolio.cash();
        let cash_delta = internal_cash - snapshot.cash;
        let cash_pass = cash_delta.abs() <= self.config.cash_tolerance;
        if !cash_pass {
            reasons.push(format!(
                "cash: engine {internal_cash} vs broker {} (delta {cash_delta}, tolerance {})",
                snapshot.cash, self.config.cash_tolerance
            ));
        }

        let internal_value = portfolio.portfolio_value(marks);
        let broker_value = Self::broker_value(snapshot, portfolio, marks);
        let value_delta_pct = value_delta_pct(internal_value, broker_value);
        let value_pass = value_delta_pct <= self.config.value_tolerance_pct;
        if !value_pass {
            reasons.push(format!(
                "value: engine {internal_value} vs broker {broker_value} ({value_delta_pct}% off, tolerance {}%)",
                self.config.value_tolerance_pct
            ));
        }

        let (order_mismatches, adopted_fills) = Self::reconcile_orders(snapshot, lifecycle, now);
        let orders_pass = order_mismatches.iter().all(|m| !m.is_drift());
        for m in order_mismatches.iter().filter(|m| m.is_drift()) {
            reasons.push(format!("order {}: {}", m.broker_order_id, m.kind));
        }

        let all_pass = positions_pass && cash_pass && value_pass && orders_pass;
        let severity = if all_pass {
            Severity::Clean
        } else if self.is_severe(value_delta_pct, &position_deltas) {
            Severity::Severe
        } else {
            Severity::Drift
        };

        let result = ReconciliationResult {
            timestamp: now,
            position_deltas,
            internal_cash,
            broker_cash: snapshot.cash,
            cash_delta,
            internal_value,
            broker_value,
            value_delta_pct,
            positions_pass,
            cash_pass,
            value_pass,
            orders_pass,
            order_mismatches,
            severity,
            reasons,
        };

        self.report(&result);
        ReconcileOutcome {
            result,
            adopted_fills,
        }
    }

    fn compare_positions(
        &self,
        snapshot: &BrokerSnapshot,
        portfolio: &PortfolioState,
    ) -> Vec<PositionDelta> {
        let symbols: BTreeSet<&str> = portfolio
            .positions()
            .values()
            .filter(|p| !p.is_flat())
            .map(|p| p.symbol.as_str())
            .chain(
                snapshot
                    .positions
                    .iter()
                    .filter(|(_, q)| !q.is_zero())
                    .map(|(s, _)| s.as_str()),
            )
            .collect();

        symbols
            .into_iter()
            .map(|symbol| {
                let internal = portfolio.quantity(symbol);
                let broker = snapshot.positions.get(symbol).copied().unwrap_or_default();
                let delta = internal - broker;
                PositionDelta {
                    symbol: symbol.to_string(),
                    internal,
                    broker,
                    delta,
                    within_tolerance: delta.abs() <= self.config.position_tolerance,
                }
            })
            .collect()
    }

    fn broker_value(
        snapshot: &BrokerSnapshot,
        portfolio: &PortfolioState,
        marks: &BTreeMap<String, Decimal>,
    ) -> Decimal {
        snapshot.cash
            + snapshot
                .positions
                .iter()
                .map(|(symbol, quantity)| {
                    let mark = marks
                        .get(symbol)
                        .copied()
                        .or_else(|| portfolio.position(symbol).map(|p| p.average_cost))
                        .unwrap_or_default();
                    quantity * mark
                })
                .sum::<Decimal>()
    }

    fn is_severe(&self, value_delta_pct: Decimal, deltas: &[PositionDelta]) -> bool {
        value_delta_pct >= self.config.severe_value_pct
            || self
                .config
                .severe_position_units
                .is_some_and(|units| deltas.iter().any(|d| d.delta.abs() >= units))
    }

    fn reconcile_orders(
        snapshot: &BrokerSnapshot,
        lifecycle: &mut OrderLifecycle,
        now: DateTime<Utc>,
    ) -> (Vec<OrderMismatch>, Vec<Fill>) {
        let candidates: Vec<(OrderId, BrokerOrderId, OrderState, bool)> = lifecycle
            .orders()
            .filter_map(|o| {
                let unconfirmed = lifecycle.is_unconfirmed(o.id());
                if o.state().is_terminal() && !unconfirmed {
                    return None;
                }
                o.broker_order_id()
                    .map(|bid| (o.id().clone(), bid.clone(), o.state(), unconfirmed))
            })
            .collect();

        let mut mismatches = Vec::new();
        let mut fills = Vec::new();

        for (id, bid, local_state, unconfirmed) in candidates {
            if snapshot.open_orders.contains(&bid) {
                if unconfirmed {
                    mismatches.push(OrderMismatch {
                        kind: MismatchKind::OpenAtBroker,
                        order_id: Some(id),
                        broker_order_id: bid,
                        local_state: Some(local_state),
                        broker_status: None,
                        resolved_state: Some(local_state),
                    });
                }
                continue;
            }

            let Some(status) = snapshot.statuses.get(&bid) else {
                if unconfirmed {
                    lifecycle.confirm_closed(&id);
                    mismatches.push(OrderMismatch {
                        kind: MismatchKind::ConfirmedClosed,
                        order_id: Some(id),
                        broker_order_id: bid,
                        local_state: Some(local_state),
                        broker_status: None,
                        resolved_state: Some(local_state),
                    });
                } else {
                    mismatches.push(OrderMismatch {
                        kind: MismatchKind::MissingAtBroker,
                        order_id: Some(id),
                        broker_order_id: bid,
                        local_state: Some(local_state),
                        broker_status: None,
                        resolved_state: Some(local_state),
                    });
                }
                continue;
            };

            let filled_before = lifecycle.get(&id).map(|o| o.filled_quantity()).unwrap_or_default();
            match lifecycle.apply_broker_status(&id, status, now) {
                Ok(Some(fill)) => fills.push(fill),
                Ok(None) => {}
                Err(e) => warn!(order_id = %id, error = %e, "Could not adopt broker status"),
            }
            lifecycle.confirm_closed(&id);

            let order = lifecycle.get(&id);
            let resolved_state = order.map(|o| o.state());
            let filled_after = order.map(|o| o.filled_quantity()).unwrap_or_default();
            let kind = if unconfirmed && filled_after == filled_before && !matches!(status, BrokerOrderStatus::Accepted) {
                MismatchKind::ConfirmedClosed
            } else {
                MismatchKind::MissedTransition
            };
            mismatches.push(OrderMismatch {
                kind,
                order_id: Some(id),
                broker_order_id: bid,
                local_state: Some(local_state),
                broker_status: Some(status.clone()),
                resolved_state,
            });
        }

        for bid in &snapshot.open_orders {
            if lifecycle.by_broker_id(bid).is_none() {
                mismatches.push(OrderMismatch {
                    kind: MismatchKind::UnknownAtBroker,
                    order_id: None,
                    broker_order_id: bid.clone(),
                    local_state: None,
                    broker_status: None,
                    resolved_state: None,
                });
            }
        }

        (mismatches, fills)
    }

    fn report(&self, result: &ReconciliationResult) {
        match result.severity {
            Severity::Clean => info!(
                positions = result.position_deltas.len(),
                "Reconciliation clean"
            ),
            Severity::Drift => warn!(
                cash_delta = %result.cash_delta,
                value_delta_pct = %result.value_delta_pct,
                mismatches = result.order_mismatches.len(),
                reasons = ?result.reasons,
                "Reconciliation drift"
            ),
            Severity::Severe => error!(
                cash_delta = %result.cash_delta,
                value_delta_pct = %result.value_delta_pct,
                reasons = ?result.reasons,
                "Severe reconciliation drift"
            ),
        }
        metrics::record_reconciliation(result.severity.as_str());
        audit::emit(self.audit.as_ref(), AuditKind::Reconciliation, result.timestamp, result);

        if result.severity == Severity::Severe
            && self.config.halt_on_severe
            && let Some(kill_switch) = &self.kill_switch
        {
            kill_switch.trip(RECONCILIATION_DRIFT, result.timestamp);
        }
    }
}

/// `|internal - broker| / |broker| × 100`; 100 when only one side is zero.
fn value_delta_pct(internal: Decimal, broker: Decimal) -> Decimal {
    if broker.is_zero() {
        if internal.is_zero() {
            Decimal::ZERO
        } else {
            Decimal::ONE_HUNDRED
        }
    } else {
        (internal - broker).abs() / broker.abs() * Decimal::ONE_HUNDRED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::LifecycleConfig;
    use crate::execution::OrderIdGenerator;
    use crate::models::{OrderIntent, OrderSide, OrderType};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
    }

    fn lifecycle(sink: &Arc<MemoryAuditSink>) -> OrderLifecycle {
        OrderLifecycle::new(
            LifecycleConfig::default(),
            OrderIdGenerator::sequential("live"),
            sink.clone(),
        )
    }

    fn submit(lifecycle: &mut OrderLifecycle, broker_id: &str) -> OrderId {
        let intent = OrderIntent::new(
            "AAPL",
            OrderSide::Buy,
            dec!(10),
            OrderType::Market,
            dec!(100),
            "s",
            ts(),
            false,
        );
        let id = lifecycle.create(intent, ts());
        lifecycle
            .mark_submitted(&id, BrokerOrderId::new(broker_id), ts())
            .unwrap();
        id
    }

    fn reconciler(sink: &Arc<MemoryAuditSink>, cash_tolerance: Decimal) -> Reconciler {
        let config = ReconciliationConfig {
            cash_tolerance,
            value_tolerance_pct: dec!(1),
            ..ReconciliationConfig::default()
        };
        Reconciler::new(config, sink.clone())
    }

    #[test]
    fn cash_within_tolerance_passes() {
        let sink = Arc::new(MemoryAuditSink::new());
        let mut lifecycle = lifecycle(&sink);
        let portfolio = PortfolioState::new("USD", dec!(10000));
        let snapshot = BrokerSnapshot::with_cash(dec!(9950));

        let outcome = reconciler(&sink, dec!(50)).reconcile(
            &snapshot,
            &portfolio,
            &mut lifecycle,
            &BTreeMap::new(),
            ts(),
        );
        assert!(outcome.result.cash_pass);
        assert_eq!(outcome.result.cash_delta, dec!(50));

        let outcome = reconciler(&sink, dec!(10)).reconcile(
            &snapshot,
            &portfolio,
            &mut lifecycle,
            &BTreeMap::new(),
            ts(),
        );
        assert!(!outcome.result.cash_pass);
        assert_eq!(outcome.result.cash_delta, dec!(50));
        assert_eq!(outcome.result.severity, Severity::Drift);
        assert_eq!(sink.count(AuditKind::Reconciliation), 2);
    }

    #[test]
    fn position_drift_is_reported_not_corrected() {
        let sink = Arc::new(MemoryAuditSink::new());
        let mut lifecycle = lifecycle(&sink);
        let portfolio = PortfolioState::new("USD", dec!(10000));
        let snapshot = BrokerSnapshot::with_cash(dec!(10000)).position("MSFT", dec!(3));
        let marks = BTreeMap::from([("MSFT".to_string(), dec!(1))]);

        let outcome = reconciler(&sink, dec!(1)).reconcile(&snapshot, &portfolio, &mut lifecycle, &marks, ts());
        let delta = outcome.result.position_delta("MSFT").unwrap();
        assert_eq!(delta.delta, dec!(-3));
        assert!(!outcome.result.positions_pass);
        assert!(portfolio.position("MSFT").is_none());
    }

    #[test]
    fn out_of_band_fill_is_adopted() {
        let sink = Arc::new(MemoryAuditSink::new());
        let mut lifecycle = lifecycle(&sink);
        let id = submit(&mut lifecycle, "b-1");
        let portfolio = PortfolioState::new("USD", dec!(10000));
        let snapshot = BrokerSnapshot::with_cash(dec!(9000)).position("AAPL", dec!(10)).status(
            BrokerOrderId::new("b-1"),
            BrokerOrderStatus::Filled {
                cumulative_quantity: dec!(10),
                average_price: dec!(100),
            },
        );

        let outcome = reconciler(&sink, dec!(1)).reconcile(
            &snapshot,
            &portfolio,
            &mut lifecycle,
            &BTreeMap::new(),
            ts(),
        );
        assert_eq!(outcome.adopted_fills.len(), 1);
        assert_eq!(lifecycle.get(&id).unwrap().state(), OrderState::Filled);
        assert_eq!(outcome.result.order_mismatches[0].kind, MismatchKind::MissedTransition);
        assert!(!outcome.result.orders_pass);
    }

    #[test]
    fn expired_order_waits_for_broker_confirmation() {
        let sink = Arc::new(MemoryAuditSink::new());
        let mut lifecycle = lifecycle(&sink);
        let id = submit(&mut lifecycle, "b-1");
        lifecycle.sweep_timeouts(ts() + Duration::hours(2));
        assert!(lifecycle.is_unconfirmed(&id));
        let portfolio = PortfolioState::new("USD", dec!(10000));
        let reconciler = reconciler(&sink, dec!(1));

        let still_open = BrokerSnapshot::with_cash(dec!(10000)).open_order(BrokerOrderId::new("b-1"));
        let outcome = reconciler.reconcile(&still_open, &portfolio, &mut lifecycle, &BTreeMap::new(), ts());
        assert_eq!(outcome.result.order_mismatches[0].kind, MismatchKind::OpenAtBroker);
        assert_eq!(outcome.result.severity, Severity::Drift);
        assert!(lifecycle.is_unconfirmed(&id));

        let closed = BrokerSnapshot::with_cash(dec!(10000))
            .status(BrokerOrderId::new("b-1"), BrokerOrderStatus::Cancelled);
        let outcome = reconciler.reconcile(&closed, &portfolio, &mut lifecycle, &BTreeMap::new(), ts());
        assert_eq!(outcome.result.order_mismatches[0].kind, MismatchKind::ConfirmedClosed);
        assert_eq!(outcome.result.severity, Severity::Clean);
        assert!(!lifecycle.is_unconfirmed(&id));
    }

    #[test]
    fn unknown_broker_order_is_drift() {
        let sink = Arc::new(MemoryAuditSink::new());
        let mut lifecycle = lifecycle(&sink);
        let portfolio = PortfolioState::new("USD", dec!(10000));
        let snapshot = BrokerSnapshot::with_cash(dec!(10000)).open_order(BrokerOrderId::new("ghost"));
        let outcome = reconciler(&sink, dec!(1)).reconcile(
            &snapshot,
            &portfolio,
            &mut lifecycle,
            &BTreeMap::new(),
            ts(),
        );
        assert_eq!(outcome.result.order_mismatches[0].kind, MismatchKind::UnknownAtBroker);
        assert!(!outcome.result.passed());
    }

    #[test]
    fn severe_drift_trips_kill_switch() {
        let sink = Arc::new(MemoryAuditSink::new());
        let kill_switch = KillSwitch::in_memory(sink.clone());
        let mut lifecycle = lifecycle(&sink);
        let portfolio = PortfolioState::new("USD", dec!(10000));
        let snapshot = BrokerSnapshot::with_cash(dec!(8000));

        let outcome = reconciler(&sink, dec!(1))
            .with_kill_switch(kill_switch.clone())
            .reconcile(&snapshot, &portfolio, &mut lifecycle, &BTreeMap::new(), ts());
        assert_eq!(outcome.result.severity, Severity::Severe);
        assert!(kill_switch.is_tripped());
        assert_eq!(kill_switch.state().trip_reason.as_deref(), Some(RECONCILIATION_DRIFT));
    }

    #[test]
    fn value_delta_handles_zero_broker_value() {
        assert_eq!(value_delta_pct(Decimal::ZERO, Decimal::ZERO), Decimal::ZERO);
        assert_eq!(value_delta_pct(dec!(5), Decimal::ZERO), dec!(100));
        assert_eq!(value_delta_pct(dec!(110), dec!(100)), dec!(10));
    }
}
