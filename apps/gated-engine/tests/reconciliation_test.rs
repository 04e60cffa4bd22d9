//! Reconciliation tolerances, repeatability and adoption of broker truth
//! through a captured snapshot.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use test_case::test_case;

use gated_engine::broker::{BrokerHandle, BrokerPort, DefaultClassifier, OrderRequest, PaperBroker};
use gated_engine::config::{Config, EngineMode, PaperBrokerConfig};
use gated_engine::execution::{BrokerSnapshot, Severity};
use gated_engine::market::MarketState;
use gated_engine::risk::GuardrailState;
use gated_engine::{Bar, Direction, EngineContext, OrderState, RiskContext, Signal};

fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
}

fn context(cash: Decimal, cash_tolerance: Decimal) -> EngineContext {
    let mut config = Config::default();
    config.engine.mode = EngineMode::Paper;
    config.engine.initial_cash = cash;
    config.reconciliation.cash_tolerance = cash_tolerance;
    // Keep the value check out of the way so only cash decides.
    config.reconciliation.value_tolerance_pct = dec!(1);
    config.risk.var.enabled = false;
    EngineContext::in_memory(config).0
}

// =============================================================================
// Cash tolerance
// =============================================================================

#[test_case(dec!(50), true ; "delta equal to tolerance passes")]
#[test_case(dec!(10), false ; "delta above tolerance fails")]
fn cash_delta_against_tolerance(tolerance: Decimal, passes: bool) {
    let ctx = context(dec!(10000), tolerance);
    let portfolio = ctx.portfolio();
    let mut lifecycle = ctx.lifecycle();
    let snapshot = BrokerSnapshot::with_cash(dec!(9950));

    let outcome = ctx.reconciler().reconcile(
        &snapshot,
        &portfolio,
        &mut lifecycle,
        &BTreeMap::new(),
        ts(),
    );

    assert_eq!(outcome.result.cash_pass, passes);
    assert_eq!(outcome.result.passed(), passes);
    assert_eq!(outcome.result.cash_delta, dec!(50));
    if !passes {
        assert_eq!(outcome.result.severity, Severity::Drift);
        assert!(outcome.result.reasons[0].contains("delta 50"));
    }
}

// =============================================================================
// Repeatability
// =============================================================================

#[test]
fn repeated_runs_agree() {
    let ctx = context(dec!(10000), dec!(1));
    let portfolio = ctx.portfolio();
    let mut lifecycle = ctx.lifecycle();
    let marks = BTreeMap::from([("MSFT".to_string(), dec!(10))]);
    let snapshot = BrokerSnapshot::with_cash(dec!(9990)).position("MSFT", dec!(2));
    let reconciler = ctx.reconciler();

    let first = reconciler.reconcile(&snapshot, &portfolio, &mut lifecycle, &marks, ts());
    let second = reconciler.reconcile(&snapshot, &portfolio, &mut lifecycle, &marks, ts());

    assert_eq!(first.result.verdicts(), second.result.verdicts());
    assert_eq!(first.result.position_deltas, second.result.position_deltas);
    assert_eq!(first.result.cash_delta, second.result.cash_delta);
    assert_eq!(first.result.value_delta_pct, second.result.value_delta_pct);
    assert!(first.adopted_fills.is_empty() && second.adopted_fills.is_empty());
    // Drift is reported, never corrected.
    assert!(portfolio.position("MSFT").is_none());
}

// =============================================================================
// Snapshot capture and adoption
// =============================================================================

#[tokio::test]
async fn fill_seen_only_by_the_broker_is_adopted() {
    let ctx = context(dec!(100000), dec!(1));
    let paper = Arc::new(PaperBroker::new(&PaperBrokerConfig::default(), "USD", dec!(100000)));
    let broker = ctx.resilient(BrokerHandle {
        port: paper.clone(),
        classifier: Arc::new(DefaultClassifier),
    });

    // Approve and submit an order the normal way.
    let mut market = MarketState::new(10);
    market.observe(&Bar::new("AAPL", ts(), dec!(50), dec!(50), dec!(50), dec!(50), dec!(1)));
    paper.observe_price("AAPL", dec!(50));
    let mut portfolio = ctx.portfolio();
    let signal = Signal::new("AAPL", Direction::Long, 0.5, ts(), "s").unwrap();
    let guardrails = GuardrailState::new();
    let decision = ctx.risk_gate().unwrap().approve(
        &signal,
        &portfolio,
        &RiskContext {
            halted: false,
            guardrails: &guardrails,
            market: &market,
        },
    );
    let intent = decision.intent().unwrap().clone();
    let mut lifecycle = ctx.lifecycle();
    let id = lifecycle.create(intent, ts());
    let request = OrderRequest::from(lifecycle.get(&id).unwrap());
    let broker_id = broker.submit(&request).await.unwrap();
    lifecycle.mark_submitted(&id, broker_id, ts()).unwrap();

    // The broker fills it while the engine is not looking.
    paper.fill_all();

    let snapshot = BrokerSnapshot::capture(&broker, &lifecycle, ts()).await.unwrap();
    let outcome = ctx
        .reconciler()
        .reconcile(&snapshot, &portfolio, &mut lifecycle, &market.marks(), ts());

    assert_eq!(outcome.adopted_fills.len(), 1);
    assert_eq!(lifecycle.get(&id).unwrap().state(), OrderState::Filled);
    for fill in &outcome.adopted_fills {
        portfolio.apply_fill(fill).unwrap();
    }
    assert_eq!(portfolio.quantity("AAPL"), dec!(100));

    // Once adopted, the books agree.
    let again = ctx
        .reconciler()
        .reconcile(&snapshot, &portfolio, &mut lifecycle, &market.marks(), ts());
    assert!(again.result.positions_pass);
    assert!(again.result.cash_pass);
    assert!(again.adopted_fills.is_empty());
}
