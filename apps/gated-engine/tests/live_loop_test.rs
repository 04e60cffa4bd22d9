//! Live loop against the paper broker: partial fills, fill-count
//! reconciliation and drift escalation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use gated_engine::audit::{AuditKind, MemoryAuditSink};
use gated_engine::broker::{BrokerHandle, BrokerPort, DefaultClassifier, PaperBroker};
use gated_engine::config::{Config, EngineMode, PaperBrokerConfig};
use gated_engine::execution::reconciliation::RECONCILIATION_DRIFT;
use gated_engine::execution::{ReconciliationResult, Severity, Transition};
use gated_engine::scheduler::{ChannelFeed, LiveSummary, ReplayFeed};
use gated_engine::strategy::ScriptedStrategy;
use gated_engine::{Bar, Direction, EngineContext, LiveScheduler, OrderState};

// =============================================================================
// Helpers
// =============================================================================

fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
}

fn spy(price: Decimal) -> Bar {
    Bar::new("SPY", ts(), price, price, price, price, dec!(1000))
}

/// One SPY bar per day starting at `ts()`, all at `price`.
fn daily(count: i64, price: Decimal) -> Vec<Bar> {
    (0..count)
        .map(|day| {
            Bar::new(
                "SPY",
                ts() + chrono::Duration::days(day),
                price,
                price,
                price,
                price,
                dec!(1000),
            )
        })
        .collect()
}

fn config(initial_cash: Decimal) -> Config {
    let mut config = Config::default();
    config.engine.mode = EngineMode::Paper;
    config.engine.initial_cash = initial_cash;
    config.risk.var.enabled = false;
    config.broker.paper = PaperBrokerConfig {
        fill_slices: 3,
        commission_per_share: dec!(0.01),
    };
    config.reconciliation.interval_secs = 0;
    config.reconciliation.every_n_fills = Some(3);
    config.live.fill_poll_interval_ms = 100;
    config.live.heartbeat_interval_ms = 1_000;
    config
}

struct Harness {
    ctx: EngineContext,
    sink: Arc<MemoryAuditSink>,
    paper: Arc<PaperBroker>,
    cancel: CancellationToken,
}

fn harness(
    config: Config,
    broker_cash: Decimal,
    strategy: ScriptedStrategy,
) -> (Harness, LiveScheduler) {
    let (ctx, sink) = EngineContext::in_memory(config);
    let paper = Arc::new(PaperBroker::new(&ctx.config().broker.paper, "USD", broker_cash));
    let handle = BrokerHandle {
        port: paper.clone(),
        classifier: Arc::new(DefaultClassifier),
    };
    let cancel = CancellationToken::new();
    let live =
        LiveScheduler::new(&ctx, Box::new(strategy), ctx.resilient(handle), cancel.clone()).unwrap();
    (
        Harness {
            ctx,
            sink,
            paper,
            cancel,
        },
        live,
    )
}

/// Feed one bar, keep the feed open for `window`, then cancel.
async fn run_for(h: &Harness, live: LiveScheduler, bar: Bar, window: Duration) -> LiveSummary {
    let (tx, mut feed) = ChannelFeed::new(4);
    tx.send(Ok(bar)).await.unwrap();
    let stopper = h.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(window).await;
        stopper.cancel();
    });
    let summary = live.run(&mut feed).await.unwrap();
    drop(tx);
    summary
}

fn transitions(sink: &MemoryAuditSink) -> Vec<Transition> {
    sink.of_kind(AuditKind::OrderTransition)
        .into_iter()
        .map(|e| serde_json::from_value(e.payload).unwrap())
        .collect()
}

fn reconciliations(sink: &MemoryAuditSink) -> Vec<ReconciliationResult> {
    sink.of_kind(AuditKind::Reconciliation)
        .into_iter()
        .map(|e| serde_json::from_value(e.payload).unwrap())
        .collect()
}

// =============================================================================
// Partial fills
// =============================================================================

#[tokio::test(start_paused = true)]
async fn three_partials_fill_the_order_exactly_once() {
    // 10% of 90,000 at 100 is 90 shares, filled in slices of 30.
    let strategy = ScriptedStrategy::new("s").at("SPY", ts(), Direction::Long, 1.0);
    let (h, live) = harness(config(dec!(90000)), dec!(90000), strategy);

    let summary = run_for(&h, live, spy(dec!(100)), Duration::from_secs(2)).await;

    assert_eq!(summary.submitted, 1);
    assert_eq!(summary.stats.fills, 3);
    let transitions = transitions(&h.sink);
    let filled = transitions.iter().filter(|t| t.to == OrderState::Filled).count();
    let partial = transitions
        .iter()
        .filter(|t| t.to == OrderState::PartiallyFilled)
        .count();
    assert_eq!(filled, 1);
    assert_eq!(partial, 2);
    assert_eq!(transitions.last().unwrap().filled_quantity, dec!(90));
}

#[tokio::test(start_paused = true)]
async fn fill_count_trigger_reconciles_clean() {
    let strategy = ScriptedStrategy::new("s").at("SPY", ts(), Direction::Long, 1.0);
    let (h, live) = harness(config(dec!(90000)), dec!(90000), strategy);

    let summary = run_for(&h, live, spy(dec!(100)), Duration::from_secs(2)).await;

    // One run after the third fill, one on shutdown.
    assert_eq!(summary.reconciliations, 2);
    assert_eq!(summary.drift_runs, 0);
    assert!(!summary.halted);
    for result in reconciliations(&h.sink) {
        assert_eq!(result.severity, Severity::Clean);
        assert_eq!(result.cash_delta, Decimal::ZERO);
    }
    // 90 × 100 plus 0.90 commission.
    assert_eq!(h.paper.cash().await.unwrap(), dec!(80999.10));
}

// =============================================================================
// Drift
// =============================================================================

#[tokio::test(start_paused = true)]
async fn cash_drift_is_reported_without_halting() {
    let (h, live) = harness(config(dec!(100000)), dec!(99000), ScriptedStrategy::new("s"));
    let mut feed = ReplayFeed::new(Vec::<Bar>::new());

    let summary = live.run(&mut feed).await.unwrap();

    assert_eq!(summary.reconciliations, 1);
    assert_eq!(summary.drift_runs, 1);
    assert!(!summary.halted);
    let result = reconciliations(&h.sink).pop().unwrap();
    assert!(!result.cash_pass);
    assert_eq!(result.cash_delta, dec!(1000));
    assert_eq!(result.severity, Severity::Drift);
}

#[tokio::test(start_paused = true)]
async fn severe_drift_trips_the_kill_switch() {
    let (h, live) = harness(config(dec!(100000)), dec!(80000), ScriptedStrategy::new("s"));
    let mut feed = ReplayFeed::new(Vec::<Bar>::new());

    let summary = live.run(&mut feed).await.unwrap();

    assert!(summary.halted);
    assert_eq!(
        h.ctx.kill_switch().state().trip_reason.as_deref(),
        Some(RECONCILIATION_DRIFT)
    );
}

// =============================================================================
// Paced feeds
// =============================================================================

#[tokio::test(start_paused = true)]
async fn paced_replay_at_poll_cadence_delivers_every_bar() {
    let strategy = ScriptedStrategy::new("s").at("SPY", ts(), Direction::Long, 1.0);
    let (h, live) = harness(config(dec!(90000)), dec!(90000), strategy);
    let pace = h.ctx.config().live.fill_poll_interval();
    let mut feed = ReplayFeed::new(daily(3, dec!(100))).with_pace(pace);

    let summary = live.run(&mut feed).await.unwrap();

    assert_eq!(feed.remaining(), 0);
    assert_eq!(summary.stats.bars, 3);
    assert_eq!(summary.stats.flagged_bars, 0);
    assert_eq!(summary.submitted, 1);
    assert_eq!(summary.stats.fills, 3);
    assert_eq!(summary.feed_failures, 0);
    assert!(!summary.halted);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_between_slow_bars_are_not_silence() {
    let mut config = config(dec!(100000));
    config.live.heartbeat_interval_ms = 1_000;
    config.live.silence_timeout_secs = 5;
    let (h, live) = harness(config, dec!(100000), ScriptedStrategy::new("s"));
    let mut feed = ReplayFeed::new(daily(3, dec!(100))).with_pace(Duration::from_secs(3));

    let summary = live.run(&mut feed).await.unwrap();

    assert_eq!(summary.stats.bars, 3);
    assert!(summary.heartbeats >= 6, "heartbeats: {}", summary.heartbeats);
    assert_eq!(summary.feed_failures, 0);
    assert_eq!(h.sink.count(AuditKind::FeedReconnect), 0);
    assert!(!summary.halted);
    assert!(!h.ctx.kill_switch().is_tripped());
}
