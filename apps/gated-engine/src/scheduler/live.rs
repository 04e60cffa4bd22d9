//! Live/paper event loop.
//!
//! One task multiplexes bar delivery, fill polling and heartbeats with
//! `tokio::select!`, so the risk gate never runs concurrently and the
//! portfolio is only touched from this loop. Broker calls go through the
//! [`ResilienceWrapper`]; the feed gets its own reconnect backoff and
//! failure limit, which trips the kill switch when exhausted.

use chrono::Utc;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SchedulerError;
use super::feed::BarFeed;
use super::heartbeat::{HeartbeatEvent, HeartbeatMonitor};
use super::pipeline::{BarPipeline, DecisionStats};
use crate::audit::{self, AuditKind, SharedAuditSink};
use crate::broker::{ExponentialBackoffCalculator, OrderRequest};
use crate::config::{ConfigError, LiveConfig};
use crate::context::EngineContext;
use crate::execution::{
    BrokerSnapshot, ReconcileOutcome, ReconcileTrigger, Reconciler, TriggerReason,
};
use crate::models::{Bar, BrokerOrderId, OrderId, OrderState};
use crate::observability::metrics;
use crate::resilience::{ResilienceError, ResilienceWrapper};
use crate::strategy::Strategy;

/// Kill switch reason when the feed failure limit is reached.
pub const FEED_FAILURE: &str = "feed_failure";

/// Totals for one live session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveSummary {
    /// Pipeline totals.
    pub stats: DecisionStats,
    /// Orders the broker accepted.
    pub submitted: u64,
    /// Orders rejected at submission.
    pub submit_failures: u64,
    /// Orders closed by a timeout.
    pub timeouts: u64,
    /// Reconciliation runs completed.
    pub reconciliations: u64,
    /// Runs that found drift.
    pub drift_runs: u64,
    /// Feed failures observed.
    pub feed_failures: u64,
    /// Heartbeats emitted.
    pub heartbeats: u64,
    /// Kill switch state at exit.
    pub halted: bool,
}

/// Drives the pipeline from a bar feed against a broker.
#[derive(Debug)]
pub struct LiveScheduler {
    pipeline: BarPipeline,
    broker: ResilienceWrapper,
    reconciler: Reconciler,
    trigger: ReconcileTrigger,
    config: LiveConfig,
    audit: SharedAuditSink,
    cancel: CancellationToken,
    summary: LiveSummary,
}

impl LiveScheduler {
    /// Create a loop over `broker`, stopped by `cancel`.
    pub fn new(
        ctx: &EngineContext,
        strategy: Box<dyn Strategy>,
        broker: ResilienceWrapper,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            pipeline: BarPipeline::new(ctx, strategy)?,
            broker,
            reconciler: ctx.reconciler(),
            trigger: ctx.reconcile_trigger(),
            config: ctx.config().live.clone(),
            audit: ctx.audit().clone(),
            cancel,
            summary: LiveSummary::default(),
        })
    }

    /// The underlying pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &BarPipeline {
        &self.pipeline
    }

    /// Run until the feed ends or the token is cancelled.
    ///
    /// Pending fills are polled once more on the way out, and a final
    /// reconciliation runs when reconciliation is enabled.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::FeedFailed`] once consecutive feed failures reach
    /// the limit; the kill switch is tripped first.
    pub async fn run(mut self, feed: &mut dyn BarFeed) -> Result<LiveSummary, SchedulerError> {
        let cancel = self.cancel.clone();
        let mut poll = tokio::time::interval(self.config.fill_poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut monitor = HeartbeatMonitor::new(self.config.silence_timeout());
        let mut reconnect = ExponentialBackoffCalculator::unbounded(&self.config.reconnect_policy());
        let mut failures: u32 = 0;

        info!(broker = %self.broker.broker().name(), "Live loop started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Live loop cancelled");
                    break;
                }
                _ = poll.tick() => self.poll_fills().await,
                _ = heartbeat.tick() => match monitor.check() {
                    HeartbeatEvent::Alive { since_last } => self.beat(since_last),
                    HeartbeatEvent::Silent { since_last } => {
                        let detail = format!("no bars for {}s", since_last.as_secs());
                        self.feed_failure(feed, &mut failures, &mut reconnect, &detail).await?;
                        monitor.record_activity();
                    }
                },
                next = feed.next_bar() => match next {
                    Ok(Some(bar)) => {
                        failures = 0;
                        reconnect.reset();
                        monitor.record_activity();
                        self.handle_bar(&bar).await;
                    }
                    Ok(None) => {
                        info!("Feed exhausted");
                        break;
                    }
                    Err(e) => {
                        self.feed_failure(feed, &mut failures, &mut reconnect, &e.to_string()).await?;
                        monitor.record_activity();
                    }
                },
            }
        }

        self.poll_fills().await;
        if self.reconciler.config().enabled {
            self.reconcile(TriggerReason::Manual).await;
        }
        Ok(self.summary())
    }

    /// Totals so far.
    #[must_use]
    pub fn summary(&self) -> LiveSummary {
        LiveSummary {
            stats: self.pipeline.stats().clone(),
            halted: self.pipeline.kill_switch().is_tripped(),
            ..self.summary.clone()
        }
    }

    // ========================================================================
    // Bar path
    // ========================================================================

    async fn handle_bar(&mut self, bar: &Bar) {
        self.broker.broker().observe_price(&bar.symbol, bar.close);
        let outcome = self.pipeline.on_bar(bar, Utc::now());
        if let Some(id) = outcome.order {
            self.submit(&id).await;
        }
    }

    async fn submit(&mut self, id: &OrderId) {
        let Some(request) = self.pipeline.lifecycle().get(id).map(OrderRequest::from) else {
            return;
        };
        match self.broker.submit(&request).await {
            Ok(broker_id) => {
                self.summary.submitted += 1;
                if let Err(e) = self.pipeline.order_accepted(id, broker_id, Utc::now()) {
                    error!(order_id = %id, error = %e, "Accepted order could not be recorded");
                }
            }
            Err(e) => {
                self.summary.submit_failures += 1;
                warn!(order_id = %id, error = %e, "Order submission failed");
                if let Err(le) = self.pipeline.order_rejected(id, &submission_reason(&e), Utc::now()) {
                    error!(order_id = %id, error = %le, "Rejected order could not be recorded");
                }
            }
        }
        self.pipeline.halt_pending(Utc::now());
    }

    // ========================================================================
    // Fill polling
    // ========================================================================

    /// Poll every working order, apply fills, sweep timeouts and run a
    /// reconciliation when one is due.
    ///
    /// Each status is stamped when it arrives, so fills on a slow poll carry
    /// the time the broker reported them rather than when polling began.
    pub async fn poll_fills(&mut self) {
        let working: Vec<(OrderId, BrokerOrderId)> = self
            .pipeline
            .lifecycle()
            .open_orders()
            .into_iter()
            .filter_map(|o| o.broker_order_id().map(|b| (o.id().clone(), b.clone())))
            .collect();

        for (id, broker_id) in working {
            let status = match self.broker.order_status(&broker_id).await {
                Ok(status) => status,
                Err(ResilienceError::Halted { .. }) => {
                    debug!("Fill polling paused: kill switch tripped");
                    break;
                }
                Err(e) => {
                    warn!(order_id = %id, error = %e, "Order status unavailable");
                    continue;
                }
            };

            let now = Utc::now();
            match self.pipeline.lifecycle_mut().apply_broker_status(&id, &status, now) {
                Ok(Some(fill)) => {
                    self.trigger.record_fill();
                    if let Err(e) = self.pipeline.apply_fill(&fill) {
                        error!(fill_id = %fill.fill_id, error = %e, "Fill refused by portfolio");
                    }
                }
                Ok(None) => {
                    let rejected = self
                        .pipeline
                        .lifecycle()
                        .get(&id)
                        .filter(|o| o.state() == OrderState::Rejected)
                        .map(|o| o.symbol().to_string());
                    if let Some(symbol) = rejected {
                        self.pipeline.record_order_reject(&symbol, now);
                    }
                }
                Err(e) => warn!(order_id = %id, error = %e, "Broker status refused by lifecycle"),
            }
        }

        let now = Utc::now();
        for timed_out in self.pipeline.lifecycle_mut().sweep_timeouts(now) {
            self.summary.timeouts += 1;
            if timed_out.state == OrderState::Rejected {
                self.pipeline.record_order_reject(&timed_out.symbol, now);
            }
            if let Some(broker_id) = timed_out.broker_order_id
                && let Err(e) = self.broker.cancel(&broker_id).await
            {
                warn!(order_id = %timed_out.order_id, error = %e, "Cancel after timeout failed");
            }
        }

        if self.reconciler.config().enabled
            && let Some(reason) = self.trigger.due(now)
        {
            self.reconcile(reason).await;
        }

        self.pipeline
            .lifecycle_mut()
            .prune_closed(self.config.retained_closed_orders);
    }

    /// Snapshot the broker and reconcile. Returns `None` if the snapshot
    /// could not be taken.
    pub async fn reconcile(&mut self, reason: TriggerReason) -> Option<ReconcileOutcome> {
        let now = Utc::now();
        debug!(reason = ?reason, "Reconciliation triggered");
        let snapshot = match BrokerSnapshot::capture(&self.broker, self.pipeline.lifecycle(), now).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Reconciliation skipped: broker snapshot failed");
                return None;
            }
        };
        let outcome = self.pipeline.reconcile(&self.reconciler, &snapshot, now);
        self.trigger.mark_run(now);
        self.summary.reconciliations += 1;
        if !outcome.result.passed() {
            self.summary.drift_runs += 1;
        }
        Some(outcome)
    }

    // ========================================================================
    // Feed health
    // ========================================================================

    fn beat(&mut self, since_last: std::time::Duration) {
        self.summary.heartbeats += 1;
        audit::emit(
            self.audit.as_ref(),
            AuditKind::Heartbeat,
            Utc::now(),
            &serde_json::json!({
                "since_last_bar_ms": since_last.as_millis() as u64,
                "open_orders": self.pipeline.lifecycle().open_orders().len(),
                "halted": self.pipeline.kill_switch().is_tripped(),
            }),
        );
    }

    async fn feed_failure(
        &mut self,
        feed: &mut dyn BarFeed,
        failures: &mut u32,
        backoff: &mut ExponentialBackoffCalculator,
        detail: &str,
    ) -> Result<(), SchedulerError> {
        *failures += 1;
        self.summary.feed_failures += 1;
        metrics::record_feed_reconnect();
        let limit = self.config.max_feed_failures.max(1);
        audit::emit(
            self.audit.as_ref(),
            AuditKind::FeedReconnect,
            Utc::now(),
            &serde_json::json!({ "failures": *failures, "limit": limit, "detail": detail }),
        );

        if *failures >= limit {
            if self.pipeline.kill_switch().trip(FEED_FAILURE, Utc::now()) {
                error!(failures = *failures, detail, "Feed failure limit reached, halting");
            }
            return Err(SchedulerError::FeedFailed {
                failures: *failures,
                last_error: detail.to_string(),
            });
        }

        let delay = backoff
            .next_backoff()
            .unwrap_or_else(|| self.config.reconnect_policy().max_backoff);
        warn!(
            failures = *failures,
            limit,
            delay_ms = delay.as_millis() as u64,
            detail,
            "Feed failure, reconnecting"
        );
        tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(delay) => {}
        }
        if let Err(e) = feed.reconnect().await {
            warn!(error = %e, "Feed reconnect failed");
        }
        Ok(())
    }
}

fn submission_reason(err: &ResilienceError) -> String {
    match err {
        ResilienceError::Halted { .. } => "halted".to_string(),
        ResilienceError::CircuitTripped { .. } => "broker_circuit_breaker".to_string(),
        ResilienceError::RetriesExhausted { .. } => "broker_unavailable".to_string(),
        ResilienceError::Terminal { error, .. } => format!("broker_rejected: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::broker::{
        BrokerError, BrokerHandle, BrokerOrderStatus, BrokerPort, DefaultClassifier, PaperBroker,
    };
    use crate::portfolio::Position;
    use crate::config::{Config, EngineMode, PaperBrokerConfig};
    use crate::models::Direction;
    use crate::scheduler::feed::{ChannelFeed, FeedError, ReplayFeed};
    use crate::strategy::ScriptedStrategy;
    use chrono::{DateTime, TimeZone};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn ts(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap() + chrono::Duration::days(day)
    }

    fn bar(day: i64, close: Decimal) -> Bar {
        Bar::new("SPY", ts(day), close, close, close, close, dec!(1000))
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.engine.mode = EngineMode::Paper;
        config.risk.var.enabled = false;
        config.reconciliation.enabled = false;
        config.live.fill_poll_interval_ms = 100;
        config.live.heartbeat_interval_ms = 1_000;
        config.live.max_feed_failures = 3;
        config.live.reconnect_initial_ms = 10;
        config.live.reconnect_max_ms = 50;
        config
    }

    fn scheduler(
        config: Config,
        strategy: ScriptedStrategy,
    ) -> (LiveScheduler, Arc<PaperBroker>, CancellationToken) {
        let (ctx, _) = EngineContext::in_memory(config);
        let paper = Arc::new(PaperBroker::new(&PaperBrokerConfig::default(), "USD", dec!(100000)));
        let handle = BrokerHandle {
            port: paper.clone(),
            classifier: Arc::new(DefaultClassifier),
        };
        let cancel = CancellationToken::new();
        let live = LiveScheduler::new(&ctx, Box::new(strategy), ctx.resilient(handle), cancel.clone())
            .unwrap();
        (live, paper, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn approved_signal_is_submitted_and_filled() {
        let strategy = ScriptedStrategy::new("s").at("SPY", ts(0), Direction::Long, 1.0);
        let (live, paper, _cancel) = scheduler(config(), strategy);
        let mut feed = ReplayFeed::new([bar(0, dec!(100))]);

        let summary = live.run(&mut feed).await.unwrap();

        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.stats.fills, 1);
        assert!(!summary.halted);
        assert!(paper.call_count() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_submit_error_rejects_order() {
        let strategy = ScriptedStrategy::new("s").at("SPY", ts(0), Direction::Long, 1.0);
        let (live, paper, _cancel) = scheduler(config(), strategy);
        paper.inject_faults(1, &BrokerError::Unauthorized("bad key".into()));
        let mut feed = ReplayFeed::new([bar(0, dec!(100))]);

        let summary = live.run(&mut feed).await.unwrap();

        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.submit_failures, 1);
        assert_eq!(summary.stats.fills, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_feed_failures_trip_kill_switch() {
        let (live, _paper, _cancel) = scheduler(config(), ScriptedStrategy::new("s"));
        let kill_switch = live.pipeline().kill_switch().clone();
        let (tx, mut feed) = ChannelFeed::new(8);
        for _ in 0..3 {
            tx.send(Err(FeedError::Disconnected("reset by peer".into()))).await.unwrap();
        }

        let err = live.run(&mut feed).await.unwrap_err();

        let SchedulerError::FeedFailed { failures, .. } = err else {
            panic!("expected FeedFailed, got {err}");
        };
        assert_eq!(failures, 3);
        assert!(kill_switch.is_tripped());
        assert_eq!(kill_switch.state().trip_reason.as_deref(), Some(FEED_FAILURE));
    }

    /// Paper broker whose status queries take `delay` of wall time.
    #[derive(Debug)]
    struct SlowStatus {
        inner: Arc<PaperBroker>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl BrokerPort for SlowStatus {
        fn name(&self) -> &str {
            "slow-status"
        }

        async fn submit(&self, order: &OrderRequest) -> Result<BrokerOrderId, BrokerError> {
            self.inner.submit(order).await
        }

        async fn cancel(&self, id: &BrokerOrderId) -> Result<(), BrokerError> {
            self.inner.cancel(id).await
        }

        async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
            self.inner.positions().await
        }

        async fn cash(&self) -> Result<Decimal, BrokerError> {
            self.inner.cash().await
        }

        async fn order_status(&self, id: &BrokerOrderId) -> Result<BrokerOrderStatus, BrokerError> {
            tokio::time::sleep(self.delay).await;
            self.inner.order_status(id).await
        }

        async fn open_orders(&self) -> Result<Vec<BrokerOrderId>, BrokerError> {
            self.inner.open_orders().await
        }

        fn observe_price(&self, symbol: &str, price: Decimal) {
            self.inner.observe_price(symbol, price);
        }
    }

    #[tokio::test]
    async fn fills_are_stamped_when_their_status_arrives() {
        let strategy = ScriptedStrategy::new("s")
            .at("QQQ", ts(0), Direction::Long, 1.0)
            .at("SPY", ts(0), Direction::Long, 1.0);
        let (ctx, sink) = EngineContext::in_memory(config());
        let handle = BrokerHandle {
            port: Arc::new(SlowStatus {
                inner: Arc::new(PaperBroker::new(&PaperBrokerConfig::default(), "USD", dec!(100000))),
                delay: Duration::from_millis(50),
            }),
            classifier: Arc::new(DefaultClassifier),
        };
        let live = LiveScheduler::new(&ctx, Box::new(strategy), ctx.resilient(handle), CancellationToken::new())
            .unwrap();
        let qqq = Bar::new("QQQ", ts(0), dec!(100), dec!(100), dec!(100), dec!(100), dec!(1000));
        let mut feed = ReplayFeed::new([qqq, bar(0, dec!(100))]);

        let summary = live.run(&mut feed).await.unwrap();

        assert_eq!(summary.stats.fills, 2);
        let stamps: Vec<DateTime<Utc>> = sink
            .of_kind(AuditKind::Fill)
            .into_iter()
            .map(|e| serde_json::from_value(e.payload["fill"]["timestamp"].clone()).unwrap())
            .collect();
        assert_eq!(stamps.len(), 2);
        assert!(stamps[1] - stamps[0] >= chrono::Duration::milliseconds(50));
    }

    #[tokio::test(start_paused = true)]
    async fn long_sessions_hold_bounded_history() {
        let mut strategy = ScriptedStrategy::new("s");
        for day in 0..8 {
            let direction = if day % 2 == 0 { Direction::Long } else { Direction::Close };
            strategy = strategy.at("SPY", ts(day), direction, 1.0);
        }
        let mut config = config();
        config.live.retained_closed_orders = 2;
        config.live.history_limit = 3;
        let (mut live, _paper, _cancel) = scheduler(config, strategy);

        for day in 0..8 {
            live.handle_bar(&bar(day, dec!(100))).await;
            live.poll_fills().await;
        }

        let pipeline = live.pipeline();
        assert!(live.summary().submitted >= 4);
        assert!(pipeline.lifecycle().open_orders().is_empty());
        assert_eq!(pipeline.lifecycle().len(), 2);
        assert!(pipeline.lifecycle().transitions().len() <= 2 * 4);
        assert!(pipeline.portfolio().fills().len() <= 3);
        assert!(pipeline.portfolio().equity_curve().len() <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let (live, _paper, cancel) = scheduler(config(), ScriptedStrategy::new("s"));
        let (_tx, mut feed) = ChannelFeed::new(1);
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            stopper.cancel();
        });

        let summary = live.run(&mut feed).await.unwrap();
        assert_eq!(summary.stats.bars, 0);
        assert!(!summary.halted);
    }
}
