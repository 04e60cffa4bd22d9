//! The per-bar pipeline both schedulers drive.
//!
//! quality check → market update → equity snapshot → strategy → risk gate →
//! order creation. Fill application and broker outcomes come back in through
//! [`BarPipeline::apply_fill`], [`BarPipeline::order_accepted`] and
//! [`BarPipeline::order_rejected`], so the backtest and the live loop share
//! every decision and every counter update.
//!
//! Guardrail counters run on market time (the latest bar timestamp), the
//! same clock the gate evaluates signals against.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::SchedulerError;
use crate::audit::{self, AuditKind, SharedAuditSink};
use crate::config::{Config, ConfigError};
use crate::context::EngineContext;
use crate::execution::{BrokerSnapshot, LifecycleError, OrderLifecycle, ReconcileOutcome, Reconciler};
use crate::market::MarketState;
use crate::models::{Bar, BarError, BrokerOrderId, OrderId, RiskDecision, Signal};
use crate::observability::metrics;
use crate::portfolio::{Fill, FillOutcome, PortfolioState};
use crate::risk::{GuardrailState, RiskContext, RiskGate, TradingDay};
use crate::safety::KillSwitch;
use crate::strategy::Strategy;

/// Reason the kill switch is tripped with when the reject streak hits its limit.
pub const CONSECUTIVE_REJECTS: &str = "consecutive_rejects";

/// Running totals for one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecisionStats {
    /// Bars received.
    pub bars: u64,
    /// Bars that failed the quality check.
    pub flagged_bars: u64,
    /// Signals produced by the strategy.
    pub signals: u64,
    /// Signals approved.
    pub approved: u64,
    /// Signals rejected.
    pub rejected: u64,
    /// Rejections per reason code.
    pub rejection_reasons: BTreeMap<String, u64>,
    /// Fills applied.
    pub fills: u64,
}

/// What happened to one bar.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BarOutcome {
    /// Quality failure; the bar was skipped.
    pub flagged: Option<BarError>,
    /// Gate decision, when the strategy produced a signal.
    pub decision: Option<RiskDecision>,
    /// Order created from an approval.
    pub order: Option<OrderId>,
}

/// Signal-to-order pipeline state.
#[derive(Debug)]
pub struct BarPipeline {
    gate: RiskGate,
    strategy: Box<dyn Strategy>,
    portfolio: PortfolioState,
    market: MarketState,
    guardrails: GuardrailState,
    lifecycle: OrderLifecycle,
    kill_switch: Arc<KillSwitch>,
    audit: SharedAuditSink,
    last_bar: BTreeMap<String, DateTime<Utc>>,
    market_time: Option<DateTime<Utc>>,
    max_consecutive_rejects: Option<u32>,
    resets_seen: usize,
    stats: DecisionStats,
}

impl BarPipeline {
    /// Build a pipeline from the context.
    pub fn new(ctx: &EngineContext, strategy: Box<dyn Strategy>) -> Result<Self, ConfigError> {
        let config: &Config = ctx.config();
        let calendar = TradingDay::from_config(&config.guardrails)?;
        Ok(Self {
            gate: ctx.risk_gate()?,
            strategy,
            portfolio: ctx.portfolio().with_trading_day(calendar),
            market: MarketState::new(config.risk.var.window),
            guardrails: GuardrailState::with_trading_day(calendar),
            lifecycle: ctx.lifecycle(),
            kill_switch: ctx.kill_switch().clone(),
            audit: ctx.audit().clone(),
            last_bar: BTreeMap::new(),
            market_time: None,
            max_consecutive_rejects: config.guardrails.max_consecutive_rejects,
            resets_seen: ctx.kill_switch().state().reset_trail.len(),
            stats: DecisionStats::default(),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Portfolio.
    #[must_use]
    pub const fn portfolio(&self) -> &PortfolioState {
        &self.portfolio
    }

    /// Market state.
    #[must_use]
    pub const fn market(&self) -> &MarketState {
        &self.market
    }

    /// Order lifecycle.
    #[must_use]
    pub const fn lifecycle(&self) -> &OrderLifecycle {
        &self.lifecycle
    }

    /// Mutable order lifecycle.
    pub const fn lifecycle_mut(&mut self) -> &mut OrderLifecycle {
        &mut self.lifecycle
    }

    /// Guardrail counters.
    #[must_use]
    pub const fn guardrails(&self) -> &GuardrailState {
        &self.guardrails
    }

    /// Kill switch.
    #[must_use]
    pub const fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.kill_switch
    }

    /// Decision totals so far.
    #[must_use]
    pub const fn stats(&self) -> &DecisionStats {
        &self.stats
    }

    /// Latest bar timestamp seen.
    #[must_use]
    pub const fn market_time(&self) -> Option<DateTime<Utc>> {
        self.market_time
    }

    // ========================================================================
    // Bar path
    // ========================================================================

    /// Run one bar through the pipeline up to order creation.
    ///
    /// `now` stamps lifecycle records; pass the bar time when replaying.
    pub fn on_bar(&mut self, bar: &Bar, now: DateTime<Utc>) -> BarOutcome {
        if let Err(flag) = self.check_quality(bar) {
            return BarOutcome {
                flagged: Some(flag),
                ..BarOutcome::default()
            };
        }
        self.process(bar, now)
    }

    /// Run a bar that already passed [`check_quality`](Self::check_quality).
    pub fn process(&mut self, bar: &Bar, now: DateTime<Utc>) -> BarOutcome {
        self.observe(bar);
        self.snapshot(bar.timestamp);
        self.halt_pending(now);

        let Some(signal) = self.generate_signal(bar) else {
            return BarOutcome::default();
        };
        let decision = self.decide(&signal);
        let order = self.create_order(&decision, now);
        BarOutcome {
            flagged: None,
            decision: Some(decision),
            order,
        }
    }

    /// Validate a bar and its ordering against the symbol's previous bar.
    ///
    /// Flagged bars are audited and must be skipped by the caller.
    pub fn check_quality(&mut self, bar: &Bar) -> Result<(), BarError> {
        self.stats.bars += 1;
        let verdict = bar.validate().and_then(|()| match self.last_bar.get(&bar.symbol) {
            Some(previous) if bar.timestamp <= *previous => Err(BarError::OutOfOrder {
                symbol: bar.symbol.clone(),
                previous: *previous,
                current: bar.timestamp,
            }),
            _ => Ok(()),
        });

        match verdict {
            Ok(()) => {
                self.last_bar.insert(bar.symbol.clone(), bar.timestamp);
                Ok(())
            }
            Err(flag) => {
                self.stats.flagged_bars += 1;
                warn!(symbol = %bar.symbol, timestamp = %bar.timestamp, reason = %flag, "Bar flagged");
                metrics::record_bar_flagged(flag_label(&flag));
                audit::emit(
                    self.audit.as_ref(),
                    AuditKind::BarFlagged,
                    bar.timestamp,
                    &serde_json::json!({
                        "symbol": bar.symbol,
                        "bar_timestamp": bar.timestamp,
                        "reason": flag_label(&flag),
                        "detail": flag.to_string(),
                    }),
                );
                Err(flag)
            }
        }
    }

    /// Feed a clean bar into market state.
    pub fn observe(&mut self, bar: &Bar) {
        self.market.observe(bar);
        if self.market_time.is_none_or(|t| bar.timestamp > t) {
            self.market_time = Some(bar.timestamp);
        }
    }

    /// Mark the book to market. Cash and positions are untouched.
    pub fn snapshot(&mut self, at: DateTime<Utc>) -> Decimal {
        let equity = self.portfolio.record_equity(at, &self.market.marks());
        metrics::record_equity(equity);
        equity
    }

    /// Ask the strategy for a signal.
    pub fn generate_signal(&mut self, bar: &Bar) -> Option<Signal> {
        let signal = self.strategy.on_bar(bar, &self.market)?;
        self.stats.signals += 1;
        Some(signal)
    }

    /// Evaluate a signal at the gate and record the decision.
    pub fn decide(&mut self, signal: &Signal) -> RiskDecision {
        self.sync_resets();
        let decision = self.gate.approve(
            signal,
            &self.portfolio,
            &RiskContext {
                halted: self.kill_switch.is_tripped(),
                guardrails: &self.guardrails,
                market: &self.market,
            },
        );

        let codes = decision.reason_codes();
        match &decision {
            RiskDecision::Approved(intent) => {
                self.stats.approved += 1;
                info!(
                    symbol = %intent.symbol(),
                    side = %intent.side(),
                    quantity = %intent.quantity(),
                    scaled_down = intent.scaled_down(),
                    "Signal approved"
                );
            }
            RiskDecision::Rejected(rejection) => {
                self.stats.rejected += 1;
                for code in &codes {
                    *self
                        .stats
                        .rejection_reasons
                        .entry(code.as_str().to_string())
                        .or_default() += 1;
                }
                debug!(
                    symbol = %rejection.symbol,
                    reasons = ?codes,
                    "Signal rejected"
                );
            }
        }
        metrics::record_risk_decision(decision.is_approved(), &codes);
        audit::emit(
            self.audit.as_ref(),
            AuditKind::RiskDecision,
            signal.timestamp(),
            &serde_json::json!({
                "signal": signal,
                "decision": decision,
            }),
        );
        decision
    }

    /// Turn an approval into a `CREATED` order.
    pub fn create_order(&mut self, decision: &RiskDecision, now: DateTime<Utc>) -> Option<OrderId> {
        let intent = decision.intent()?.clone();
        self.guardrails.record_order(intent.signal_timestamp());
        Some(self.lifecycle.create(intent, now))
    }

    /// Reject every unsubmitted order if the kill switch is tripped.
    pub fn halt_pending(&mut self, now: DateTime<Utc>) -> Vec<OrderId> {
        if !self.kill_switch.is_tripped() {
            return Vec::new();
        }
        let rejected = self.lifecycle.reject_unsubmitted("halted", now);
        if !rejected.is_empty() {
            warn!(count = rejected.len(), "Unsubmitted orders rejected: kill switch tripped");
        }
        rejected
    }

    // ========================================================================
    // Broker outcomes
    // ========================================================================

    /// Broker accepted an order.
    pub fn order_accepted(
        &mut self,
        id: &OrderId,
        broker_id: BrokerOrderId,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.lifecycle.mark_submitted(id, broker_id, now)?;
        self.guardrails.record_accept();
        Ok(())
    }

    /// Broker (or the engine on its behalf) refused an order.
    pub fn order_rejected(
        &mut self,
        id: &OrderId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.lifecycle.reject(id, reason, now)?;
        let symbol = self
            .lifecycle
            .get(id)
            .map(|o| o.symbol().to_string())
            .unwrap_or_default();
        self.record_order_reject(&symbol, now);
        Ok(())
    }

    /// Count an order-level reject against the guardrails.
    ///
    /// Trips the kill switch when the consecutive-reject limit is reached.
    pub fn record_order_reject(&mut self, symbol: &str, now: DateTime<Utc>) {
        let at = self.market_time.unwrap_or(now);
        self.guardrails.record_reject(symbol, at);
        let streak = self.guardrails.consecutive_rejects();
        if let Some(limit) = self.max_consecutive_rejects
            && streak >= limit
            && self.kill_switch.trip(CONSECUTIVE_REJECTS, now)
        {
            error!(streak, limit, "Consecutive order rejects tripped the kill switch");
        }
    }

    /// Apply a fill to the portfolio and audit it.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<FillOutcome, SchedulerError> {
        let outcome = self.portfolio.apply_fill(fill)?;
        if let FillOutcome::Applied { realized_pnl } = outcome {
            self.stats.fills += 1;
            metrics::record_fill(&fill.symbol, fill.side);
            audit::emit(
                self.audit.as_ref(),
                AuditKind::Fill,
                fill.timestamp,
                &serde_json::json!({
                    "fill": fill,
                    "realized_pnl": realized_pnl,
                    "cash": self.portfolio.cash(),
                    "position": self.portfolio.quantity(&fill.symbol),
                }),
            );
        }
        Ok(outcome)
    }

    /// Reconcile against a broker snapshot and apply any adopted fills.
    pub fn reconcile(
        &mut self,
        reconciler: &Reconciler,
        snapshot: &BrokerSnapshot,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let marks = self.market.marks();
        let outcome = reconciler.reconcile(snapshot, &self.portfolio, &mut self.lifecycle, &marks, now);
        for fill in &outcome.adopted_fills {
            if let Err(e) = self.apply_fill(fill) {
                error!(fill_id = %fill.fill_id, error = %e, "Adopted fill refused by portfolio");
            }
        }
        outcome
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// An audited operator reset also ends the reject streak that may have
    /// caused the trip.
    fn sync_resets(&mut self) {
        let resets = self.kill_switch.state().reset_trail.len();
        if resets > self.resets_seen {
            self.resets_seen = resets;
            self.guardrails.clear_streak();
            info!("Kill switch reset observed, reject streak cleared");
        }
    }
}

const fn flag_label(flag: &BarError) -> &'static str {
    match flag {
        BarError::NaiveTimestamp { .. } | BarError::InvalidTimestamp { .. } => "bad_timestamp",
        BarError::NonPositivePrice { .. } => "non_positive_price",
        BarError::InconsistentRange { .. } => "inconsistent_range",
        BarError::NegativeVolume { .. } => "negative_volume",
        BarError::OutOfOrder { .. } => "out_of_order",
    }
}
