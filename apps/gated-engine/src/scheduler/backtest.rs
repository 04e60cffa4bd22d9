//! Deterministic bar replay.
//!
//! Single-threaded and synchronous. An approved order is sent to a simulated
//! venue at once and fills in full at the open of the next bar for its
//! symbol, however many bars of other symbols come in between. Orders still
//! open when the data ends expire with reason `end_of_data`.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info};

use super::SchedulerError;
use super::pipeline::{BarOutcome, BarPipeline, DecisionStats};
use crate::config::ConfigError;
use crate::context::EngineContext;
use crate::models::{Bar, BrokerOrderId, OrderId};
use crate::portfolio::{EquityPoint, Fill};
use crate::strategy::Strategy;

/// Reason attached to orders open at the end of a replay.
pub const END_OF_DATA: &str = "end_of_data";

/// Result of a replay. Serializes identically for identical inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BacktestReport {
    /// Decision and fill totals.
    pub stats: DecisionStats,
    /// Every simulated fill, in execution order.
    pub fills: Vec<Fill>,
    /// Equity after each clean bar.
    pub equity_curve: Vec<EquityPoint>,
    /// Cash at the end.
    pub final_cash: Decimal,
    /// Cash plus marked positions at the end.
    pub final_equity: Decimal,
    /// Realized P&L net of commission.
    pub realized_pnl: Decimal,
    /// Largest peak-to-trough equity decline, as a fraction.
    pub max_drawdown: Decimal,
    /// Signed position per symbol at the end (flat symbols omitted).
    pub positions: BTreeMap<String, Decimal>,
    /// Orders expired because no later bar arrived to fill them.
    pub expired_orders: Vec<OrderId>,
}

impl BacktestReport {
    /// Pretty JSON for comparison and archiving.
    pub fn to_json(&self) -> Result<String, SchedulerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Replays a sorted bar sequence through the pipeline.
#[derive(Debug)]
pub struct BacktestScheduler {
    pipeline: BarPipeline,
    commission_per_share: Decimal,
    pending: BTreeMap<String, Vec<OrderId>>,
}

impl BacktestScheduler {
    /// Create a scheduler.
    pub fn new(ctx: &EngineContext, strategy: Box<dyn Strategy>) -> Result<Self, ConfigError> {
        Ok(Self {
            pipeline: BarPipeline::new(ctx, strategy)?,
            commission_per_share: ctx.config().backtest.commission_per_share,
            pending: BTreeMap::new(),
        })
    }

    /// The underlying pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &BarPipeline {
        &self.pipeline
    }

    /// Replay `bars` and produce the report.
    ///
    /// Bars are expected in ascending time order; a bar that goes back in
    /// time for its symbol is flagged and skipped.
    pub fn run(mut self, bars: &[Bar]) -> Result<BacktestReport, SchedulerError> {
        info!(bars = bars.len(), "Backtest started");
        for bar in bars {
            self.step(bar)?;
        }
        let report = self.finish();
        info!(
            fills = report.fills.len(),
            approved = report.stats.approved,
            rejected = report.stats.rejected,
            final_equity = %report.final_equity,
            "Backtest finished"
        );
        Ok(report)
    }

    /// Process one bar: fill pending orders at its open, then run the
    /// pipeline on it.
    pub fn step(&mut self, bar: &Bar) -> Result<BarOutcome, SchedulerError> {
        if let Err(flag) = self.pipeline.check_quality(bar) {
            return Ok(BarOutcome {
                flagged: Some(flag),
                ..BarOutcome::default()
            });
        }

        self.fill_pending(bar)?;

        let now = bar.timestamp;
        let outcome = self.pipeline.process(bar, now);
        if let Some(id) = &outcome.order {
            let venue_id = BrokerOrderId::new(format!("sim-{id}"));
            self.pipeline.order_accepted(id, venue_id, now)?;
            self.pending.entry(bar.symbol.clone()).or_default().push(id.clone());
            debug!(order_id = %id, symbol = %bar.symbol, "Order queued for next open");
        }
        Ok(outcome)
    }

    /// Expire leftovers and build the report.
    #[must_use]
    pub fn finish(mut self) -> BacktestReport {
        let expired = match self.pipeline.market_time() {
            Some(end) => self.pipeline.lifecycle_mut().expire_all_open(END_OF_DATA, end),
            None => Vec::new(),
        };
        for id in &expired {
            info!(order_id = %id, "Order expired at end of data");
        }

        let portfolio = self.pipeline.portfolio();
        let marks = self.pipeline.market().marks();
        BacktestReport {
            stats: self.pipeline.stats().clone(),
            fills: portfolio.fills().iter().cloned().collect(),
            equity_curve: portfolio.equity_curve().iter().copied().collect(),
            final_cash: portfolio.cash(),
            final_equity: portfolio.portfolio_value(&marks),
            realized_pnl: portfolio.realized_pnl(),
            max_drawdown: portfolio.max_drawdown(),
            positions: portfolio
                .positions()
                .iter()
                .filter(|(_, p)| !p.is_flat())
                .map(|(symbol, p)| (symbol.clone(), p.quantity))
                .collect(),
            expired_orders: expired,
        }
    }

    fn fill_pending(&mut self, bar: &Bar) -> Result<(), SchedulerError> {
        let Some(queue) = self.pending.remove(&bar.symbol) else {
            return Ok(());
        };
        for id in queue {
            let Some(remaining) = self
                .pipeline
                .lifecycle()
                .get(&id)
                .filter(|o| o.state().is_working())
                .map(|o| o.remaining_quantity())
            else {
                continue;
            };
            let commission = remaining * self.commission_per_share;
            let fill = match self.pipeline.lifecycle_mut().record_execution(
                &id,
                remaining,
                bar.open,
                commission,
                bar.timestamp,
            ) {
                Ok(fill) => fill,
                Err(e) => {
                    error!(order_id = %id, error = %e, "Simulated fill refused");
                    continue;
                }
            };
            self.pipeline.apply_fill(&fill)?;
        }
        Ok(())
    }
}
