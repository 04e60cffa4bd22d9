//! Shared handles every component is built from.

use std::sync::Arc;

use crate::audit::{MemoryAuditSink, SharedAuditSink};
use crate::broker::BrokerHandle;
use crate::config::{Config, ConfigError};
use crate::execution::{OrderIdGenerator, OrderLifecycle, ReconcileTrigger, Reconciler};
use crate::portfolio::PortfolioState;
use crate::resilience::ResilienceWrapper;
use crate::risk::RiskGate;
use crate::safety::{FileKillSwitchStore, KillSwitch};

/// Configuration plus the process-wide kill switch and audit sink.
///
/// Cheap to clone; the switch and sink are shared.
#[derive(Debug, Clone)]
pub struct EngineContext {
    config: Arc<Config>,
    kill_switch: Arc<KillSwitch>,
    audit: SharedAuditSink,
}

impl EngineContext {
    /// Assemble a context from prepared parts.
    #[must_use]
    pub fn new(config: Config, kill_switch: Arc<KillSwitch>, audit: SharedAuditSink) -> Self {
        Self {
            config: Arc::new(config),
            kill_switch,
            audit,
        }
    }

    /// Context whose kill switch is persisted at the configured path.
    #[must_use]
    pub fn open(config: Config, audit: SharedAuditSink) -> Self {
        let store = FileKillSwitchStore::new(&config.kill_switch.state_path);
        let kill_switch = Arc::new(KillSwitch::open(Box::new(store), audit.clone()));
        Self::new(config, kill_switch, audit)
    }

    /// Self-contained context for a replay: in-memory switch and audit log.
    #[must_use]
    pub fn in_memory(config: Config) -> (Self, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let audit: SharedAuditSink = sink.clone();
        let kill_switch = KillSwitch::in_memory(audit.clone());
        (Self::new(config, kill_switch, audit), sink)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Kill switch.
    #[must_use]
    pub const fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.kill_switch
    }

    /// Audit sink.
    #[must_use]
    pub const fn audit(&self) -> &SharedAuditSink {
        &self.audit
    }

    // ========================================================================
    // Component factories
    // ========================================================================

    /// Starting portfolio. Outside backtests its history is bounded so a
    /// long-running engine does not accumulate every fill and mark.
    #[must_use]
    pub fn portfolio(&self) -> PortfolioState {
        let portfolio = PortfolioState::new(
            &self.config.engine.base_currency,
            self.config.engine.initial_cash,
        );
        if self.config.engine.mode.is_backtest() {
            portfolio
        } else {
            portfolio.with_history_limit(self.config.live.history_limit)
        }
    }

    /// Risk gate.
    pub fn risk_gate(&self) -> Result<RiskGate, ConfigError> {
        RiskGate::from_config(&self.config)
    }

    /// Order lifecycle with mode-appropriate IDs: sequential when
    /// replaying, random otherwise.
    #[must_use]
    pub fn lifecycle(&self) -> OrderLifecycle {
        let ids = if self.config.engine.mode.is_backtest() {
            OrderIdGenerator::sequential("bt")
        } else {
            OrderIdGenerator::Uuid
        };
        OrderLifecycle::new(self.config.lifecycle.clone(), ids, self.audit.clone())
            .with_commission_per_share(self.config.broker.paper.commission_per_share)
    }

    /// Reconciler wired to the kill switch.
    #[must_use]
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.config.reconciliation.clone(), self.audit.clone())
            .with_kill_switch(self.kill_switch.clone())
    }

    /// Reconciliation trigger.
    #[must_use]
    pub fn reconcile_trigger(&self) -> ReconcileTrigger {
        ReconcileTrigger::new(&self.config.reconciliation)
    }

    /// Resilience wrapper around `broker`.
    #[must_use]
    pub fn resilient(&self, broker: BrokerHandle) -> ResilienceWrapper {
        ResilienceWrapper::new(
            broker,
            self.kill_switch.clone(),
            self.audit.clone(),
            &self.config.resilience,
        )
    }
}
