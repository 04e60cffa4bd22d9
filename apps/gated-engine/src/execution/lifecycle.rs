//! Order lifecycle: the sole owner of [`Order`]s.
//!
//! Broker adapters report raw statuses and cumulative fills; the lifecycle
//! interprets them against the transition table, turns fill progress into
//! incremental [`Fill`]s and audits every transition before handing a fill
//! back to the caller for portfolio application.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::state_machine;
use crate::audit::{self, AuditKind, SharedAuditSink};
use crate::broker::BrokerOrderStatus;
use crate::config::LifecycleConfig;
use crate::models::{BrokerOrderId, Order, OrderId, OrderIntent, OrderState};
use crate::observability::metrics;
use crate::portfolio::Fill;

/// Rejection reason recorded when a submitted order sees no fill in time.
pub const NOT_FILLED: &str = "NOT_FILLED";

/// Lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// No order with this ID.
    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    /// No order carries this broker ID.
    #[error("unknown broker order {0}")]
    UnknownBrokerOrder(BrokerOrderId),

    /// Transition not allowed from the current state.
    #[error("order {order_id}: {reason}")]
    InvalidTransition {
        /// Order.
        order_id: OrderId,
        /// Current state.
        from: OrderState,
        /// Requested state.
        to: OrderState,
        /// Explanation.
        reason: String,
    },

    /// Fill would exceed the requested quantity.
    #[error("order {order_id}: fill to {filled} exceeds requested {requested}")]
    Overfill {
        /// Order.
        order_id: OrderId,
        /// Requested quantity.
        requested: Decimal,
        /// Cumulative quantity the fill would reach.
        filled: Decimal,
    },

    /// Fill quantity or price is not positive.
    #[error("order {order_id}: fill of {quantity} at {price} is not valid")]
    InvalidFill {
        /// Order.
        order_id: OrderId,
        /// Quantity.
        quantity: Decimal,
        /// Price.
        price: Decimal,
    },
}

/// How order IDs are minted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderIdGenerator {
    /// `prefix-000001`, `prefix-000002`, ... (reproducible).
    Sequential {
        /// ID prefix.
        prefix: String,
        /// Next sequence number.
        next: u64,
    },
    /// Random UUID v4.
    Uuid,
}

impl OrderIdGenerator {
    /// Sequential IDs starting at 1.
    #[must_use]
    pub fn sequential(prefix: impl Into<String>) -> Self {
        Self::Sequential {
            prefix: prefix.into(),
            next: 1,
        }
    }

    fn next_id(&mut self) -> OrderId {
        match self {
            Self::Sequential { prefix, next } => {
                let id = OrderId::new(format!("{prefix}-{next:06}"));
                *next += 1;
                id
            }
            Self::Uuid => OrderId::new(uuid::Uuid::new_v4().to_string()),
        }
    }
}

/// One audited state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Order.
    pub order_id: OrderId,
    /// Symbol.
    pub symbol: String,
    /// Previous state (`None` at creation).
    pub from: Option<OrderState>,
    /// New state.
    pub to: OrderState,
    /// Cumulative filled quantity after the change.
    pub filled_quantity: Decimal,
    /// Why, when not self-evident.
    pub reason: Option<String>,
    /// Broker truth overrode local state.
    pub adopted: bool,
    /// When.
    pub at: DateTime<Utc>,
}

/// Order closed by a local timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOut {
    /// Order.
    pub order_id: OrderId,
    /// Symbol.
    pub symbol: String,
    /// `Rejected` (not filled) or `Expired` (max open duration).
    pub state: OrderState,
    /// Broker ID, for issuing a cancel.
    pub broker_order_id: Option<BrokerOrderId>,
}

/// Tracks every order from creation to a terminal state.
#[derive(Debug)]
pub struct OrderLifecycle {
    orders: BTreeMap<OrderId, Order>,
    by_broker: HashMap<BrokerOrderId, OrderId>,
    fill_seq: HashMap<OrderId, u32>,
    unconfirmed: BTreeSet<OrderId>,
    transitions: Vec<Transition>,
    ids: OrderIdGenerator,
    config: LifecycleConfig,
    commission_per_share: Decimal,
    audit: SharedAuditSink,
}

impl OrderLifecycle {
    /// Create an empty lifecycle.
    #[must_use]
    pub fn new(config: LifecycleConfig, ids: OrderIdGenerator, audit: SharedAuditSink) -> Self {
        Self {
            orders: BTreeMap::new(),
            by_broker: HashMap::new(),
            fill_seq: HashMap::new(),
            unconfirmed: BTreeSet::new(),
            transitions: Vec::new(),
            ids,
            config,
            commission_per_share: Decimal::ZERO,
            audit,
        }
    }

    /// Charge this commission per share on broker-reported fills.
    #[must_use]
    pub const fn with_commission_per_share(mut self, commission: Decimal) -> Self {
        self.commission_per_share = commission;
        self
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Look up an order.
    #[must_use]
    pub fn get(&self, id: &OrderId) -> Option<&Order> {
        self.orders.get(id)
    }

    /// Look up an order by broker ID.
    #[must_use]
    pub fn by_broker_id(&self, broker_id: &BrokerOrderId) -> Option<&Order> {
        self.by_broker.get(broker_id).and_then(|id| self.orders.get(id))
    }

    /// All orders, by ID.
    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    /// Orders not yet in a terminal state.
    #[must_use]
    pub fn open_orders(&self) -> Vec<&Order> {
        self.orders.values().filter(|o| !o.state().is_terminal()).collect()
    }

    /// Orders closed locally (timeout or expiry) that the broker has not
    /// yet confirmed closed.
    #[must_use]
    pub fn unconfirmed(&self) -> Vec<&Order> {
        self.unconfirmed
            .iter()
            .filter_map(|id| self.orders.get(id))
            .collect()
    }

    /// Whether `id` awaits broker confirmation.
    #[must_use]
    pub fn is_unconfirmed(&self, id: &OrderId) -> bool {
        self.unconfirmed.contains(id)
    }

    /// Transitions of the orders still held.
    #[must_use]
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Number of orders held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Whether no order was ever created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Create an order from an approved intent.
    pub fn create(&mut self, intent: OrderIntent, now: DateTime<Utc>) -> OrderId {
        let id = self.ids.next_id();
        let order = Order::from_intent(id.clone(), intent, now);
        info!(
            order_id = %id,
            symbol = %order.symbol(),
            side = %order.side(),
            quantity = %order.quantity(),
            "Order created"
        );
        self.log_transition(&order, None, None, false, now);
        self.orders.insert(id.clone(), order);
        id
    }

    /// Broker accepted the order.
    ///
    /// # Errors
    ///
    /// Unknown order or an illegal transition.
    pub fn mark_submitted(
        &mut self,
        id: &OrderId,
        broker_id: BrokerOrderId,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.transition(id, OrderState::Submitted, None, now)?;
        if let Some(order) = self.orders.get_mut(id) {
            order.set_broker_order_id(broker_id.clone());
        }
        self.by_broker.insert(broker_id, id.clone());
        Ok(())
    }

    /// Order refused by the broker or the engine.
    ///
    /// # Errors
    ///
    /// Unknown order or an illegal transition.
    pub fn reject(
        &mut self,
        id: &OrderId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.transition(id, OrderState::Rejected, Some(reason), now)?;
        if let Some(order) = self.orders.get_mut(id) {
            order.set_rejection_reason(reason);
        }
        Ok(())
    }

    /// Broker confirmed a cancel.
    ///
    /// # Errors
    ///
    /// Unknown order or an illegal transition.
    pub fn cancel_confirmed(&mut self, id: &OrderId, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.transition(id, OrderState::Cancelled, None, now)
    }

    /// Expire an order.
    ///
    /// # Errors
    ///
    /// Unknown order or an illegal transition.
    pub fn expire(
        &mut self,
        id: &OrderId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.transition(id, OrderState::Expired, Some(reason), now)
    }

    /// Record an execution increment directly (simulated fills).
    ///
    /// # Errors
    ///
    /// Unknown order, non-positive quantity or price, an overfill, or an
    /// order that is not working.
    pub fn record_execution(
        &mut self,
        id: &OrderId,
        quantity: Decimal,
        price: Decimal,
        commission: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Fill, LifecycleError> {
        let order = self.orders.get(id).ok_or_else(|| LifecycleError::UnknownOrder(id.clone()))?;
        if quantity <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(LifecycleError::InvalidFill {
                order_id: id.clone(),
                quantity,
                price,
            });
        }
        let cumulative = order.filled_quantity() + quantity;
        if cumulative > order.quantity() {
            return Err(LifecycleError::Overfill {
                order_id: id.clone(),
                requested: order.quantity(),
                filled: cumulative,
            });
        }
        let target = if cumulative == order.quantity() {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        Self::check(order, target)?;
        self.execute(id, quantity, price, commission, target, false, now)
    }

    /// Interpret a broker status report.
    ///
    /// Cumulative quantities below what is already recorded are stale and
    /// ignored. Orders closed locally but unconfirmed adopt the broker's view.
    ///
    /// # Errors
    ///
    /// Unknown order, an illegal transition, or an overfill.
    pub fn apply_broker_status(
        &mut self,
        id: &OrderId,
        status: &BrokerOrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Fill>, LifecycleError> {
        let order = self.orders.get(id).ok_or_else(|| LifecycleError::UnknownOrder(id.clone()))?;
        let adopting = self.unconfirmed.contains(id);
        if order.state().is_terminal() && !adopting {
            debug!(order_id = %id, state = %order.state(), "Status for closed order ignored");
            return Ok(None);
        }

        match status {
            BrokerOrderStatus::Accepted => {
                if order.state() == OrderState::Created {
                    self.transition(id, OrderState::Submitted, None, now)?;
                }
                Ok(None)
            }
            BrokerOrderStatus::PartiallyFilled {
                cumulative_quantity,
                average_price,
            }
            | BrokerOrderStatus::Filled {
                cumulative_quantity,
                average_price,
            } => self.apply_cumulative(id, *cumulative_quantity, *average_price, adopting, now),
            BrokerOrderStatus::Rejected { reason } => {
                if adopting {
                    self.adopt_state(id, OrderState::Rejected, Some(reason), now);
                } else {
                    self.reject(id, reason, now)?;
                }
                Ok(None)
            }
            BrokerOrderStatus::Cancelled => {
                if adopting {
                    self.adopt_state(id, OrderState::Cancelled, None, now);
                } else {
                    self.cancel_confirmed(id, now)?;
                }
                Ok(None)
            }
            BrokerOrderStatus::Expired => {
                if adopting {
                    self.adopt_state(id, OrderState::Expired, Some("broker"), now);
                } else {
                    self.expire(id, "broker", now)?;
                }
                Ok(None)
            }
        }
    }

    fn apply_cumulative(
        &mut self,
        id: &OrderId,
        cumulative: Decimal,
        average_price: Decimal,
        adopting: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Fill>, LifecycleError> {
        let Some(order) = self.orders.get(id) else {
            return Err(LifecycleError::UnknownOrder(id.clone()));
        };
        if cumulative > order.quantity() {
            return Err(LifecycleError::Overfill {
                order_id: id.clone(),
                requested: order.quantity(),
                filled: cumulative,
            });
        }
        let delta = cumulative - order.filled_quantity();
        if delta <= Decimal::ZERO {
            debug!(order_id = %id, cumulative = %cumulative, "Stale fill report ignored");
            return Ok(None);
        }
        if average_price <= Decimal::ZERO {
            return Err(LifecycleError::InvalidFill {
                order_id: id.clone(),
                quantity: delta,
                price: average_price,
            });
        }

        // Price of the increment implied by the change in average price.
        let previous_notional =
            order.average_fill_price().unwrap_or(Decimal::ZERO) * order.filled_quantity();
        let implied = (cumulative * average_price - previous_notional) / delta;
        let price = if implied > Decimal::ZERO {
            implied
        } else {
            average_price
        };

        let target = if cumulative == order.quantity() {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        if !adopting {
            Self::check(order, target)?;
        }
        let commission = self.commission_per_share * delta;
        self.execute(id, delta, price, commission, target, adopting, now)
            .map(Some)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &mut self,
        id: &OrderId,
        quantity: Decimal,
        price: Decimal,
        commission: Decimal,
        target: OrderState,
        adopted: bool,
        now: DateTime<Utc>,
    ) -> Result<Fill, LifecycleError> {
        let seq = self.fill_seq.entry(id.clone()).or_insert(0);
        *seq += 1;
        let fill_id = format!("{id}-{seq}");

        let order = self
            .orders
            .get_mut(id)
            .ok_or_else(|| LifecycleError::UnknownOrder(id.clone()))?;
        let from = order.state();
        order.record_execution(quantity, price);
        order.set_state(target, now);
        let fill = Fill {
            fill_id,
            order_id: id.clone(),
            symbol: order.symbol().to_string(),
            side: order.side(),
            quantity,
            price,
            commission,
            timestamp: now,
        };
        let snapshot = order.clone();

        if adopted && target.is_terminal() {
            self.unconfirmed.remove(id);
        }
        self.log_transition(&snapshot, Some(from), None, adopted, now);
        Ok(fill)
    }

    /// Close orders whose timeouts elapsed.
    ///
    /// Submitted orders with nothing filled after the not-filled timeout are
    /// rejected with [`NOT_FILLED`]; any order open past the maximum duration
    /// expires. Both stay on the unconfirmed list until the broker agrees.
    pub fn sweep_timeouts(&mut self, now: DateTime<Utc>) -> Vec<TimedOut> {
        let not_filled = self.config.not_filled_timeout();
        let max_open = self.config.max_open();

        let due: Vec<(OrderId, OrderState)> = self
            .orders
            .values()
            .filter(|o| !o.state().is_terminal())
            .filter_map(|o| {
                if now - o.created_at() >= max_open {
                    Some((o.id().clone(), OrderState::Expired))
                } else if o.state() == OrderState::Submitted
                    && o.filled_quantity().is_zero()
                    && now - o.updated_at() >= not_filled
                {
                    Some((o.id().clone(), OrderState::Rejected))
                } else {
                    None
                }
            })
            .collect();

        let mut closed = Vec::with_capacity(due.len());
        for (id, state) in due {
            let result = if state == OrderState::Rejected {
                self.reject(&id, NOT_FILLED, now)
            } else {
                self.expire(&id, "max_open_duration", now)
            };
            if let Err(e) = result {
                warn!(order_id = %id, error = %e, "Timeout transition refused");
                continue;
            }
            self.unconfirmed.insert(id.clone());
            if let Some(order) = self.orders.get(&id) {
                warn!(order_id = %id, state = %state, "Order timed out");
                closed.push(TimedOut {
                    order_id: id,
                    symbol: order.symbol().to_string(),
                    state,
                    broker_order_id: order.broker_order_id().cloned(),
                });
            }
        }
        closed
    }

    /// Reject every order not yet submitted (kill switch tripped).
    pub fn reject_unsubmitted(&mut self, reason: &str, now: DateTime<Utc>) -> Vec<OrderId> {
        let pending: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.state() == OrderState::Created)
            .map(|o| o.id().clone())
            .collect();
        pending
            .into_iter()
            .filter(|id| self.reject(id, reason, now).is_ok())
            .collect()
    }

    /// Expire every open order (end of a replay).
    pub fn expire_all_open(&mut self, reason: &str, now: DateTime<Utc>) -> Vec<OrderId> {
        let open: Vec<OrderId> = self.open_orders().iter().map(|o| o.id().clone()).collect();
        open.into_iter()
            .filter(|id| self.expire(id, reason, now).is_ok())
            .collect()
    }

    /// Broker confirms a locally closed order is closed on its side too.
    pub fn confirm_closed(&mut self, id: &OrderId) -> bool {
        self.unconfirmed.remove(id)
    }

    /// Drop the oldest closed orders beyond `keep`, with their transitions.
    ///
    /// Only terminal orders the broker has confirmed are dropped; their
    /// history is already in the audit log. Returns how many were dropped.
    pub fn prune_closed(&mut self, keep: usize) -> usize {
        let mut closed: Vec<(DateTime<Utc>, OrderId)> = self
            .orders
            .values()
            .filter(|o| o.state().is_terminal() && !self.unconfirmed.contains(o.id()))
            .map(|o| (o.updated_at(), o.id().clone()))
            .collect();
        if closed.len() <= keep {
            return 0;
        }
        closed.sort();
        let excess = closed.len() - keep;
        let dropped: BTreeSet<OrderId> = closed.into_iter().take(excess).map(|(_, id)| id).collect();
        for id in &dropped {
            if let Some(order) = self.orders.remove(id)
                && let Some(broker_id) = order.broker_order_id()
            {
                self.by_broker.remove(broker_id);
            }
            self.fill_seq.remove(id);
        }
        self.transitions.retain(|t| !dropped.contains(&t.order_id));
        debug!(dropped = dropped.len(), held = self.orders.len(), "Pruned closed orders");
        dropped.len()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check(order: &Order, to: OrderState) -> Result<(), LifecycleError> {
        let from = order.state();
        if state_machine::is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                order_id: order.id().clone(),
                from,
                to,
                reason: state_machine::refusal_reason(from, to),
            })
        }
    }

    fn transition(
        &mut self,
        id: &OrderId,
        to: OrderState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        let order = self
            .orders
            .get_mut(id)
            .ok_or_else(|| LifecycleError::UnknownOrder(id.clone()))?;
        Self::check(order, to)?;
        let from = order.state();
        order.set_state(to, now);
        let snapshot = order.clone();
        self.log_transition(&snapshot, Some(from), reason, false, now);
        Ok(())
    }

    /// Override local state with broker truth, ignoring the transition table.
    fn adopt_state(&mut self, id: &OrderId, to: OrderState, reason: Option<&str>, now: DateTime<Utc>) {
        let Some(order) = self.orders.get_mut(id) else {
            return;
        };
        let from = order.state();
        order.set_state(to, now);
        if let Some(reason) = reason
            && to == OrderState::Rejected
        {
            order.set_rejection_reason(reason);
        }
        let snapshot = order.clone();
        if to.is_terminal() {
            self.unconfirmed.remove(id);
        }
        if from != to {
            self.log_transition(&snapshot, Some(from), reason, true, now);
        }
    }

    fn log_transition(
        &mut self,
        order: &Order,
        from: Option<OrderState>,
        reason: Option<&str>,
        adopted: bool,
        now: DateTime<Utc>,
    ) {
        let transition = Transition {
            order_id: order.id().clone(),
            symbol: order.symbol().to_string(),
            from,
            to: order.state(),
            filled_quantity: order.filled_quantity(),
            reason: reason.map(str::to_string),
            adopted,
            at: now,
        };
        if from.is_some() {
            info!(
                order_id = %transition.order_id,
                from = %from.map_or_else(String::new, |s| s.to_string()),
                to = %transition.to,
                filled = %transition.filled_quantity,
                adopted,
                "Order transition"
            );
        }
        metrics::record_order_transition(transition.to);
        audit::emit(self.audit.as_ref(), AuditKind::OrderTransition, now, &transition);
        self.transitions.push(transition);
    }
}
