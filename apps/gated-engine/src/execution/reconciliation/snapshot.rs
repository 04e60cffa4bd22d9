//! Point-in-time view of broker state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::{BrokerError, BrokerOrderStatus};
use crate::execution::OrderLifecycle;
use crate::models::BrokerOrderId;
use crate::resilience::{ResilienceError, ResilienceWrapper};

/// Broker state captured for one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    /// When captured.
    pub taken_at: Option<DateTime<Utc>>,
    /// Cash balance.
    pub cash: Decimal,
    /// Signed quantity per symbol.
    pub positions: BTreeMap<String, Decimal>,
    /// Orders the broker considers open.
    pub open_orders: BTreeSet<BrokerOrderId>,
    /// Statuses of engine-tracked orders the broker no longer lists as open.
    /// An order missing here was unknown to the broker.
    pub statuses: BTreeMap<BrokerOrderId, BrokerOrderStatus>,
}

impl BrokerSnapshot {
    /// Snapshot with cash only.
    #[must_use]
    pub fn with_cash(cash: Decimal) -> Self {
        Self {
            cash,
            ..Self::default()
        }
    }

    /// Add a position.
    #[must_use]
    pub fn position(mut self, symbol: impl Into<String>, quantity: Decimal) -> Self {
        self.positions.insert(symbol.into(), quantity);
        self
    }

    /// Add an open order.
    #[must_use]
    pub fn open_order(mut self, id: BrokerOrderId) -> Self {
        self.open_orders.insert(id);
        self
    }

    /// Add a status for an order no longer open.
    #[must_use]
    pub fn status(mut self, id: BrokerOrderId, status: BrokerOrderStatus) -> Self {
        self.statuses.insert(id, status);
        self
    }

    /// Query the broker through the resilience layer.
    ///
    /// Statuses are fetched for every engine order the lifecycle believes
    /// open (or awaits confirmation for) that the broker no longer lists.
    ///
    /// # Errors
    ///
    /// Any failure other than an unknown order aborts the capture.
    pub async fn capture(
        broker: &ResilienceWrapper,
        lifecycle: &OrderLifecycle,
        now: DateTime<Utc>,
    ) -> Result<Self, ResilienceError> {
        let cash = broker.cash().await?;
        let positions = broker
            .positions()
            .await?
            .into_iter()
            .map(|p| (p.symbol, p.quantity))
            .collect();
        let open_orders: BTreeSet<BrokerOrderId> = broker.open_orders().await?.into_iter().collect();

        let pending: Vec<BrokerOrderId> = lifecycle
            .open_orders()
            .into_iter()
            .chain(lifecycle.unconfirmed())
            .filter_map(|o| o.broker_order_id().cloned())
            .filter(|id| !open_orders.contains(id))
            .collect();

        let mut statuses = BTreeMap::new();
        for id in pending {
            match broker.order_status(&id).await {
                Ok(status) => {
                    statuses.insert(id, status);
                }
                Err(ResilienceError::Terminal {
                    error: BrokerError::NotFound(_),
                    ..
                }) => debug!(broker_order_id = %id, "Order unknown at broker"),
                Err(e) => return Err(e),
            }
        }

        Ok(Self {
            taken_at: Some(now),
            cash,
            positions,
            open_orders,
            statuses,
        })
    }
}
