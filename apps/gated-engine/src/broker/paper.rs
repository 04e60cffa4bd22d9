//! In-process paper broker.
//!
//! Market orders fill at the latest observed price, in `fill_slices` equal
//! slices that land one per status query, so callers see the same
//! partial-fill progression a real venue produces. Faults can be queued for
//! tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;

use super::{BrokerError, BrokerOrderStatus, BrokerPort, OrderRequest};
use crate::config::PaperBrokerConfig;
use crate::models::{BrokerOrderId, OrderSide, OrderType};
use crate::portfolio::Position;

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    filled: Decimal,
    average_price: Decimal,
    status: BrokerOrderStatus,
}

#[derive(Debug, Default)]
struct Book {
    cash: Decimal,
    positions: BTreeMap<String, Position>,
    marks: BTreeMap<String, Decimal>,
    orders: HashMap<BrokerOrderId, PaperOrder>,
    next_id: u64,
    faults: VecDeque<BrokerError>,
    calls: u64,
}

/// Simulated broker.
#[derive(Debug)]
pub struct PaperBroker {
    currency: String,
    fill_slices: u32,
    commission_per_share: Decimal,
    book: Mutex<Book>,
}

impl PaperBroker {
    /// Create a broker holding `cash`.
    #[must_use]
    pub fn new(config: &PaperBrokerConfig, currency: impl Into<String>, cash: Decimal) -> Self {
        Self {
            currency: currency.into(),
            fill_slices: config.fill_slices.max(1),
            commission_per_share: config.commission_per_share,
            book: Mutex::new(Book {
                cash,
                ..Book::default()
            }),
        }
    }

    /// Set the price market orders fill at.
    pub fn set_mark(&self, symbol: &str, price: Decimal) {
        self.book().marks.insert(symbol.to_string(), price);
    }

    /// Fail the next `count` calls with `error`.
    pub fn inject_faults(&self, count: usize, error: &BrokerError) {
        let mut book = self.book();
        for _ in 0..count {
            book.faults.push_back(error.clone());
        }
    }

    /// Overwrite the cash balance (simulates out-of-band movements).
    pub fn set_cash(&self, cash: Decimal) {
        self.book().cash = cash;
    }

    /// Overwrite a position (simulates out-of-band movements).
    pub fn set_position(&self, symbol: &str, quantity: Decimal, average_cost: Decimal) {
        let currency = self.currency.clone();
        self.book().positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                quantity,
                average_cost,
                currency,
            },
        );
    }

    /// Calls received so far, faulted ones included.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.book().calls
    }

    /// Fill all remaining quantity of every open order now.
    pub fn fill_all(&self) {
        let mut book = self.book();
        let ids: Vec<BrokerOrderId> = book
            .orders
            .iter()
            .filter(|(_, o)| o.status.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            while self.advance(&mut book, &id) {}
        }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self) -> Result<MutexGuard<'_, Book>, BrokerError> {
        let mut book = self.book();
        book.calls += 1;
        match book.faults.pop_front() {
            Some(fault) => Err(fault),
            None => Ok(book),
        }
    }

    /// Fill one slice of an open order. Returns whether anything filled.
    fn advance(&self, book: &mut Book, id: &BrokerOrderId) -> bool {
        let Some(order) = book.orders.get(id) else {
            return false;
        };
        if !order.status.is_open() {
            return false;
        }
        let Some(&mark) = book.marks.get(&order.request.symbol) else {
            return false;
        };
        let marketable = match (order.request.order_type, order.request.limit_price) {
            (OrderType::Limit, Some(limit)) => match order.request.side {
                OrderSide::Buy => mark <= limit,
                OrderSide::Sell => mark >= limit,
            },
            _ => true,
        };
        if !marketable {
            return false;
        }

        let total = order.request.quantity;
        let slice = (total / Decimal::from(self.fill_slices)).floor().max(Decimal::ONE);
        let quantity = slice.min(total - order.filled);
        if quantity <= Decimal::ZERO {
            return false;
        }
        let side = order.request.side;
        let symbol = order.request.symbol.clone();

        book.cash -= side.sign() * quantity * mark + quantity * self.commission_per_share;
        let position = book
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::flat(symbol, self.currency.clone()));
        let signed = side.sign() * quantity;
        let next = position.quantity + signed;
        if next.is_zero() {
            position.average_cost = Decimal::ZERO;
        } else if position.quantity.is_zero() || position.quantity.is_sign_positive() == signed.is_sign_positive() {
            position.average_cost =
                (position.average_cost * position.quantity.abs() + mark * quantity) / next.abs();
        } else if next.is_sign_positive() != position.quantity.is_sign_positive() {
            position.average_cost = mark;
        }
        position.quantity = next;

        let Some(order) = book.orders.get_mut(id) else {
            return false;
        };
        let filled = order.filled + quantity;
        order.average_price = (order.average_price * order.filled + mark * quantity) / filled;
        order.filled = filled;
        order.status = if filled == total {
            BrokerOrderStatus::Filled {
                cumulative_quantity: filled,
                average_price: order.average_price,
            }
        } else {
            BrokerOrderStatus::PartiallyFilled {
                cumulative_quantity: filled,
                average_price: order.average_price,
            }
        };
        debug!(broker_order_id = %id, filled = %filled, price = %mark, "Paper fill");
        true
    }
}

#[async_trait]
impl BrokerPort for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn submit(&self, order: &OrderRequest) -> Result<BrokerOrderId, BrokerError> {
        let mut book = self.enter()?;
        if order.quantity <= Decimal::ZERO {
            return Err(BrokerError::InvalidOrder(format!(
                "quantity {} is not positive",
                order.quantity
            )));
        }
        if !book.marks.contains_key(&order.symbol) {
            return Err(BrokerError::Rejected(format!("no market for {}", order.symbol)));
        }
        book.next_id += 1;
        let id = BrokerOrderId::new(format!("paper-{}", book.next_id));
        book.orders.insert(
            id.clone(),
            PaperOrder {
                request: order.clone(),
                filled: Decimal::ZERO,
                average_price: Decimal::ZERO,
                status: BrokerOrderStatus::Accepted,
            },
        );
        Ok(id)
    }

    async fn cancel(&self, id: &BrokerOrderId) -> Result<(), BrokerError> {
        let mut book = self.enter()?;
        let order = book
            .orders
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;
        match order.status {
            BrokerOrderStatus::Accepted | BrokerOrderStatus::PartiallyFilled { .. } => {
                order.status = BrokerOrderStatus::Cancelled;
                Ok(())
            }
            BrokerOrderStatus::Cancelled => Ok(()),
            _ => Err(BrokerError::InvalidOrder(format!("order {id} is not open"))),
        }
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let book = self.enter()?;
        Ok(book
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect())
    }

    async fn cash(&self) -> Result<Decimal, BrokerError> {
        Ok(self.enter()?.cash)
    }

    async fn order_status(&self, id: &BrokerOrderId) -> Result<BrokerOrderStatus, BrokerError> {
        let mut book = self.enter()?;
        self.advance(&mut book, id);
        book.orders
            .get(id)
            .map(|o| o.status.clone())
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))
    }

    async fn open_orders(&self) -> Result<Vec<BrokerOrderId>, BrokerError> {
        let book = self.enter()?;
        let mut open: Vec<BrokerOrderId> = book
            .orders
            .iter()
            .filter(|(_, o)| o.status.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        open.sort();
        Ok(open)
    }

    fn observe_price(&self, symbol: &str, price: Decimal) {
        self.set_mark(symbol, price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderId;
    use rust_decimal_macros::dec;

    fn broker(slices: u32) -> PaperBroker {
        let config = PaperBrokerConfig {
            fill_slices: slices,
            commission_per_share: dec!(0.01),
        };
        let broker = PaperBroker::new(&config, "USD", dec!(10000));
        broker.set_mark("AAPL", dec!(100));
        broker
    }

    fn buy(quantity: Decimal) -> OrderRequest {
        OrderRequest {
            client_order_id: OrderId::new("o-1"),
            symbol: "AAPL".into(),
            side: OrderSide::Buy,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
        }
    }

    #[tokio::test]
    async fn fills_in_slices_on_status_queries() {
        let broker = broker(3);
        let id = broker.submit(&buy(dec!(9))).await.unwrap();

        let first = broker.order_status(&id).await.unwrap();
        assert_eq!(
            first,
            BrokerOrderStatus::PartiallyFilled {
                cumulative_quantity: dec!(3),
                average_price: dec!(100)
            }
        );
        broker.order_status(&id).await.unwrap();
        let last = broker.order_status(&id).await.unwrap();
        assert!(matches!(last, BrokerOrderStatus::Filled { cumulative_quantity, .. } if cumulative_quantity == dec!(9)));

        assert_eq!(broker.cash().await.unwrap(), dec!(10000) - dec!(900) - dec!(0.09));
        let positions = broker.positions().await.unwrap();
        assert_eq!(positions[0].quantity, dec!(9));
        assert!(broker.open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let broker = broker(1);
        broker.inject_faults(2, &BrokerError::Connection("down".into()));
        assert!(broker.cash().await.is_err());
        assert!(broker.cash().await.is_err());
        assert!(broker.cash().await.is_ok());
        assert_eq!(broker.call_count(), 3);
    }

    #[tokio::test]
    async fn unknown_symbol_is_rejected() {
        let broker = broker(1);
        let mut request = buy(dec!(1));
        request.symbol = "ZZZ".into();
        let err = broker.submit(&request).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[tokio::test]
    async fn filled_order_cannot_be_cancelled() {
        let broker = broker(1);
        let id = broker.submit(&buy(dec!(1))).await.unwrap();
        broker.fill_all();
        assert!(broker.cancel(&id).await.is_err());
    }
}
