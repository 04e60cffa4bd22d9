//! Broker integration.
//!
//! [`BrokerPort`] is the capability contract every adapter implements;
//! [`create_broker`] selects the adapter named in configuration. Retry and
//! backoff parameters live here so the resilience layer and the feed
//! reconnect loop share one policy type.

mod classifier;
mod paper;
mod port;
mod retry;

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;

pub use classifier::{
    DefaultClassifier, ErrorClass, ErrorClassifier, classify_message, classify_status,
};
pub use paper::PaperBroker;
pub use port::{BrokerError, BrokerOrderStatus, BrokerPort, OrderRequest};
pub use retry::{ExponentialBackoffCalculator, RetryPolicy};

use crate::config::{BrokerConfig, BrokerKind};

/// A constructed adapter plus the classifier that understands its errors.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    /// The adapter.
    pub port: Arc<dyn BrokerPort>,
    /// Its error classifier.
    pub classifier: Arc<dyn ErrorClassifier>,
}

/// Build the adapter selected by `config`.
#[must_use]
pub fn create_broker(config: &BrokerConfig, currency: &str, initial_cash: Decimal) -> BrokerHandle {
    match config.kind {
        BrokerKind::Paper => {
            info!(
                fill_slices = config.paper.fill_slices,
                commission_per_share = %config.paper.commission_per_share,
                "Using paper broker"
            );
            BrokerHandle {
                port: Arc::new(PaperBroker::new(&config.paper, currency, initial_cash)),
                classifier: Arc::new(DefaultClassifier),
            }
        }
    }
}
