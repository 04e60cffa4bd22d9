//! Logging and Prometheus metrics.

mod logging;
pub mod metrics;

pub use logging::{LoggingError, init_logging};
pub use metrics::{MetricsError, init_metrics};
