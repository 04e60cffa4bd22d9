//! Drivers for the bar pipeline.
//!
//! [`BacktestScheduler`] replays a sorted bar sequence synchronously and
//! deterministically. [`LiveScheduler`] runs the same [`BarPipeline`] from an
//! asynchronous [`BarFeed`] against a broker, polling fills and watching feed
//! health on one event loop.

mod backtest;
mod feed;
mod heartbeat;
mod live;
mod pipeline;

use thiserror::Error;

use crate::config::ConfigError;
use crate::execution::LifecycleError;
use crate::portfolio::PortfolioError;

pub use backtest::{BacktestReport, BacktestScheduler, END_OF_DATA};
pub use feed::{
    BarFeed, ChannelFeed, FeedError, LoadedBars, ReplayFeed, load_bars_jsonl, parse_bars_jsonl,
};
pub use heartbeat::{HeartbeatEvent, HeartbeatMonitor};
pub use live::{FEED_FAILURE, LiveScheduler, LiveSummary};
pub use pipeline::{BarOutcome, BarPipeline, CONSECUTIVE_REJECTS, DecisionStats};

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Feed could not be read.
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// Feed failed too many times in a row; the kill switch was tripped.
    #[error("feed failed {failures} times in a row: {last_error}")]
    FeedFailed {
        /// Consecutive failures.
        failures: u32,
        /// Last failure seen.
        last_error: String,
    },

    /// Portfolio refused a fill.
    #[error(transparent)]
    Portfolio(#[from] PortfolioError),

    /// Lifecycle refused a transition.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Scheduler could not be built.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Report could not be serialized.
    #[error("failed to serialize report: {0}")]
    Report(#[from] serde_json::Error),
}
