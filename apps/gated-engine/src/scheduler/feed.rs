//! Bar sources for the schedulers.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::models::Bar;

/// Data feed errors.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// Stream dropped; a reconnect may recover it.
    #[error("feed disconnected: {0}")]
    Disconnected(String),

    /// Bar file could not be read.
    #[error("failed to read bars from '{path}': {message}")]
    Io {
        /// File path.
        path: String,
        /// OS error text.
        message: String,
    },

    /// A line could not be decoded into a bar.
    #[error("line {line}: {message}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// Decoder message.
        message: String,
    },
}

/// Asynchronous stream of bars.
///
/// `next_bar` must be cancel-safe: the live loop drops the future when
/// another branch wins the select.
#[async_trait]
pub trait BarFeed: Send {
    /// Next bar, `Ok(None)` at end of stream.
    async fn next_bar(&mut self) -> Result<Option<Bar>, FeedError>;

    /// Re-establish the stream after a failure.
    async fn reconnect(&mut self) -> Result<(), FeedError> {
        Ok(())
    }
}

// ============================================================================
// Replay feed
// ============================================================================

/// Replays an in-memory bar sequence, optionally paced.
///
/// The pacing deadline lives on the feed, so a `next_bar` dropped by a
/// losing select branch resumes the same wait instead of starting over.
#[derive(Debug, Clone, Default)]
pub struct ReplayFeed {
    bars: VecDeque<Bar>,
    pace: Option<Duration>,
    next_due: Option<Instant>,
}

impl ReplayFeed {
    /// Replay `bars` in order without delay.
    #[must_use]
    pub fn new(bars: impl IntoIterator<Item = Bar>) -> Self {
        Self {
            bars: bars.into_iter().collect(),
            pace: None,
            next_due: None,
        }
    }

    /// Wait `pace` before each bar.
    #[must_use]
    pub const fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Bars not yet delivered.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bars.len()
    }
}

#[async_trait]
impl BarFeed for ReplayFeed {
    async fn next_bar(&mut self) -> Result<Option<Bar>, FeedError> {
        if self.bars.is_empty() {
            return Ok(None);
        }
        if let Some(pace) = self.pace {
            let due = *self.next_due.get_or_insert_with(|| Instant::now() + pace);
            tokio::time::sleep_until(due).await;
            self.next_due = None;
        }
        Ok(self.bars.pop_front())
    }
}

// ============================================================================
// Channel feed
// ============================================================================

/// Feed backed by an mpsc channel, for push-style sources.
#[derive(Debug)]
pub struct ChannelFeed {
    rx: mpsc::Receiver<Result<Bar, FeedError>>,
}

impl ChannelFeed {
    /// Create a feed and the sender that drives it.
    #[must_use]
    pub fn new(capacity: usize) -> (mpsc::Sender<Result<Bar, FeedError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl BarFeed for ChannelFeed {
    async fn next_bar(&mut self) -> Result<Option<Bar>, FeedError> {
        match self.rx.recv().await {
            Some(Ok(bar)) => Ok(Some(bar)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

// ============================================================================
// JSON-lines loading
// ============================================================================

/// Bars decoded from a JSON-lines file.
#[derive(Debug, Clone, Default)]
pub struct LoadedBars {
    /// Decoded bars sorted by timestamp, then symbol.
    pub bars: Vec<Bar>,
    /// Lines that could not be decoded.
    pub rejected: Vec<FeedError>,
}

/// Decode JSON-lines bar text. Blank lines are skipped.
#[must_use]
pub fn parse_bars_jsonl(text: &str) -> LoadedBars {
    let mut loaded = LoadedBars::default();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Bar>(line) {
            Ok(bar) => loaded.bars.push(bar),
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping undecodable bar");
                loaded.rejected.push(FeedError::Parse {
                    line: index + 1,
                    message: e.to_string(),
                });
            }
        }
    }
    // Stable, so same-key bars keep file order.
    loaded
        .bars
        .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.symbol.cmp(&b.symbol)));
    debug!(bars = loaded.bars.len(), rejected = loaded.rejected.len(), "Bars loaded");
    loaded
}

/// Read and decode a JSON-lines bar file.
pub fn load_bars_jsonl(path: impl AsRef<Path>) -> Result<LoadedBars, FeedError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| FeedError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(parse_bars_jsonl(&text))
}
