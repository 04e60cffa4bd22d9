//! Append-only audit event stream.
//!
//! Every gate decision, lifecycle transition, resilience event, reconciliation
//! result and kill switch change is emitted exactly once as an [`AuditEvent`].
//! Emission never blocks: [`ChannelAuditSink`] queues onto an unbounded
//! channel drained by a background writer task.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Risk gate decision.
    RiskDecision,
    /// Order state transition.
    OrderTransition,
    /// Fill applied to the portfolio.
    Fill,
    /// Transient broker failure, retrying.
    ResilienceRetry,
    /// Terminal broker failure, not retried.
    ResilienceTerminal,
    /// Broker call succeeded after one or more retries.
    ResilienceRecovered,
    /// Reconciliation run.
    Reconciliation,
    /// Kill switch tripped.
    KillSwitchTripped,
    /// Kill switch reset by an operator.
    KillSwitchReset,
    /// Bar failed the data-quality check.
    BarFlagged,
    /// Data feed reconnect attempt.
    FeedReconnect,
    /// Liveness signal from the live loop.
    Heartbeat,
}

impl AuditKind {
    /// Wire form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RiskDecision => "risk_decision",
            Self::OrderTransition => "order_transition",
            Self::Fill => "fill",
            Self::ResilienceRetry => "resilience_retry",
            Self::ResilienceTerminal => "resilience_terminal",
            Self::ResilienceRecovered => "resilience_recovered",
            Self::Reconciliation => "reconciliation",
            Self::KillSwitchTripped => "kill_switch_tripped",
            Self::KillSwitchReset => "kill_switch_reset",
            Self::BarFlagged => "bar_flagged",
            Self::FeedReconnect => "feed_reconnect",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event type.
    pub event_type: AuditKind,
    /// Event time (bar time in backtests, wall clock live).
    pub timestamp: DateTime<Utc>,
    /// Structured payload.
    pub payload: serde_json::Value,
}

impl AuditEvent {
    /// Build an event, serializing `payload`.
    pub fn new(event_type: AuditKind, timestamp: DateTime<Utc>, payload: &impl Serialize) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or_else(|e| {
            serde_json::json!({ "serialization_error": e.to_string() })
        });
        Self {
            event_type,
            timestamp,
            payload,
        }
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// Hand off one event. Must not block.
    fn emit(&self, event: AuditEvent);

    /// Build and emit an event.
    fn record(&self, event_type: AuditKind, timestamp: DateTime<Utc>, payload: &impl Serialize)
    where
        Self: Sized,
    {
        self.emit(AuditEvent::new(event_type, timestamp, payload));
    }
}

/// Shared handle to an audit sink.
pub type SharedAuditSink = Arc<dyn AuditSink>;

/// Build and emit an event through a shared sink.
pub fn emit(sink: &dyn AuditSink, event_type: AuditKind, timestamp: DateTime<Utc>, payload: &impl Serialize) {
    sink.emit(AuditEvent::new(event_type, timestamp, payload));
}

// ============================================================================
// In-memory sink
// ============================================================================

/// Keeps every event in memory. Used by backtests and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events so far.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: AuditKind) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == kind)
            .cloned()
            .collect()
    }

    /// Number of events of one kind.
    #[must_use]
    pub fn count(&self, kind: AuditKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == kind)
            .count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

// ============================================================================
// Channel sink
// ============================================================================

/// Where the background writer sends events.
#[derive(Debug, Clone)]
pub enum AuditTarget {
    /// Log each event through `tracing` at info level.
    Tracing,
    /// Append JSON lines to a file.
    JsonLines(PathBuf),
}

/// Queues events for a background writer task.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Spawn the writer task and return the sink plus its handle.
    ///
    /// The task ends once every sender is dropped and the queue is drained.
    #[must_use]
    pub fn spawn(target: AuditTarget) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_events(rx, target));
        (Self { tx }, handle)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: AuditEvent) {
        if self.tx.send(event).is_err() {
            error!("Audit writer has stopped; event dropped");
        }
    }
}

async fn write_events(mut rx: mpsc::UnboundedReceiver<AuditEvent>, target: AuditTarget) {
    let mut file = match &target {
        AuditTarget::Tracing => None,
        AuditTarget::JsonLines(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && let Err(e) = tokio::fs::create_dir_all(parent).await
            {
                error!(path = %path.display(), error = %e, "Failed to create audit directory");
            }
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
            {
                Ok(f) => Some(f),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to open audit log, falling back to tracing");
                    None
                }
            }
        }
    };

    while let Some(event) = rx.recv().await {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                error!(event_type = %event.event_type, error = %e, "Failed to serialize audit event");
                continue;
            }
        };
        match file.as_mut() {
            Some(f) => {
                let written = async {
                    f.write_all(line.as_bytes()).await?;
                    f.write_all(b"\n").await?;
                    f.flush().await
                }
                .await;
                if let Err(e) = written {
                    error!(error = %e, "Failed to append audit event");
                }
            }
            None => info!(target: "audit", event_type = %event.event_type, event = %line, "Audit event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
    }

    #[test]
    fn memory_sink_filters_by_kind() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditKind::Heartbeat, ts(), &serde_json::json!({"seq": 1}));
        sink.record(AuditKind::Fill, ts(), &serde_json::json!({"qty": "10"}));
        sink.record(AuditKind::Heartbeat, ts(), &serde_json::json!({"seq": 2}));

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.count(AuditKind::Heartbeat), 2);
        assert_eq!(sink.of_kind(AuditKind::Fill)[0].payload["qty"], "10");
    }

    #[test]
    fn event_serializes_snake_case_type() {
        let event = AuditEvent::new(AuditKind::KillSwitchTripped, ts(), &"halted");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event_type":"kill_switch_tripped""#));
    }

    #[tokio::test]
    async fn channel_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("events.jsonl");
        let (sink, handle) = ChannelAuditSink::spawn(AuditTarget::JsonLines(path.clone()));

        sink.record(AuditKind::Heartbeat, ts(), &serde_json::json!({"seq": 1}));
        sink.record(AuditKind::Heartbeat, ts(), &serde_json::json!({"seq": 2}));
        drop(sink);
        handle.await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditEvent> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].payload["seq"], 2);
    }
}
