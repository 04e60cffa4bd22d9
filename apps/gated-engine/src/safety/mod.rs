//! Persisted kill switch.
//!
//! The kill switch is the only engine state that must survive a restart.
//! Once tripped, every risk gate evaluation rejects with `halted` until an
//! operator resets it; each reset is appended to a persisted audit trail.
//!
//! State that cannot be read at startup fails closed: the switch opens
//! tripped with reason `state_unreadable`.

mod store;

use std::sync::{Arc, RwLock, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::audit::{self, AuditKind, SharedAuditSink};
use crate::observability::metrics;

pub use store::{FileKillSwitchStore, KillSwitchStore, MemoryKillSwitchStore};

/// Reason recorded when persisted state cannot be loaded.
pub const STATE_UNREADABLE: &str = "state_unreadable";

/// Kill switch errors.
#[derive(Debug, Error)]
pub enum KillSwitchError {
    /// Reset requested while not tripped.
    #[error("kill switch is not tripped")]
    NotTripped,

    /// State file could not be read or written.
    #[error("kill switch state at '{path}' is inaccessible: {source}")]
    Io {
        /// State file path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// State file exists but does not decode.
    #[error("kill switch state at '{path}' is corrupt: {source}")]
    Corrupt {
        /// State file path.
        path: String,
        /// Decode error.
        source: serde_json::Error,
    },

    /// State could not be encoded.
    #[error("failed to encode kill switch state: {0}")]
    Encode(serde_json::Error),
}

/// One operator reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetRecord {
    /// Who reset the switch.
    pub operator: String,
    /// Why.
    pub note: String,
    /// When.
    pub reset_at: DateTime<Utc>,
    /// Trip reason that was cleared.
    pub cleared_reason: Option<String>,
    /// When the cleared trip happened.
    pub cleared_tripped_at: Option<DateTime<Utc>>,
}

/// Persisted kill switch state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    /// Whether trading is halted.
    pub tripped: bool,
    /// Why it was tripped.
    pub trip_reason: Option<String>,
    /// When it was tripped.
    pub tripped_at: Option<DateTime<Utc>>,
    /// Consecutive transient broker failures.
    pub consecutive_failures: u32,
    /// Every reset, oldest first.
    #[serde(default)]
    pub reset_trail: Vec<ResetRecord>,
}

/// Process-wide halt flag.
#[derive(Debug)]
pub struct KillSwitch {
    state: RwLock<CircuitState>,
    store: Box<dyn KillSwitchStore>,
    audit: SharedAuditSink,
}

impl KillSwitch {
    /// Open the switch from its store.
    ///
    /// A load failure trips the switch with [`STATE_UNREADABLE`].
    #[must_use]
    pub fn open(store: Box<dyn KillSwitchStore>, audit: SharedAuditSink) -> Self {
        let state = match store.load() {
            Ok(Some(state)) => {
                if state.tripped {
                    warn!(
                        reason = state.trip_reason.as_deref().unwrap_or("unknown"),
                        "Kill switch restored in tripped state"
                    );
                }
                state
            }
            Ok(None) => CircuitState::default(),
            Err(e) => {
                error!(error = %e, "Kill switch state unreadable, failing closed");
                let now = Utc::now();
                audit::emit(
                    audit.as_ref(),
                    AuditKind::KillSwitchTripped,
                    now,
                    &serde_json::json!({ "reason": STATE_UNREADABLE, "error": e.to_string() }),
                );
                CircuitState {
                    tripped: true,
                    trip_reason: Some(STATE_UNREADABLE.to_string()),
                    tripped_at: Some(now),
                    ..CircuitState::default()
                }
            }
        };
        metrics::record_kill_switch(state.tripped);
        Self {
            state: RwLock::new(state),
            store,
            audit,
        }
    }

    /// In-memory switch starting clear.
    #[must_use]
    pub fn in_memory(audit: SharedAuditSink) -> Arc<Self> {
        Arc::new(Self::open(Box::new(MemoryKillSwitchStore::new()), audit))
    }

    /// Whether trading is halted.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.read().tripped
    }

    /// Snapshot of the state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.read().clone()
    }

    /// Consecutive transient failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.read().consecutive_failures
    }

    /// Trip the switch. Returns false if it was already tripped.
    pub fn trip(&self, reason: &str, at: DateTime<Utc>) -> bool {
        let snapshot = {
            let mut state = self.write();
            if state.tripped {
                return false;
            }
            state.tripped = true;
            state.trip_reason = Some(reason.to_string());
            state.tripped_at = Some(at);
            state.clone()
        };

        error!(reason = %reason, tripped_at = %at, "Kill switch tripped");
        if let Err(e) = self.store.save(&snapshot) {
            error!(error = %e, "Failed to persist kill switch trip");
        }
        metrics::record_kill_switch(true);
        audit::emit(
            self.audit.as_ref(),
            AuditKind::KillSwitchTripped,
            at,
            &serde_json::json!({ "reason": reason }),
        );
        true
    }

    /// Clear a tripped switch.
    ///
    /// # Errors
    ///
    /// `NotTripped` if the switch is clear; a persistence error leaves the
    /// switch tripped.
    pub fn reset(
        &self,
        operator: &str,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<ResetRecord, KillSwitchError> {
        let mut state = self.write();
        if !state.tripped {
            return Err(KillSwitchError::NotTripped);
        }

        let record = ResetRecord {
            operator: operator.to_string(),
            note: note.to_string(),
            reset_at: at,
            cleared_reason: state.trip_reason.clone(),
            cleared_tripped_at: state.tripped_at,
        };
        let mut next = state.clone();
        next.tripped = false;
        next.trip_reason = None;
        next.tripped_at = None;
        next.consecutive_failures = 0;
        next.reset_trail.push(record.clone());

        self.store.save(&next)?;
        *state = next;
        drop(state);

        warn!(
            operator = %operator,
            cleared_reason = record.cleared_reason.as_deref().unwrap_or("unknown"),
            "Kill switch reset"
        );
        metrics::record_kill_switch(false);
        audit::emit(self.audit.as_ref(), AuditKind::KillSwitchReset, at, &record);
        Ok(record)
    }

    /// Count a transient broker failure. Returns the new streak length.
    pub fn record_failure(&self) -> u32 {
        let snapshot = {
            let mut state = self.write();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.clone()
        };
        if let Err(e) = self.store.save(&snapshot) {
            error!(error = %e, "Failed to persist failure counter");
        }
        snapshot.consecutive_failures
    }

    /// End a failure streak.
    pub fn record_success(&self) {
        let snapshot = {
            let mut state = self.write();
            if state.consecutive_failures == 0 {
                return;
            }
            state.consecutive_failures = 0;
            state.clone()
        };
        if let Err(e) = self.store.save(&snapshot) {
            error!(error = %e, "Failed to persist failure counter");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CircuitState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CircuitState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
