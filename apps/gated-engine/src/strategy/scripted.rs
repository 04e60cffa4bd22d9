//! Strategy that replays a fixed list of signals.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::Strategy;
use crate::market::MarketState;
use crate::models::{Bar, Direction, Signal};

/// Emits a pre-arranged signal when the matching bar arrives.
///
/// Useful for replaying recorded signals and for driving the pipeline in
/// tests without indicator noise.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStrategy {
    id: String,
    script: BTreeMap<(String, DateTime<Utc>), (Direction, f64)>,
}

impl ScriptedStrategy {
    /// Create an empty script.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: BTreeMap::new(),
        }
    }

    /// Emit `direction` at `strength` on the `symbol` bar stamped `at`.
    #[must_use]
    pub fn at(
        mut self,
        symbol: impl Into<String>,
        at: DateTime<Utc>,
        direction: Direction,
        strength: f64,
    ) -> Self {
        self.script.insert((symbol.into(), at), (direction, strength));
        self
    }
}

impl Strategy for ScriptedStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_bar(&mut self, bar: &Bar, _market: &MarketState) -> Option<Signal> {
        let (direction, strength) = self.script.get(&(bar.symbol.clone(), bar.timestamp))?;
        match Signal::new(&bar.symbol, *direction, *strength, bar.timestamp, &self.id) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(symbol = %bar.symbol, error = %e, "Dropping scripted signal");
                None
            }
        }
    }
}
