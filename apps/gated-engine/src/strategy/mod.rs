//! Strategy seam.
//!
//! Strategies turn bars into [`Signal`]s. Returning `None` (for example while
//! history is still too short) is a no-op for the engine, never an error.

mod scripted;
mod sma;

use std::fmt;

use crate::market::MarketState;
use crate::models::{Bar, Signal};

pub use scripted::ScriptedStrategy;
pub use sma::SmaCrossStrategy;

/// Produces signals from bars.
///
/// `market` already includes `bar`; nothing later than `bar` is visible.
pub trait Strategy: Send + fmt::Debug {
    /// Identifier stamped on every signal.
    fn id(&self) -> &str;

    /// React to one bar.
    fn on_bar(&mut self, bar: &Bar, market: &MarketState) -> Option<Signal>;
}
