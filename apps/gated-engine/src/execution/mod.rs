//! Order lifecycle and reconciliation.
//!
//! [`OrderLifecycle`] owns every order and interprets broker reports against
//! the transition table; the reconciliation submodule checks the engine's
//! beliefs against the broker.

mod lifecycle;
pub mod reconciliation;
mod state_machine;

pub use lifecycle::{LifecycleError, NOT_FILLED, OrderIdGenerator, OrderLifecycle, TimedOut, Transition};
pub use reconciliation::{
    BrokerSnapshot, ReconcileOutcome, ReconcileTrigger, ReconciliationResult, Reconciler, Severity,
    TriggerReason,
};
pub use state_machine::is_valid_transition;
