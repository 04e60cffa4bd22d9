// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Gated Engine - risk-gated order execution and reconciliation.
//!
//! Every strategy signal passes through a single risk gate before it can
//! become an order. Approved orders are tracked through their lifecycle
//! against a broker, broker I/O is wrapped with retry and a failure circuit
//! breaker, and the engine's view of the portfolio is reconciled against
//! the broker's.
//!
//! # Modules
//!
//! - `models`: signals, bars, orders and gate decisions
//! - `risk`: the gate (guardrails, value-at-risk, breakers, concentration, sizing)
//! - `execution`: order lifecycle state machine and reconciliation
//! - `broker`: the broker port, the paper adapter, retry policy and error classification
//! - `resilience`: retry/backoff/circuit-breaker wrapper around broker calls
//! - `safety`: the persisted kill switch
//! - `portfolio`, `market`: internal book and observed prices
//! - `scheduler`: the shared bar pipeline, deterministic backtest and live loop
//! - `strategy`: the strategy seam and a reference crossover strategy
//! - `audit`, `observability`: audit stream, logging and Prometheus metrics
//! - `config`, `context`, `error`: configuration, wiring and the fault taxonomy
//!
//! Backtest and live runs share [`scheduler::BarPipeline`], so a signal gets
//! the same decision in both modes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod market;
pub mod models;
pub mod observability;
pub mod portfolio;
pub mod resilience;
pub mod risk;
pub mod safety;
pub mod scheduler;
pub mod strategy;

pub use context::EngineContext;
pub use error::{EngineFault, ErrorCode, FaultCategory};
pub use models::{Bar, Direction, Order, OrderState, RiskDecision, Signal};
pub use risk::{RiskContext, RiskGate};
pub use scheduler::{BacktestReport, BacktestScheduler, LiveScheduler};
