//! Resilience around broker I/O.
//!
//! Every broker call goes through [`ResilienceWrapper`]: bounded retry with
//! exponential backoff and jitter for transient errors, immediate
//! propagation for terminal ones, and a consecutive-failure circuit that
//! trips the kill switch.

mod wrapper;

pub use wrapper::{BROKER_CIRCUIT_BREAKER, ResilienceError, ResilienceWrapper};
