//! Risk gate: the only path from a [`Signal`] to an order.
//!
//! [`RiskGate::approve`] is a pure function of the signal, the portfolio and
//! the [`RiskContext`]. It never mutates its inputs; callers apply counter and
//! kill switch updates after acting on the decision.
//!
//! # Check order
//!
//! 1. Kill switch (short-circuits with `halted`)
//! 2. Guardrails: daily orders, hourly rejects, symbol cooldown, session, reject streak
//! 3. Value-at-risk on the post-trade book
//! 4. Circuit breakers: drawdown, intraday loss, losing streak
//! 5. Concentration: symbol, sector, correlated group
//! 6. Position sizing
//!
//! Steps 2 through 6 all run, so a rejection lists every failing check in this
//! order. Closing signals reduce risk and skip steps 3 to 5.
//!
//! # Example
//!
//! ```rust,ignore
//! use gated_engine::risk::{GuardrailState, RiskContext, RiskGate};
//!
//! let gate = RiskGate::from_config(&config)?;
//! let decision = gate.approve(&signal, &portfolio, &RiskContext {
//!     halted: kill_switch.is_tripped(),
//!     guardrails: &guardrails,
//!     market: &market,
//! });
//! ```

mod breakers;
mod concentration;
mod guardrails;
mod session;
mod sizing;
mod var;

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tracing::debug;

use crate::config::{Config, ConfigError, CorrelationConfig, GuardrailConfig, RiskConfig};
use crate::market::MarketState;
use crate::models::{
    Direction, OrderIntent, OrderType, RejectionCode, RejectionReason, RiskDecision, Signal,
};
use crate::portfolio::PortfolioState;

pub use guardrails::GuardrailState;
pub use session::{SessionWindow, TradingDay};
pub use sizing::{SizedOrder, entry_quantity};
pub use var::{VarEstimate, estimate as estimate_var};

use concentration::{Concentration, Proposal};

/// Read-only state the gate evaluates against besides the portfolio.
#[derive(Debug, Clone, Copy)]
pub struct RiskContext<'a> {
    /// Kill switch status at evaluation time.
    pub halted: bool,
    /// Guardrail counters.
    pub guardrails: &'a GuardrailState,
    /// Prices and return history observed so far.
    pub market: &'a MarketState,
}

/// Signal approval gate.
#[derive(Debug, Clone)]
pub struct RiskGate {
    risk: RiskConfig,
    guardrails: GuardrailConfig,
    correlation: CorrelationConfig,
    session: Option<SessionWindow>,
}

impl RiskGate {
    /// Create a gate.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the session window cannot be parsed.
    pub fn new(
        risk: RiskConfig,
        guardrails: GuardrailConfig,
        correlation: CorrelationConfig,
    ) -> Result<Self, ConfigError> {
        let session = guardrails
            .session
            .as_ref()
            .map(SessionWindow::from_config)
            .transpose()?;
        Ok(Self {
            risk,
            guardrails,
            correlation,
            session,
        })
    }

    /// Create a gate from the root configuration.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the session window cannot be parsed.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(
            config.risk.clone(),
            config.guardrails.clone(),
            config.correlation.clone(),
        )
    }

    /// Risk limits in force.
    #[must_use]
    pub const fn risk_config(&self) -> &RiskConfig {
        &self.risk
    }

    /// Decide whether `signal` may become an order.
    ///
    /// Evaluation time is the signal's timestamp, so replaying the same
    /// inputs always yields the same decision.
    #[must_use]
    pub fn approve(
        &self,
        signal: &Signal,
        portfolio: &PortfolioState,
        ctx: &RiskContext<'_>,
    ) -> RiskDecision {
        let symbol = signal.symbol();

        if ctx.halted {
            debug!(symbol = %symbol, "Signal rejected: kill switch tripped");
            return RiskDecision::reject(
                symbol,
                vec![RejectionReason::new(
                    RejectionCode::Halted,
                    "kill switch is tripped; no new orders until reset",
                )],
            );
        }

        let mut reasons = guardrails::evaluate(
            &self.guardrails,
            self.session.as_ref(),
            ctx.guardrails,
            symbol,
            signal.timestamp(),
        );

        let marks = ctx.market.marks();
        let portfolio_value = portfolio.portfolio_value(&marks);
        let sized = sizing::size(
            signal,
            portfolio,
            ctx.market.last_price(symbol),
            portfolio_value,
            self.risk.max_position_fraction,
        );

        let mut quantity = sized.as_ref().map(|s| s.quantity).unwrap_or_default();
        let mut scaled_down = false;

        if signal.direction() != Direction::Close {
            if let Ok(order) = &sized {
                let post_trade = post_trade_book(portfolio, symbol, order);
                reasons.extend(var::check(
                    &self.risk.var,
                    &post_trade,
                    ctx.market,
                    portfolio_value,
                ));
            }

            reasons.extend(breakers::evaluate(
                &self.risk.circuit_breakers,
                portfolio,
                portfolio_value,
            ));

            if let Ok(order) = &sized {
                match concentration::evaluate(
                    &self.risk.concentration,
                    &self.correlation,
                    portfolio,
                    &marks,
                    portfolio_value,
                    Proposal {
                        symbol,
                        side: order.side,
                        quantity: order.quantity,
                        price: order.reference_price,
                    },
                ) {
                    Concentration::Within => {}
                    Concentration::ScaledDown(allowed) => {
                        quantity = allowed;
                        scaled_down = true;
                    }
                    Concentration::Breached(breaches) => reasons.extend(breaches),
                }
            }
        }

        let order = match sized {
            Ok(order) => order,
            Err(reason) => {
                reasons.push(reason);
                return rejected(symbol, reasons);
            }
        };

        if !reasons.is_empty() {
            return rejected(symbol, reasons);
        }

        debug!(
            symbol = %symbol,
            side = %order.side,
            quantity = %quantity,
            reference_price = %order.reference_price,
            scaled_down,
            "Signal approved"
        );

        RiskDecision::Approved(OrderIntent::new(
            symbol,
            order.side,
            quantity,
            OrderType::Market,
            order.reference_price,
            signal.strategy_id(),
            signal.timestamp(),
            scaled_down,
        ))
    }
}

fn rejected(symbol: &str, reasons: Vec<RejectionReason>) -> RiskDecision {
    debug!(
        symbol = %symbol,
        reasons = ?reasons.iter().map(|r| r.code.as_str()).collect::<Vec<_>>(),
        "Signal rejected"
    );
    RiskDecision::reject(symbol, reasons)
}

/// Signed quantities after the proposed order fills.
fn post_trade_book(
    portfolio: &PortfolioState,
    symbol: &str,
    order: &SizedOrder,
) -> BTreeMap<String, Decimal> {
    let mut book: BTreeMap<String, Decimal> = portfolio
        .positions()
        .iter()
        .map(|(s, p)| (s.clone(), p.quantity))
        .collect();
    *book.entry(symbol.to_string()).or_default() += order.side.sign() * order.quantity;
    book
}
