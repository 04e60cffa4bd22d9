//! Loss circuit breakers: drawdown, intraday loss, losing streak.

use rust_decimal::Decimal;

use crate::config::CircuitBreakerConfig;
use crate::models::{RejectionCode, RejectionReason};
use crate::portfolio::PortfolioState;

/// Evaluate each enabled breaker independently.
pub(super) fn evaluate(
    config: &CircuitBreakerConfig,
    portfolio: &PortfolioState,
    portfolio_value: Decimal,
) -> Vec<RejectionReason> {
    let mut reasons = Vec::new();

    let hwm = portfolio.high_water_mark().max(portfolio_value);
    if let Some(limit) = config.max_drawdown_fraction
        && hwm > Decimal::ZERO
    {
        let drawdown = (hwm - portfolio_value) / hwm;
        if drawdown > limit {
            reasons.push(RejectionReason::new(
                RejectionCode::DrawdownBreaker,
                format!(
                    "drawdown {:.2}% from high-water mark {hwm} exceeds {:.2}%",
                    drawdown * Decimal::ONE_HUNDRED,
                    limit * Decimal::ONE_HUNDRED
                ),
            ));
        }
    }

    let day_start = portfolio.day_start_equity();
    if let Some(limit) = config.intraday_loss_fraction
        && day_start > Decimal::ZERO
    {
        let loss = (day_start - portfolio_value) / day_start;
        if loss > limit {
            reasons.push(RejectionReason::new(
                RejectionCode::IntradayLossBreaker,
                format!(
                    "intraday loss {:.2}% exceeds {:.2}%",
                    loss * Decimal::ONE_HUNDRED,
                    limit * Decimal::ONE_HUNDRED
                ),
            ));
        }
    }

    if let Some(limit) = config.max_consecutive_losses {
        let streak = portfolio.consecutive_losses();
        if streak >= limit {
            reasons.push(RejectionReason::new(
                RejectionCode::ConsecutiveLossBreaker,
                format!("{streak} consecutive losing trades reaches the limit of {limit}"),
            ));
        }
    }

    reasons
}
