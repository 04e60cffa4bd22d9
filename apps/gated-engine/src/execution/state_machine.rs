//! Order state transition table.

use crate::models::OrderState;

/// Whether `from -> to` is a legal lifecycle transition.
#[must_use]
pub const fn is_valid_transition(from: OrderState, to: OrderState) -> bool {
    matches!(
        (from, to),
        (
            OrderState::Created,
            OrderState::Submitted
                | OrderState::Rejected
                | OrderState::Cancelled
                | OrderState::Expired
        ) | (
            OrderState::Submitted,
            OrderState::PartiallyFilled
                | OrderState::Filled
                | OrderState::Rejected
                | OrderState::Cancelled
                | OrderState::Expired
        ) | (
            OrderState::PartiallyFilled,
            OrderState::PartiallyFilled
                | OrderState::Filled
                | OrderState::Cancelled
                | OrderState::Expired
        )
    )
}

/// Human-readable reason a transition is refused.
#[must_use]
pub fn refusal_reason(from: OrderState, to: OrderState) -> String {
    match from {
        OrderState::Filled => format!("order is already filled, cannot become {to}"),
        OrderState::Rejected => format!("order was rejected, cannot become {to}"),
        OrderState::Cancelled => format!("order is cancelled, cannot become {to}"),
        OrderState::Expired => format!("order has expired, cannot become {to}"),
        _ => format!("no transition from {from} to {to}"),
    }
}
