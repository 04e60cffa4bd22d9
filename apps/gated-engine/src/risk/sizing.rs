//! Position sizing.

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;

use crate::models::{Direction, OrderSide, RejectionCode, RejectionReason, Signal};
use crate::portfolio::PortfolioState;

/// A sized order before the remaining gates run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedOrder {
    /// Side.
    pub side: OrderSide,
    /// Quantity (always positive).
    pub quantity: Decimal,
    /// Price the quantity was sized against.
    pub reference_price: Decimal,
}

/// `floor(strength × max_fraction × portfolio_value / price)`.
///
/// # Errors
///
/// `invalid_quantity` when the arithmetic overflows or goes negative,
/// `zero_quantity` when the result rounds down to nothing.
pub fn entry_quantity(
    strength: f64,
    max_fraction: Decimal,
    portfolio_value: Decimal,
    price: Decimal,
) -> Result<Decimal, RejectionReason> {
    let invalid = |detail: &str| {
        RejectionReason::new(
            RejectionCode::InvalidQuantity,
            format!("position size could not be computed: {detail}"),
        )
    };

    if price <= Decimal::ZERO {
        return Err(invalid("reference price is not positive"));
    }
    let strength = Decimal::from_f64(strength).ok_or_else(|| invalid("strength is not finite"))?;

    let raw = strength
        .checked_mul(max_fraction)
        .and_then(|v| v.checked_mul(portfolio_value))
        .and_then(|v| v.checked_div(price))
        .ok_or_else(|| invalid("arithmetic overflow"))?;

    let quantity = raw.floor();
    if quantity < Decimal::ZERO {
        return Err(invalid(&format!("computed quantity {quantity} is negative")));
    }
    if quantity.is_zero() {
        return Err(RejectionReason::new(
            RejectionCode::ZeroQuantity,
            format!(
                "sized quantity {raw:.4} rounds to zero (value {portfolio_value}, price {price})"
            ),
        ));
    }
    Ok(quantity)
}

/// Size a signal against the portfolio.
///
/// Entries use [`entry_quantity`]; closes flatten the current position.
pub fn size(
    signal: &Signal,
    portfolio: &PortfolioState,
    last_price: Option<Decimal>,
    portfolio_value: Decimal,
    max_fraction: Decimal,
) -> Result<SizedOrder, RejectionReason> {
    let symbol = signal.symbol();
    match signal.direction() {
        Direction::Close => {
            let held = portfolio.quantity(symbol);
            if held.is_zero() {
                return Err(RejectionReason::new(
                    RejectionCode::NoPosition,
                    format!("no open {symbol} position to close"),
                ));
            }
            let reference_price = last_price
                .or_else(|| portfolio.position(symbol).map(|p| p.average_cost))
                .ok_or_else(|| no_price(symbol))?;
            let side = if held > Decimal::ZERO {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            Ok(SizedOrder {
                side,
                quantity: held.abs(),
                reference_price,
            })
        }
        direction @ (Direction::Long | Direction::Short) => {
            let reference_price = last_price.ok_or_else(|| no_price(symbol))?;
            let quantity = entry_quantity(
                signal.strength(),
                max_fraction,
                portfolio_value,
                reference_price,
            )?;
            let side = if direction == Direction::Long {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            Ok(SizedOrder {
                side,
                quantity,
                reference_price,
            })
        }
    }
}

fn no_price(symbol: &str) -> RejectionReason {
    RejectionReason::new(
        RejectionCode::NoReferencePrice,
        format!("no market price observed for {symbol}"),
    )
}
