//! Symbol, sector and correlated-group exposure limits.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::config::{ConcentrationConfig, ConcentrationMode, CorrelationConfig};
use crate::models::{OrderSide, RejectionCode, RejectionReason};
use crate::portfolio::PortfolioState;

/// Proposed entry being checked.
#[derive(Debug, Clone, Copy)]
pub(super) struct Proposal<'a> {
    pub symbol: &'a str,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
}

/// Outcome of the concentration check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Concentration {
    /// Within every limit.
    Within,
    /// Reduced to the largest compliant quantity.
    ScaledDown(Decimal),
    /// Breaches one or more limits.
    Breached(Vec<RejectionReason>),
}

struct Limit {
    code: RejectionCode,
    label: String,
    /// Exposure the order's symbol may carry after the trade.
    room: Decimal,
}

pub(super) fn evaluate(
    config: &ConcentrationConfig,
    table: &CorrelationConfig,
    portfolio: &PortfolioState,
    marks: &BTreeMap<String, Decimal>,
    portfolio_value: Decimal,
    proposal: Proposal<'_>,
) -> Concentration {
    let symbol = proposal.symbol;
    let mut limits = vec![Limit {
        code: RejectionCode::SymbolConcentration,
        label: symbol.to_string(),
        room: config.max_symbol_fraction * portfolio_value,
    }];

    if let Some(sector) = table.sector(symbol) {
        let others: Decimal = portfolio
            .positions()
            .keys()
            .filter(|s| s.as_str() != symbol && table.sector(s) == Some(sector))
            .map(|s| portfolio.exposure(s, marks))
            .sum();
        limits.push(Limit {
            code: RejectionCode::SectorConcentration,
            label: format!("sector {sector}"),
            room: config.max_sector_fraction * portfolio_value - others,
        });
    }

    let peers = table.correlated_with(symbol);
    if !peers.is_empty() {
        let others: Decimal = peers.iter().map(|s| portfolio.exposure(s, marks)).sum();
        limits.push(Limit {
            code: RejectionCode::CorrelatedExposure,
            label: format!("{symbol} with correlated {}", peers.join(",")),
            room: config.max_correlated_fraction * portfolio_value - others,
        });
    }

    // Largest q with |current + side·q| × price <= room is floor(room/price - side·current).
    let signed_current = proposal.side.sign() * portfolio.quantity(symbol);
    let mut breaches = Vec::new();
    let mut allowed = proposal.quantity;
    for limit in &limits {
        let max_quantity = (limit.room / proposal.price - signed_current).floor();
        if proposal.quantity > max_quantity {
            let post = (portfolio.quantity(symbol) + proposal.side.sign() * proposal.quantity).abs()
                * proposal.price;
            breaches.push(RejectionReason::new(
                limit.code,
                format!(
                    "{} exposure {post} would exceed the room of {} (at most {} units)",
                    limit.label,
                    limit.room.max(Decimal::ZERO).round_dp(2),
                    max_quantity.max(Decimal::ZERO)
                ),
            ));
            allowed = allowed.min(max_quantity);
        }
    }

    if breaches.is_empty() {
        return Concentration::Within;
    }
    match config.mode {
        ConcentrationMode::ScaleDown if allowed > Decimal::ZERO => Concentration::ScaledDown(allowed),
        _ => Concentration::Breached(breaches),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorrelationPair;
    use crate::models::OrderId;
    use crate::portfolio::Fill;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn holding(symbol: &str, quantity: Decimal, price: Decimal) -> PortfolioState {
        let mut portfolio = PortfolioState::new("USD", dec!(100000));
        portfolio
            .apply_fill(&Fill {
                fill_id: format!("{symbol}-1"),
                order_id: OrderId::new("seed"),
                symbol: symbol.to_string(),
                side: OrderSide::Buy,
                quantity,
                price,
                commission: Decimal::ZERO,
                timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap(),
            })
            .unwrap();
        portfolio
    }

    fn table() -> CorrelationConfig {
        CorrelationConfig {
            sectors: BTreeMap::from([
                ("AAPL".to_string(), "tech".to_string()),
                ("MSFT".to_string(), "tech".to_string()),
            ]),
            pairs: vec![CorrelationPair {
                a: "AAPL".into(),
                b: "MSFT".into(),
                rho: 0.9,
            }],
            threshold: 0.7,
        }
    }

    fn proposal(quantity: Decimal) -> Proposal<'static> {
        Proposal {
            symbol: "AAPL",
            side: OrderSide::Buy,
            quantity,
            price: dec!(100),
        }
    }

    #[test]
    fn within_limits_passes() {
        let portfolio = PortfolioState::new("USD", dec!(100000));
        let marks = BTreeMap::new();
        let result = evaluate(
            &ConcentrationConfig::default(),
            &table(),
            &portfolio,
            &marks,
            dec!(100000),
            proposal(dec!(100)),
        );
        assert_eq!(result, Concentration::Within);
    }

    #[test]
    fn sector_and_correlated_limits_count_peers() {
        // 35k of MSFT already held; AAPL adds 10k.
        let portfolio = holding("MSFT", dec!(350), dec!(100));
        let marks = BTreeMap::from([("MSFT".to_string(), dec!(100))]);
        let result = evaluate(
            &ConcentrationConfig::default(),
            &table(),
            &portfolio,
            &marks,
            dec!(100000),
            proposal(dec!(100)),
        );
        let Concentration::Breached(reasons) = result else {
            panic!("expected a breach, got {result:?}");
        };
        let codes: Vec<_> = reasons.iter().map(|r| r.code).collect();
        assert_eq!(codes, vec![RejectionCode::SectorConcentration]);
    }

    #[test]
    fn scale_down_picks_tightest_limit() {
        let portfolio = holding("MSFT", dec!(350), dec!(100));
        let marks = BTreeMap::from([("MSFT".to_string(), dec!(100))]);
        let config = ConcentrationConfig {
            mode: ConcentrationMode::ScaleDown,
            ..ConcentrationConfig::default()
        };
        let result = evaluate(&config, &table(), &portfolio, &marks, dec!(100000), proposal(dec!(100)));
        // Sector room is 40k - 35k = 5k, so 50 shares at 100.
        assert_eq!(result, Concentration::ScaledDown(dec!(50)));
    }

    #[test]
    fn scale_down_with_no_room_rejects() {
        let portfolio = holding("AAPL", dec!(250), dec!(100));
        let marks = BTreeMap::from([("AAPL".to_string(), dec!(100))]);
        let config = ConcentrationConfig {
            mode: ConcentrationMode::ScaleDown,
            ..ConcentrationConfig::default()
        };
        let result = evaluate(
            &config,
            &CorrelationConfig::default(),
            &portfolio,
            &marks,
            dec!(100000),
            proposal(dec!(10)),
        );
        assert!(matches!(result, Concentration::Breached(_)));
    }
}
