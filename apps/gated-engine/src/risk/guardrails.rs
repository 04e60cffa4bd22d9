//! Operational guardrails: order counts, reject rate, cooldowns, session.
//!
//! [`GuardrailState`] is owned by the pipeline and updated after each
//! decision and broker outcome. The gate only reads it.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use super::session::{SessionWindow, TradingDay};
use crate::config::{GuardrailConfig, seconds};
use crate::models::{RejectionCode, RejectionReason};

/// Counters the guardrails are evaluated against.
///
/// "Rejects" here are order-level outcomes (broker refusals and NOT_FILLED
/// timeouts), not risk gate rejections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardrailState {
    #[serde(skip)]
    calendar: TradingDay,
    day: Option<NaiveDate>,
    orders_today: u32,
    recent_rejects: VecDeque<DateTime<Utc>>,
    last_reject_by_symbol: BTreeMap<String, DateTime<Utc>>,
    consecutive_rejects: u32,
}

impl GuardrailState {
    /// Fresh state with UTC trading days.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh state whose daily limit rolls over on `calendar`.
    #[must_use]
    pub fn with_trading_day(calendar: TradingDay) -> Self {
        Self {
            calendar,
            ..Self::default()
        }
    }

    /// Count an order submitted at `at` against the daily limit.
    pub fn record_order(&mut self, at: DateTime<Utc>) {
        let day = self.calendar.of(at);
        if self.day != Some(day) {
            self.day = Some(day);
            self.orders_today = 0;
        }
        self.orders_today = self.orders_today.saturating_add(1);
    }

    /// Record an order rejected for `symbol` at `at`.
    pub fn record_reject(&mut self, symbol: &str, at: DateTime<Utc>) {
        self.recent_rejects.push_back(at);
        let horizon = at - Duration::hours(1);
        while self.recent_rejects.front().is_some_and(|t| *t <= horizon) {
            self.recent_rejects.pop_front();
        }
        self.last_reject_by_symbol.insert(symbol.to_string(), at);
        self.consecutive_rejects = self.consecutive_rejects.saturating_add(1);
    }

    /// Record an order the broker accepted, ending a reject streak.
    pub const fn record_accept(&mut self) {
        self.consecutive_rejects = 0;
    }

    /// Clear the reject streak after an operator reset.
    pub const fn clear_streak(&mut self) {
        self.consecutive_rejects = 0;
    }

    /// Orders submitted on the trading day of `at`.
    #[must_use]
    pub fn orders_on(&self, at: DateTime<Utc>) -> u32 {
        if self.day == Some(self.calendar.of(at)) {
            self.orders_today
        } else {
            0
        }
    }

    /// Rejects in the hour ending at `at`.
    #[must_use]
    pub fn rejects_in_hour_before(&self, at: DateTime<Utc>) -> usize {
        let horizon = at - Duration::hours(1);
        self.recent_rejects
            .iter()
            .filter(|t| **t > horizon && **t <= at)
            .count()
    }

    /// Most recent reject for `symbol`.
    #[must_use]
    pub fn last_reject(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.last_reject_by_symbol.get(symbol).copied()
    }

    /// Current reject streak.
    #[must_use]
    pub const fn consecutive_rejects(&self) -> u32 {
        self.consecutive_rejects
    }
}

/// Run every guardrail; each failure adds its own reason.
pub(super) fn evaluate(
    config: &GuardrailConfig,
    session: Option<&SessionWindow>,
    state: &GuardrailState,
    symbol: &str,
    at: DateTime<Utc>,
) -> Vec<RejectionReason> {
    let mut reasons = Vec::new();

    if let Some(limit) = config.max_daily_orders {
        let today = state.orders_on(at);
        if today >= limit {
            reasons.push(RejectionReason::new(
                RejectionCode::DailyOrderLimit,
                format!("{today} orders today reaches the daily limit of {limit}"),
            ));
        }
    }

    if let Some(limit) = config.max_rejects_per_hour {
        let recent = state.rejects_in_hour_before(at);
        if recent >= limit as usize {
            reasons.push(RejectionReason::new(
                RejectionCode::RejectRateLimit,
                format!("{recent} rejects in the last hour reaches the limit of {limit}"),
            ));
        }
    }

    if config.symbol_cooldown_secs > 0
        && let Some(last) = state.last_reject(symbol)
    {
        let until = last.checked_add_signed(seconds(config.symbol_cooldown_secs));
        if until.is_none_or(|until| at < until) {
            let until = until.map_or_else(|| "further notice".to_string(), |t| t.to_string());
            reasons.push(RejectionReason::new(
                RejectionCode::SymbolCooldown,
                format!("{symbol} is cooling down until {until} after a reject at {last}"),
            ));
        }
    }

    if let Some(window) = session
        && !window.contains(at)
    {
        reasons.push(RejectionReason::new(
            RejectionCode::OutsideSession,
            format!("{at} is outside the {} trading session", window.timezone()),
        ));
    }

    if let Some(limit) = config.max_consecutive_rejects {
        let streak = state.consecutive_rejects();
        if streak >= limit {
            reasons.push(RejectionReason::new(
                RejectionCode::ConsecutiveRejectStop,
                format!("{streak} consecutive order rejects reaches the auto-stop limit of {limit}"),
            ));
        }
    }

    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, hour, minute, 0).unwrap()
    }

    fn codes(reasons: &[RejectionReason]) -> Vec<RejectionCode> {
        reasons.iter().map(|r| r.code).collect()
    }

    #[test]
    fn daily_counter_rolls_over() {
        let mut state = GuardrailState::new();
        state.record_order(at(15, 0));
        state.record_order(at(16, 0));
        assert_eq!(state.orders_on(at(17, 0)), 2);
        assert_eq!(state.orders_on(at(17, 0) + Duration::days(1)), 0);
    }

    #[test]
    fn all_failing_guardrails_are_reported() {
        let config = GuardrailConfig {
            max_daily_orders: Some(1),
            max_rejects_per_hour: Some(2),
            symbol_cooldown_secs: 600,
            max_consecutive_rejects: Some(2),
            session: None,
        };
        let mut state = GuardrailState::new();
        state.record_order(at(15, 0));
        state.record_reject("AAPL", at(15, 1));
        state.record_reject("AAPL", at(15, 2));

        let reasons = evaluate(&config, None, &state, "AAPL", at(15, 5));
        assert_eq!(
            codes(&reasons),
            vec![
                RejectionCode::DailyOrderLimit,
                RejectionCode::RejectRateLimit,
                RejectionCode::SymbolCooldown,
                RejectionCode::ConsecutiveRejectStop,
            ]
        );
    }

    #[test]
    fn cooldown_and_rate_expire() {
        let config = GuardrailConfig {
            symbol_cooldown_secs: 300,
            max_rejects_per_hour: Some(1),
            ..GuardrailConfig::default()
        };
        let mut state = GuardrailState::new();
        state.record_reject("AAPL", at(15, 0));
        state.record_accept();

        assert!(evaluate(&config, None, &state, "MSFT", at(15, 1))
            .iter()
            .all(|r| r.code != RejectionCode::SymbolCooldown));
        assert!(evaluate(&config, None, &state, "AAPL", at(16, 1)).is_empty());
    }

    #[test]
    fn daily_counter_rolls_over_on_the_session_date() {
        let session = SessionWindow::from_config(&crate::config::SessionConfig::default()).unwrap();
        let mut state = GuardrailState::with_trading_day(session.trading_day());
        // 20:00 UTC and 01:00 UTC next day are both March 4th in New York.
        state.record_order(at(20, 0));
        let evening = at(20, 0) + Duration::hours(5);
        assert_eq!(state.orders_on(evening), 1);
        let mut utc = GuardrailState::new();
        utc.record_order(at(20, 0));
        assert_eq!(utc.orders_on(evening), 0);
        state.record_order(evening);
        assert_eq!(state.orders_on(at(20, 0)), 2);
    }

    #[test]
    fn oversized_cooldown_blocks_without_overflow() {
        let config = GuardrailConfig {
            symbol_cooldown_secs: u64::MAX,
            ..GuardrailConfig::default()
        };
        let mut state = GuardrailState::new();
        state.record_reject("AAPL", at(15, 0));
        state.record_accept();

        let reasons = evaluate(&config, None, &state, "AAPL", at(15, 0) + Duration::days(3650));
        assert_eq!(codes(&reasons), vec![RejectionCode::SymbolCooldown]);
    }

    #[test]
    fn outside_session_is_rejected() {
        let config = GuardrailConfig::default();
        let session = SessionWindow::from_config(&crate::config::SessionConfig::default()).unwrap();
        let reasons = evaluate(&config, Some(&session), &GuardrailState::new(), "AAPL", at(3, 0));
        assert_eq!(codes(&reasons), vec![RejectionCode::OutsideSession]);
    }
}
