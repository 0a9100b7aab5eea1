//! Per-trading-day risk counters.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Counters for one exchange-local trading day.
///
/// Values are replaced, never patched in place: every mutation produces a new
/// state that is persisted before it becomes the live one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyRiskState {
    pub trading_day: NaiveDate,
    pub spent_today_usd: Decimal,
    pub new_positions_today: u32,
    pub symbols_traded_today: BTreeSet<String>,
    /// Survives day rollover; drives the cooldown check
    pub symbol_last_trade: BTreeMap<String, NaiveDate>,
    /// Reserved but unconfirmed entries, kept so a restart can still release them
    pub pending_entries: BTreeMap<String, Reservation>,
    pub last_trade_time: Option<DateTime<Utc>>,
}

/// Undo information for an approval whose submission failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub symbol: String,
    pub notional: Decimal,
    pub trading_day: NaiveDate,
    prior_last_trade: Option<NaiveDate>,
    prior_last_trade_time: Option<DateTime<Utc>>,
}

impl DailyRiskState {
    pub fn fresh(trading_day: NaiveDate) -> Self {
        Self {
            trading_day,
            spent_today_usd: Decimal::ZERO,
            new_positions_today: 0,
            symbols_traded_today: BTreeSet::new(),
            symbol_last_trade: BTreeMap::new(),
            pending_entries: BTreeMap::new(),
            last_trade_time: None,
        }
    }

    /// State for `today`: counters reset only when `today` is a later day.
    pub fn rolled_to(&self, today: NaiveDate) -> Self {
        if today <= self.trading_day {
            return self.clone();
        }
        Self {
            symbol_last_trade: self.symbol_last_trade.clone(),
            last_trade_time: self.last_trade_time,
            ..Self::fresh(today)
        }
    }

    pub fn needs_roll(&self, today: NaiveDate) -> bool {
        today > self.trading_day
    }

    pub fn is_pending(&self, symbol: &str) -> bool {
        self.pending_entries.contains_key(symbol)
    }

    pub fn pending_reservation(&self, symbol: &str) -> Option<&Reservation> {
        self.pending_entries.get(symbol)
    }

    pub fn traded_today(&self, symbol: &str) -> bool {
        self.symbols_traded_today.contains(symbol)
    }

    /// Whole days since the last entry in `symbol`, if it was ever traded.
    pub fn days_since_last_trade(&self, symbol: &str, today: NaiveDate) -> Option<i64> {
        self.symbol_last_trade
            .get(symbol)
            .map(|last| (today - *last).num_days())
    }

    /// Count an approved entry and mark it pending.
    pub fn with_approval(&self, symbol: &str, notional: Decimal, now: DateTime<Utc>) -> (Self, Reservation) {
        let reservation = Reservation {
            symbol: symbol.to_string(),
            notional,
            trading_day: self.trading_day,
            prior_last_trade: self.symbol_last_trade.get(symbol).copied(),
            prior_last_trade_time: self.last_trade_time,
        };

        let mut next = self.clone();
        next.spent_today_usd += notional;
        next.new_positions_today += 1;
        next.symbols_traded_today.insert(symbol.to_string());
        next.symbol_last_trade.insert(symbol.to_string(), self.trading_day);
        next.pending_entries.insert(symbol.to_string(), reservation.clone());
        next.last_trade_time = Some(now);
        (next, reservation)
    }

    /// Clear the pending flag once the broker acknowledged the entry.
    pub fn with_confirmed(&self, symbol: &str) -> Self {
        let mut next = self.clone();
        next.pending_entries.remove(symbol);
        next
    }

    /// Revert an approval. A reservation from an earlier day is a no-op,
    /// since its counters were already reset.
    pub fn with_released(&self, reservation: &Reservation) -> Self {
        if reservation.trading_day != self.trading_day {
            return self.clone();
        }
        let symbol = reservation.symbol.as_str();
        let mut next = self.clone();
        next.spent_today_usd = (next.spent_today_usd - reservation.notional).max(Decimal::ZERO);
        next.new_positions_today = next.new_positions_today.saturating_sub(1);
        next.symbols_traded_today.remove(symbol);
        next.pending_entries.remove(symbol);
        match reservation.prior_last_trade {
            Some(day) => {
                next.symbol_last_trade.insert(symbol.to_string(), day);
            }
            None => {
                next.symbol_last_trade.remove(symbol);
            }
        }
        next.last_trade_time = reservation.prior_last_trade_time;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_rollover_resets_counters_keeps_history() {
        let (state, _) = DailyRiskState::fresh(day(2)).with_approval("AAPL", dec!(500), Utc::now());
        assert_eq!(state.spent_today_usd, dec!(500));
        assert!(state.traded_today("AAPL"));

        let same_day = state.rolled_to(day(2));
        assert_eq!(same_day, state);
        // an earlier clock reading never resets
        assert_eq!(state.rolled_to(day(1)), state);

        let next = state.rolled_to(day(3));
        assert_eq!(next.trading_day, day(3));
        assert_eq!(next.spent_today_usd, Decimal::ZERO);
        assert_eq!(next.new_positions_today, 0);
        assert!(!next.traded_today("AAPL"));
        assert!(next.pending_entries.is_empty());
        assert_eq!(next.symbol_last_trade.get("AAPL"), Some(&day(2)));
        assert_eq!(next.days_since_last_trade("AAPL", day(5)), Some(3));
    }

    #[test]
    fn test_release_restores_prior_state() {
        let mut base = DailyRiskState::fresh(day(9));
        base.symbol_last_trade.insert("MSFT".to_string(), day(2));

        let (reserved, reservation) = base.with_approval("MSFT", dec!(250), Utc::now());
        assert!(reserved.is_pending("MSFT"));
        assert_eq!(reserved.symbol_last_trade["MSFT"], day(9));

        let released = reserved.with_released(&reservation);
        assert_eq!(released, base);
    }

    #[test]
    fn test_release_from_previous_day_is_noop() {
        let (reserved, reservation) = DailyRiskState::fresh(day(2)).with_approval("X", dec!(10), Utc::now());
        let next_day = reserved.rolled_to(day(3));
        assert_eq!(next_day.with_released(&reservation), next_day);
    }

    #[test]
    fn test_confirm_clears_pending_only() {
        let (reserved, _) = DailyRiskState::fresh(day(2)).with_approval("X", dec!(10), Utc::now());
        let confirmed = reserved.with_confirmed("X");
        assert!(!confirmed.is_pending("X"));
        assert_eq!(confirmed.new_positions_today, 1);
    }
}
