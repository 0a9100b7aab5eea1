//! Portfolio limits, position sizing and daily-state bookkeeping.
//!
//! Every candidate runs through the ordered limit checks first; only a
//! candidate that clears all of them is sized and priced. The daily state is
//! persisted through the injected store before it replaces the live copy.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::daily_state::{DailyRiskState, Reservation};
use super::store::DailyStateStore;
use crate::broker::AccountSnapshot;
use crate::config::{ExecutionConfig, RiskConfig};
use crate::decision::ReasonCode;
use crate::strategy::{BracketPrices, Candidate, OrderPlanValidator};
use crate::utils::decimal::floor_shares;

/// Intermediate sizing figures, kept for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sizing {
    pub stop_distance: Decimal,
    pub risk_qty: Decimal,
    pub size_usd: Decimal,
    pub qty: Decimal,
    pub notional: Decimal,
}

/// A risk-approved, sized and priced candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePlan {
    pub symbol: String,
    pub score: Decimal,
    pub secondary_strength: Decimal,
    pub liquidity: Decimal,
    pub prices: BracketPrices,
    pub qty: Decimal,
    pub notional: Decimal,
    pub sizing: Sizing,
}

/// Outcome of evaluating one ranked candidate.
pub type PlanResult = Result<CandidatePlan, ReasonCode>;

pub struct RiskManager {
    config: RiskConfig,
    validator: OrderPlanValidator,
    store: Arc<dyn DailyStateStore>,
    state: DailyRiskState,
}

impl RiskManager {
    /// Resume from the store, or start empty.
    ///
    /// An empty start uses the earliest possible day, so the first call to
    /// [`RiskManager::roll_day`] adopts the broker's trading day.
    pub fn load(config: RiskConfig, execution: &ExecutionConfig, store: Arc<dyn DailyStateStore>) -> Result<Self> {
        let state = store
            .load_daily_state()
            .context("Failed to load daily risk state")?
            .unwrap_or_else(|| DailyRiskState::fresh(NaiveDate::MIN));

        if state.trading_day != NaiveDate::MIN {
            info!(
                day = %state.trading_day,
                spent = %state.spent_today_usd,
                new_positions = state.new_positions_today,
                "Resumed daily risk state"
            );
        }

        Ok(Self {
            validator: OrderPlanValidator::new(execution, &config),
            config,
            store,
            state,
        })
    }

    pub fn state(&self) -> &DailyRiskState {
        &self.state
    }

    pub fn validator(&self) -> &OrderPlanValidator {
        &self.validator
    }

    fn commit(&mut self, next: DailyRiskState) -> Result<()> {
        self.store
            .save_daily_state(&next)
            .context("Failed to persist daily risk state")?;
        self.state = next;
        Ok(())
    }

    /// Reset the counters when `today` is a new trading day. Returns whether it rolled.
    pub fn roll_day(&mut self, today: NaiveDate) -> Result<bool> {
        if !self.state.needs_roll(today) {
            return Ok(false);
        }
        let previous = self.state.trading_day;
        self.commit(self.state.rolled_to(today))?;
        info!(from = %previous, to = %today, "Daily risk state rolled over");
        Ok(true)
    }

    /// Effective daily spend cap; `None` when neither cap is set.
    pub fn daily_cap(&self, buying_power: Decimal) -> Option<Decimal> {
        let usd = (self.config.daily_max_spend_usd > Decimal::ZERO).then_some(self.config.daily_max_spend_usd);
        let pct = (self.config.daily_max_spend_pct_buying_power > Decimal::ZERO)
            .then(|| buying_power.max(Decimal::ZERO) * self.config.daily_max_spend_pct_buying_power);
        match (usd, pct) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Reject on the first failing limit, in a fixed order.
    pub fn check_limits(&self, symbol: &str, account: &AccountSnapshot, today: NaiveDate) -> Result<(), ReasonCode> {
        self.check_limits_against(&self.state, symbol, account, today)
    }

    fn check_limits_against(
        &self,
        state: &DailyRiskState,
        symbol: &str,
        account: &AccountSnapshot,
        today: NaiveDate,
    ) -> Result<(), ReasonCode> {
        let cfg = &self.config;

        if let Some(cap) = self.daily_cap(account.buying_power) {
            if state.spent_today_usd >= cap {
                return Err(ReasonCode::DailySpendExceeded);
            }
        }
        if cfg.daily_max_new_positions > 0 && state.new_positions_today >= cfg.daily_max_new_positions {
            return Err(ReasonCode::DailyPositionsExceeded);
        }
        if cfg.max_total_open_positions > 0
            && account.open_position_count() >= cfg.max_total_open_positions as usize
        {
            return Err(ReasonCode::MaxOpenPositions);
        }
        if account.equity <= Decimal::ZERO {
            return Err(ReasonCode::InvalidEquity);
        }
        if cfg.cash_buffer_pct > Decimal::ZERO && account.cash / account.equity < cfg.cash_buffer_pct {
            return Err(ReasonCode::CashBuffer);
        }
        if cfg.max_exposure_pct > Decimal::ZERO
            && account.total_exposure() / account.equity >= cfg.max_exposure_pct
        {
            return Err(ReasonCode::MaxExposure);
        }
        if cfg.max_symbol_exposure_pct > Decimal::ZERO
            && account.symbol_exposure(symbol) / account.equity >= cfg.max_symbol_exposure_pct
        {
            return Err(ReasonCode::SymbolExposure);
        }
        if cfg.skip_if_position_open && account.has_position(symbol) {
            return Err(ReasonCode::PositionOpen);
        }
        if cfg.skip_if_order_pending && (account.has_pending_entry(symbol) || state.is_pending(symbol)) {
            return Err(ReasonCode::OrderPending);
        }
        if state.traded_today(symbol) {
            return Err(ReasonCode::SymbolTradedToday);
        }
        if cfg.cooldown_days > 0 {
            if let Some(days) = state.days_since_last_trade(symbol, today) {
                if days < i64::from(cfg.cooldown_days) {
                    return Err(ReasonCode::SymbolCooldown);
                }
            }
        }
        Ok(())
    }

    /// Risk-budget size, capped by every configured notional limit.
    pub fn size(
        &self,
        price: Decimal,
        volatility: Decimal,
        symbol: &str,
        account: &AccountSnapshot,
    ) -> Result<Sizing, ReasonCode> {
        self.size_against(&self.state, price, volatility, symbol, account)
    }

    fn size_against(
        &self,
        state: &DailyRiskState,
        price: Decimal,
        volatility: Decimal,
        symbol: &str,
        account: &AccountSnapshot,
    ) -> Result<Sizing, ReasonCode> {
        let cfg = &self.config;
        if price <= Decimal::ZERO {
            return Err(ReasonCode::InvalidPrice);
        }

        let stop_distance = (volatility.max(Decimal::ZERO) * cfg.atr_multiplier).max(price * cfg.min_stop_pct);
        if stop_distance <= Decimal::ZERO {
            return Err(ReasonCode::InvalidStopDistance);
        }

        let risk_budget = account.equity * cfg.max_symbol_risk_pct;
        let risk_qty = floor_shares(risk_budget / stop_distance);

        let mut limits = vec![account.cash - account.equity * cfg.cash_buffer_pct];
        if cfg.max_position_size_usd > Decimal::ZERO {
            limits.push(cfg.max_position_size_usd);
        }
        if let Some(cap) = self.daily_cap(account.buying_power) {
            limits.push(cap - state.spent_today_usd);
        }
        if cfg.max_symbol_exposure_pct > Decimal::ZERO {
            limits.push(account.equity * cfg.max_symbol_exposure_pct - account.symbol_exposure(symbol));
        }
        let size_usd = limits.into_iter().min().unwrap_or(Decimal::ZERO);
        if size_usd <= Decimal::ZERO {
            return Err(ReasonCode::InvalidPlanSpend);
        }

        let max_affordable_qty = floor_shares(size_usd / price);
        let qty = risk_qty.min(max_affordable_qty);
        if qty <= Decimal::ZERO {
            return Err(ReasonCode::InvalidPlanSpend);
        }

        let notional = qty * price;
        if cfg.min_position_size_usd > Decimal::ZERO && notional < cfg.min_position_size_usd {
            return Err(ReasonCode::SizeBelowMin);
        }

        Ok(Sizing {
            stop_distance,
            risk_qty,
            size_usd,
            qty,
            notional,
        })
    }

    /// Limits, then sizing, then bracket prices.
    pub fn evaluate(&self, candidate: &Candidate, account: &AccountSnapshot, today: NaiveDate) -> PlanResult {
        self.evaluate_against(&self.state, candidate, account, today)
    }

    fn evaluate_against(
        &self,
        state: &DailyRiskState,
        candidate: &Candidate,
        account: &AccountSnapshot,
        today: NaiveDate,
    ) -> PlanResult {
        let symbol = candidate.symbol.as_str();
        self.check_limits_against(state, symbol, account, today)?;
        let sizing = self.size_against(state, candidate.price, candidate.volatility, symbol, account)?;
        let prices = self
            .validator
            .compute(candidate.price, candidate.volatility, sizing.stop_distance)?;

        debug!(
            symbol,
            risk_qty = %sizing.risk_qty,
            size_usd = %sizing.size_usd,
            qty = %sizing.qty,
            stop = %prices.stop,
            take_profit = %prices.take_profit,
            stop_pct = %(OrderPlanValidator::stop_fraction(&prices) * Decimal::ONE_HUNDRED).round_dp(2),
            "Candidate sized"
        );

        Ok(CandidatePlan {
            symbol: symbol.to_string(),
            score: candidate.score,
            secondary_strength: candidate.secondary_strength,
            liquidity: candidate.liquidity,
            prices,
            qty: sizing.qty,
            notional: sizing.notional,
            sizing,
        })
    }

    /// Evaluate a ranked list against working copies of the state and
    /// account, so later candidates see earlier approvals. Nothing is persisted.
    pub fn plan_trades(
        &self,
        candidates: &[Candidate],
        account: &AccountSnapshot,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Vec<(String, PlanResult)> {
        let mut state = self.state.rolled_to(today);
        let mut account = account.clone();
        candidates
            .iter()
            .map(|candidate| {
                let result = self.evaluate_against(&state, candidate, &account, today);
                if let Ok(plan) = &result {
                    state = state.with_approval(&plan.symbol, plan.notional, now).0;
                    account.apply_entry(&plan.symbol, plan.qty, plan.prices.entry);
                }
                (candidate.symbol.clone(), result)
            })
            .collect()
    }

    /// Count an approved entry before it is submitted.
    pub fn record_approval(&mut self, plan: &CandidatePlan, now: DateTime<Utc>) -> Result<Reservation> {
        let (next, reservation) = self.state.with_approval(&plan.symbol, plan.notional, now);
        self.commit(next)?;
        info!(
            symbol = %plan.symbol,
            notional = %plan.notional,
            spent_today = %self.state.spent_today_usd,
            new_positions = self.state.new_positions_today,
            "Entry approved"
        );
        Ok(reservation)
    }

    /// Broker acknowledged the entry.
    pub fn confirm(&mut self, symbol: &str) -> Result<()> {
        if !self.state.is_pending(symbol) {
            return Ok(());
        }
        self.commit(self.state.with_confirmed(symbol))
    }

    /// Broker definitively refused the entry; give the budget back.
    pub fn release(&mut self, reservation: &Reservation) -> Result<()> {
        self.commit(self.state.with_released(reservation))?;
        info!(
            symbol = %reservation.symbol,
            notional = %reservation.notional,
            "Entry approval released"
        );
        Ok(())
    }

    /// Remaining daily budget, for status output.
    pub fn remaining_daily_budget(&self, buying_power: Decimal) -> Option<Decimal> {
        self.daily_cap(buying_power)
            .map(|cap| (cap - self.state.spent_today_usd).max(Decimal::ZERO))
    }

    /// Settle entries left pending by an unresolved submission.
    ///
    /// A position or a working entry at the broker confirms the entry;
    /// otherwise the broker never took it and the reservation is released.
    /// Returns the released symbols.
    pub fn resolve_pending(&mut self, account: &AccountSnapshot) -> Result<Vec<String>> {
        let pending: Vec<Reservation> = self.state.pending_entries.values().cloned().collect();
        let mut released = Vec::new();
        for reservation in pending {
            let symbol = reservation.symbol.as_str();
            if account.has_position(symbol) || account.has_pending_entry(symbol) {
                info!(%symbol, "Pending entry found at broker; confirmed");
                self.confirm(symbol)?;
            } else {
                self.release(&reservation)?;
                released.push(reservation.symbol);
            }
        }
        Ok(released)
    }
}
