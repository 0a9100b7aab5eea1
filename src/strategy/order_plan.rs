//! Bracket price computation and validation.
//!
//! A [`BracketOrderPlan`] can only be built through [`OrderPlanValidator`],
//! so every entry that reaches the broker carries a validated stop and target.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::{ExecutionConfig, RiskConfig};
use crate::decision::ReasonCode;
use crate::utils::decimal::{equity_tick, round_to_tick, safe_div, TickRounding};

/// Tick-rounded bracket prices for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BracketPrices {
    pub entry: Decimal,
    pub stop: Decimal,
    /// Limit leg of the stop; `None` submits a plain stop
    pub stop_limit: Option<Decimal>,
    pub take_profit: Decimal,
    pub reward_risk: Decimal,
}

/// Validated entry with attached stop-loss and take-profit legs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BracketOrderPlan {
    symbol: String,
    qty: Decimal,
    prices: BracketPrices,
    client_order_id: String,
    time_in_force: String,
}

impl BracketOrderPlan {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Whole shares.
    pub fn qty(&self) -> Decimal {
        self.qty
    }

    pub fn entry_price(&self) -> Decimal {
        self.prices.entry
    }

    pub fn stop_price(&self) -> Decimal {
        self.prices.stop
    }

    pub fn stop_limit_price(&self) -> Option<Decimal> {
        self.prices.stop_limit
    }

    pub fn take_profit_price(&self) -> Decimal {
        self.prices.take_profit
    }

    pub fn reward_risk(&self) -> Decimal {
        self.prices.reward_risk
    }

    pub fn client_order_id(&self) -> &str {
        &self.client_order_id
    }

    pub fn time_in_force(&self) -> &str {
        &self.time_in_force
    }

    pub fn notional(&self) -> Decimal {
        self.qty * self.prices.entry
    }
}

/// Check stop < entry < target and reward/risk; returns the ratio.
pub fn validate_bracket(
    entry: Decimal,
    stop: Decimal,
    take_profit: Decimal,
    min_reward_risk: Decimal,
) -> Result<Decimal, ReasonCode> {
    if entry <= Decimal::ZERO || stop <= Decimal::ZERO || take_profit <= Decimal::ZERO {
        return Err(ReasonCode::InvalidBracketPrices);
    }
    if stop >= entry || take_profit <= entry {
        return Err(ReasonCode::InvalidBracketPrices);
    }
    let reward_risk = (take_profit - entry) / (entry - stop);
    if reward_risk < min_reward_risk {
        return Err(ReasonCode::RrRatioLow);
    }
    Ok(reward_risk)
}

/// Deterministic client order id, so a resubmitted entry is recognized.
pub fn client_order_id(symbol: &str, trading_day: NaiveDate, entry: Decimal) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", symbol, trading_day, entry.normalize()).as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("bt-{}", &digest[..40])
}

/// Computes and validates bracket prices.
#[derive(Debug, Clone)]
pub struct OrderPlanValidator {
    take_profit_atr_mult: Decimal,
    min_reward_risk: Decimal,
    slippage_buffer_pct: Decimal,
    tick_ge_1: Decimal,
    tick_lt_1: Decimal,
    time_in_force: String,
}

impl OrderPlanValidator {
    pub fn new(execution: &ExecutionConfig, risk: &RiskConfig) -> Self {
        Self {
            take_profit_atr_mult: execution.take_profit_atr_mult,
            min_reward_risk: execution.min_reward_risk,
            slippage_buffer_pct: execution.slippage_buffer_pct,
            tick_ge_1: risk.tick_ge_1,
            tick_lt_1: risk.tick_lt_1,
            time_in_force: execution.time_in_force.clone(),
        }
    }

    fn round(&self, price: Decimal, mode: TickRounding) -> Decimal {
        round_to_tick(price, equity_tick(price, self.tick_ge_1, self.tick_lt_1), mode)
    }

    /// Stop `stop_distance` below entry, target a volatility multiple above it.
    ///
    /// Stops round down and targets round up. Without a usable volatility
    /// measure the target sits at exactly the minimum reward/risk.
    pub fn compute(
        &self,
        entry: Decimal,
        volatility: Decimal,
        stop_distance: Decimal,
    ) -> Result<BracketPrices, ReasonCode> {
        if entry <= Decimal::ZERO || stop_distance <= Decimal::ZERO {
            return Err(ReasonCode::InvalidBracketPrices);
        }

        let stop = self.round(entry - stop_distance, TickRounding::Down);
        let target_distance = if volatility > Decimal::ZERO {
            volatility * self.take_profit_atr_mult
        } else {
            stop_distance * self.min_reward_risk
        };
        let take_profit = self.round(entry + target_distance, TickRounding::Up);

        let reward_risk = validate_bracket(entry, stop, take_profit, self.min_reward_risk)?;

        let stop_limit = if self.slippage_buffer_pct > Decimal::ZERO {
            let limit = self.round(stop * (Decimal::ONE - self.slippage_buffer_pct), TickRounding::Down);
            (limit > Decimal::ZERO).then_some(limit)
        } else {
            None
        };

        Ok(BracketPrices {
            entry,
            stop,
            stop_limit,
            take_profit,
            reward_risk,
        })
    }

    /// Freeze prices and size into a submittable plan, re-checking the invariants.
    pub fn build_plan(
        &self,
        symbol: &str,
        qty: Decimal,
        prices: BracketPrices,
        trading_day: NaiveDate,
    ) -> Result<BracketOrderPlan, ReasonCode> {
        if qty <= Decimal::ZERO || qty.fract() != Decimal::ZERO {
            return Err(ReasonCode::InvalidPlanSpend);
        }
        let reward_risk =
            validate_bracket(prices.entry, prices.stop, prices.take_profit, self.min_reward_risk)?;
        if let Some(limit) = prices.stop_limit {
            if limit <= Decimal::ZERO || limit > prices.stop {
                return Err(ReasonCode::InvalidBracketPrices);
            }
        }

        Ok(BracketOrderPlan {
            symbol: symbol.to_string(),
            qty,
            prices: BracketPrices {
                reward_risk,
                ..prices
            },
            client_order_id: client_order_id(symbol, trading_day, prices.entry),
            time_in_force: self.time_in_force.clone(),
        })
    }

    /// Risk per share as a fraction of entry, for logging.
    pub fn stop_fraction(prices: &BracketPrices) -> Decimal {
        safe_div(prices.entry - prices.stop, prices.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn validator() -> OrderPlanValidator {
        OrderPlanValidator::new(&ExecutionConfig::default(), &RiskConfig::default())
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    #[test]
    fn test_compute_bracket() {
        let prices = validator().compute(dec!(100), dec!(5), dec!(10)).unwrap();
        assert_eq!(prices.stop, dec!(90));
        assert_eq!(prices.take_profit, dec!(115));
        assert_eq!(prices.reward_risk, dec!(1.5));
        // 90 * 0.995
        assert_eq!(prices.stop_limit, Some(dec!(89.55)));
    }

    #[test]
    fn test_stop_rounds_down_target_rounds_up() {
        let prices = validator().compute(dec!(50.005), dec!(1.333), dec!(2.667)).unwrap();
        assert_eq!(prices.stop, dec!(47.33));
        assert_eq!(prices.take_profit, dec!(54.01));
    }

    #[test]
    fn test_sub_dollar_uses_fine_tick() {
        let prices = validator().compute(dec!(0.5), dec!(0.02), dec!(0.04)).unwrap();
        assert_eq!(prices.stop, dec!(0.46));
        assert_eq!(prices.take_profit, dec!(0.56));
    }

    #[test]
    fn test_low_reward_risk_rejected() {
        // stop floor of 3 dominates a volatility of 1, target only 3 away
        let err = validator().compute(dec!(100), dec!(1), dec!(3)).unwrap_err();
        assert_eq!(err, ReasonCode::RrRatioLow);
    }

    #[test]
    fn test_zero_volatility_falls_back_to_min_reward_risk() {
        let prices = validator().compute(dec!(100), Decimal::ZERO, dec!(3)).unwrap();
        assert_eq!(prices.take_profit, dec!(103.6));
        assert!(prices.reward_risk >= dec!(1.2));
    }

    #[test]
    fn test_validate_bracket_ordering() {
        assert_eq!(
            validate_bracket(dec!(100), dec!(100), dec!(110), dec!(1)),
            Err(ReasonCode::InvalidBracketPrices)
        );
        assert_eq!(
            validate_bracket(dec!(100), dec!(95), dec!(100), dec!(1)),
            Err(ReasonCode::InvalidBracketPrices)
        );
        assert_eq!(validate_bracket(dec!(100), dec!(95), dec!(110), dec!(1)), Ok(dec!(2)));
    }

    #[test]
    fn test_build_plan_requires_whole_shares() {
        let v = validator();
        let prices = v.compute(dec!(100), dec!(5), dec!(10)).unwrap();
        assert_eq!(
            v.build_plan("AAPL", dec!(2.5), prices, day()),
            Err(ReasonCode::InvalidPlanSpend)
        );
        let plan = v.build_plan("AAPL", dec!(5), prices, day()).unwrap();
        assert_eq!(plan.notional(), dec!(500));
        assert_eq!(plan.time_in_force(), "day");
    }

    #[test]
    fn test_client_order_id_is_deterministic() {
        let a = client_order_id("AAPL", day(), dec!(100.00));
        let b = client_order_id("AAPL", day(), dec!(100));
        let c = client_order_id("AAPL", day().succ_opt().unwrap(), dec!(100));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 43);
    }
}
