//! Gating: price band, liquidity/volatility and alternative-data minimums.
//!
//! Gates run in a fixed order. The price band is checked on the snapshot
//! alone, before any alternative data is fetched. A fast-lane symbol is held
//! to the relaxed liquidity thresholds and skips the alternative-data gate.

use rust_decimal::Decimal;

use super::fast_lane::FastLaneDetector;
use crate::config::{AltDataConfig, FastLaneConfig, GateConfig, LiquidityThresholds, MissingMarketCapPolicy};
use crate::decision::{AbortReason, GateDecision, GateMode, GateOutcomes, ReasonCode};
use crate::market_data::features::{self, FeatureSet};
use crate::market_data::MarketSnapshot;

pub struct GateEvaluator {
    gate: GateConfig,
    alt: AltDataConfig,
    fast_lane: FastLaneDetector,
}

impl GateEvaluator {
    pub fn new(gate: GateConfig, alt: AltDataConfig, fast_lane: FastLaneConfig) -> Self {
        Self {
            gate,
            alt,
            fast_lane: FastLaneDetector::new(fast_lane),
        }
    }

    /// Cycle-level guard, checked before any symbol.
    pub fn check_cycle(&self, kill_switch_engaged: bool) -> Result<(), AbortReason> {
        if kill_switch_engaged {
            return Err(AbortReason::KillSwitch);
        }
        Ok(())
    }

    pub fn check_price_band(&self, snapshot: &MarketSnapshot) -> Result<(), ReasonCode> {
        if snapshot.price < self.gate.min_price {
            return Err(ReasonCode::PriceBelowMin);
        }
        if self.gate.max_price > Decimal::ZERO && snapshot.price > self.gate.max_price {
            return Err(ReasonCode::PriceAboveMax);
        }
        Ok(())
    }

    /// Whether the snapshot is too old to act on.
    pub fn is_stale(&self, snapshot: &MarketSnapshot) -> bool {
        self.gate.max_snapshot_age_secs > 0 && snapshot.age_secs > self.gate.max_snapshot_age_secs
    }

    /// Decision for a symbol that failed the price band.
    pub fn price_band_rejection(&self, symbol: &str, reason: ReasonCode) -> GateDecision {
        GateDecision {
            symbol: symbol.to_string(),
            mode: GateMode::Strict,
            outcomes: GateOutcomes::default(),
            reasons: vec![reason],
            fast_lane: false,
            fast_lane_triggers: Vec::new(),
        }
    }

    /// Run every gate; all failing gates are recorded, not just the first.
    pub fn evaluate(&self, snapshot: &MarketSnapshot, features: &FeatureSet) -> GateDecision {
        let symbol = snapshot.symbol.as_str();
        if let Err(reason) = self.check_price_band(snapshot) {
            return self.price_band_rejection(symbol, reason);
        }

        let triggers = self.fast_lane.detect(features);
        let fast_lane = !triggers.is_empty();
        let (mode, thresholds) = if fast_lane {
            (GateMode::Relaxed, &self.gate.relaxed)
        } else {
            (GateMode::Strict, &self.gate.strict)
        };

        let mut reasons = self.liquidity_reasons(snapshot, thresholds);
        let liquidity_ok = reasons.is_empty();

        let alt_data = if !self.alt.enabled {
            None
        } else if fast_lane {
            Some(true)
        } else {
            let alt_reasons = self.alt_data_reasons(features);
            let ok = alt_reasons.is_empty();
            reasons.extend(alt_reasons);
            Some(ok)
        };

        GateDecision {
            symbol: symbol.to_string(),
            mode,
            outcomes: GateOutcomes {
                price_band: true,
                liquidity: Some(liquidity_ok),
                alt_data,
            },
            reasons,
            fast_lane,
            fast_lane_triggers: triggers,
        }
    }

    fn liquidity_reasons(
        &self,
        snapshot: &MarketSnapshot,
        thresholds: &LiquidityThresholds,
    ) -> Vec<ReasonCode> {
        let mut reasons = Vec::new();

        if thresholds.min_market_cap > Decimal::ZERO {
            let market_cap = match (snapshot.market_cap, self.gate.missing_market_cap) {
                (Some(cap), _) => Some(cap),
                (None, MissingMarketCapPolicy::Zero) => Some(Decimal::ZERO),
                (None, MissingMarketCapPolicy::Skip) => None,
            };
            if matches!(market_cap, Some(cap) if cap < thresholds.min_market_cap) {
                reasons.push(ReasonCode::MarketCapBelowMin);
            }
        }

        if thresholds.min_avg_volume > Decimal::ZERO && snapshot.avg_volume < thresholds.min_avg_volume {
            reasons.push(ReasonCode::AvgVolumeBelowMin);
        }

        if thresholds.max_volatility_pct > Decimal::ZERO
            && snapshot.volatility_pct() > thresholds.max_volatility_pct
        {
            reasons.push(ReasonCode::VolatilityAboveMax);
        }

        if thresholds.require_positive_trend && snapshot.trend_positive != Some(true) {
            reasons.push(ReasonCode::TrendNotPositive);
        }

        reasons
    }

    fn alt_data_reasons(&self, features: &FeatureSet) -> Vec<ReasonCode> {
        let max_age = self.alt.max_age_days;
        let mut reasons = Vec::new();

        let signal_checks = [
            (features::INSIDER_BUY_COUNT, self.alt.min_insider_buys),
            (features::GOV_CONTRACT_AMOUNT, self.alt.min_contract_amount),
            (features::HOUSE_PURCHASE_COUNT, self.alt.min_house_purchases),
            (features::SOCIAL_MENTIONS, self.alt.min_social_mentions),
        ];
        let mut configured = signal_checks
            .iter()
            .filter(|(_, min)| *min > Decimal::ZERO)
            .peekable();
        if configured.peek().is_some()
            && !configured.any(|(name, min)| features.fresh_value(name, max_age) >= *min)
        {
            reasons.push(ReasonCode::AltDataNoSignal);
        }

        if self.alt.min_active_categories > 0 {
            let active = self
                .alt
                .categories
                .iter()
                .filter(|name| features.fresh_value(name, max_age) > Decimal::ZERO)
                .count();
            if active < self.alt.min_active_categories {
                reasons.push(ReasonCode::AltDataInsufficientCategories);
            }
        }

        reasons
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn evaluator() -> GateEvaluator {
        GateEvaluator::new(
            GateConfig::default(),
            AltDataConfig::default(),
            FastLaneConfig::default(),
        )
    }

    fn snapshot(price: Decimal, market_cap: Option<Decimal>, avg_volume: Decimal, vol_pct: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "TEST".to_string(),
            price,
            avg_volume,
            volatility: price * vol_pct / dec!(100),
            market_cap,
            trend_positive: Some(true),
            age_secs: 0,
        }
    }

    fn modest_signals() -> FeatureSet {
        FeatureSet::new()
            .with(features::INSIDER_BUY_COUNT, dec!(1), Some(2))
            .with(features::HOUSE_PURCHASE_COUNT, dec!(1), Some(5))
    }

    #[test]
    fn test_strict_pass() {
        let snap = snapshot(dec!(600), Some(dec!(2000000000)), dec!(400000), dec!(5));
        let decision = evaluator().evaluate(&snap, &modest_signals());
        assert!(decision.passed(), "{:?}", decision.reasons);
        assert_eq!(decision.mode, GateMode::Strict);
        assert!(!decision.fast_lane);
        assert_eq!(decision.outcomes.liquidity, Some(true));
        assert_eq!(decision.outcomes.alt_data, Some(true));
    }

    #[test]
    fn test_fast_lane_relaxes_thresholds_and_skips_alt_gate() {
        let snap = snapshot(dec!(40), Some(dec!(500000000)), dec!(150000), dec!(6));
        let features = FeatureSet::new().with(features::INSIDER_BUY_COUNT, dec!(3), Some(1));

        let decision = evaluator().evaluate(&snap, &features);
        assert!(decision.passed(), "{:?}", decision.reasons);
        assert_eq!(decision.mode, GateMode::Relaxed);
        assert!(decision.fast_lane);

        // same symbol without the trigger fails the strict floors
        let strict = evaluator().evaluate(&snap, &modest_signals());
        assert!(strict.reasons.contains(&ReasonCode::MarketCapBelowMin));
        assert!(strict.reasons.contains(&ReasonCode::AvgVolumeBelowMin));
    }

    #[test]
    fn test_price_band() {
        let gate = evaluator();
        let cheap = snapshot(dec!(2.5), Some(dec!(5000000000)), dec!(1000000), dec!(2));
        assert_eq!(gate.check_price_band(&cheap), Err(ReasonCode::PriceBelowMin));
        let pricey = snapshot(dec!(1500), Some(dec!(5000000000)), dec!(1000000), dec!(2));
        assert_eq!(gate.check_price_band(&pricey), Err(ReasonCode::PriceAboveMax));

        let decision = gate.evaluate(&cheap, &modest_signals());
        assert_eq!(decision.reasons, vec![ReasonCode::PriceBelowMin]);
        assert_eq!(decision.outcomes.liquidity, None);
    }

    #[test]
    fn test_all_failing_gates_recorded() {
        let snap = snapshot(dec!(20), Some(dec!(100000000)), dec!(50000), dec!(15));
        let decision = evaluator().evaluate(&snap, &FeatureSet::new());
        assert_eq!(
            decision.reasons,
            vec![
                ReasonCode::MarketCapBelowMin,
                ReasonCode::AvgVolumeBelowMin,
                ReasonCode::VolatilityAboveMax,
                ReasonCode::AltDataNoSignal,
                ReasonCode::AltDataInsufficientCategories,
            ]
        );
    }

    #[test]
    fn test_missing_market_cap_policy() {
        let snap = snapshot(dec!(100), None, dec!(1000000), dec!(3));
        let zero = evaluator().evaluate(&snap, &modest_signals());
        assert!(zero.reasons.contains(&ReasonCode::MarketCapBelowMin));

        let skip = GateEvaluator::new(
            GateConfig {
                missing_market_cap: MissingMarketCapPolicy::Skip,
                ..GateConfig::default()
            },
            AltDataConfig::default(),
            FastLaneConfig::default(),
        );
        assert!(skip.evaluate(&snap, &modest_signals()).passed());
    }

    #[test]
    fn test_stale_alt_data_does_not_count() {
        let snap = snapshot(dec!(100), Some(dec!(5000000000)), dec!(1000000), dec!(3));
        let stale = FeatureSet::new()
            .with(features::INSIDER_BUY_COUNT, dec!(1), Some(30))
            .with(features::HOUSE_PURCHASE_COUNT, dec!(1), Some(30));
        let decision = evaluator().evaluate(&snap, &stale);
        assert_eq!(decision.outcomes.alt_data, Some(false));
    }

    #[test]
    fn test_disabled_alt_data_not_evaluated() {
        let gate = GateEvaluator::new(
            GateConfig::default(),
            AltDataConfig {
                enabled: false,
                ..AltDataConfig::default()
            },
            FastLaneConfig::default(),
        );
        let snap = snapshot(dec!(100), Some(dec!(5000000000)), dec!(1000000), dec!(3));
        let decision = gate.evaluate(&snap, &FeatureSet::new());
        assert!(decision.passed());
        assert_eq!(decision.outcomes.alt_data, None);
    }

    #[test]
    fn test_kill_switch_aborts_cycle() {
        assert_eq!(evaluator().check_cycle(true), Err(AbortReason::KillSwitch));
        assert!(evaluator().check_cycle(false).is_ok());
    }
}
