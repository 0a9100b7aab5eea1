//! Strong recent signals that earn relaxed gating.

use rust_decimal::Decimal;

use crate::config::FastLaneConfig;
use crate::decision::FastLaneTrigger;
use crate::market_data::features::{self, FeatureSet};

/// Detects fast-lane triggers within the lookback window.
#[derive(Debug, Clone)]
pub struct FastLaneDetector {
    config: FastLaneConfig,
}

impl FastLaneDetector {
    pub fn new(config: FastLaneConfig) -> Self {
        Self { config }
    }

    /// Triggers that fired; empty when disabled or nothing is strong enough.
    pub fn detect(&self, features: &FeatureSet) -> Vec<FastLaneTrigger> {
        if !self.config.enabled {
            return Vec::new();
        }
        let lookback = self.config.lookback_days;
        let checks = [
            (
                FastLaneTrigger::InsiderBuys,
                features::INSIDER_BUY_COUNT,
                self.config.insider_buy_min,
            ),
            (
                FastLaneTrigger::ContractAmount,
                features::GOV_CONTRACT_AMOUNT,
                self.config.contract_amount_min,
            ),
            (
                FastLaneTrigger::Momentum,
                features::PATENT_MOMENTUM,
                self.config.momentum_min,
            ),
        ];

        checks
            .into_iter()
            .filter(|(_, _, min)| *min > Decimal::ZERO)
            .filter(|(_, name, min)| features.fresh_value(name, lookback) >= *min)
            .map(|(trigger, _, _)| trigger)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_insider_buys_trigger() {
        let detector = FastLaneDetector::new(FastLaneConfig::default());
        let features = FeatureSet::new().with(features::INSIDER_BUY_COUNT, dec!(3), Some(1));
        assert_eq!(detector.detect(&features), vec![FastLaneTrigger::InsiderBuys]);
    }

    #[test]
    fn test_old_signal_outside_lookback() {
        let detector = FastLaneDetector::new(FastLaneConfig::default());
        let features = FeatureSet::new().with(features::INSIDER_BUY_COUNT, dec!(5), Some(4));
        assert!(detector.detect(&features).is_empty());
    }

    #[test]
    fn test_zero_threshold_disables_trigger() {
        // momentum_min defaults to 0, so any momentum is ignored
        let detector = FastLaneDetector::new(FastLaneConfig::default());
        let features = FeatureSet::new().with(features::PATENT_MOMENTUM, dec!(100), Some(0));
        assert!(detector.detect(&features).is_empty());
    }

    #[test]
    fn test_disabled_detector() {
        let config = FastLaneConfig {
            enabled: false,
            ..FastLaneConfig::default()
        };
        let features = FeatureSet::new().with(features::GOV_CONTRACT_AMOUNT, dec!(50000000), Some(0));
        assert!(FastLaneDetector::new(config).detect(&features).is_empty());
    }
}
