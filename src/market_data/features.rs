//! Named numeric features with per-feature age.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const INSIDER_BUY_COUNT: &str = "insider_buy_count";
pub const GOV_CONTRACT_AMOUNT: &str = "gov_contract_amount";
pub const GOV_CONTRACT_COUNT: &str = "gov_contract_count";
pub const HOUSE_PURCHASE_COUNT: &str = "house_purchase_count";
pub const PATENT_MOMENTUM: &str = "patent_momentum";
pub const SEC13F_CHANGE_PCT: &str = "sec13f_change_pct";
pub const SOCIAL_MENTIONS: &str = "social_mentions";
/// Derived from the snapshot trend flag: 1 when positive, else 0.
pub const TREND_POSITIVE: &str = "trend_positive";

/// Features counted toward the active-category minimum.
pub const ALT_CATEGORIES: &[&str] = &[
    INSIDER_BUY_COUNT,
    GOV_CONTRACT_COUNT,
    HOUSE_PURCHASE_COUNT,
    PATENT_MOMENTUM,
    SEC13F_CHANGE_PCT,
    SOCIAL_MENTIONS,
];

/// One feature observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureValue {
    pub value: Decimal,
    /// Days since the underlying event; `None` when the source carries no date.
    #[serde(default)]
    pub age_days: Option<u32>,
}

/// Mapping from feature name to value, ordered for stable traces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet {
    values: BTreeMap<String, FeatureValue>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Decimal, age_days: Option<u32>) {
        self.values.insert(name.into(), FeatureValue { value, age_days });
    }

    /// Builder form of [`FeatureSet::insert`].
    pub fn with(mut self, name: &str, value: Decimal, age_days: Option<u32>) -> Self {
        self.insert(name, value, age_days);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values.get(name)
    }

    /// Raw value regardless of age; absent features read as zero.
    pub fn value(&self, name: &str) -> Decimal {
        self.values.get(name).map(|f| f.value).unwrap_or(Decimal::ZERO)
    }

    /// Value if observed within `max_age_days`, else zero. Undated values count as fresh.
    pub fn fresh_value(&self, name: &str, max_age_days: u32) -> Decimal {
        match self.values.get(name) {
            Some(f) if f.age_days.map_or(true, |age| age <= max_age_days) => f.value,
            _ => Decimal::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
