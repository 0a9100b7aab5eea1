//! Capped, weighted feature scoring and candidate ranking.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::config::{AltDataConfig, ScoringConfig};
use crate::market_data::FeatureSet;

/// Total score and the part contributed by alternative-data categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScoreBreakdown {
    pub total: Decimal,
    pub alt_data: Decimal,
}

/// A symbol that passed every gate, ready for risk evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub symbol: String,
    pub score: Decimal,
    /// Tie-breaker: alternative-data share of the score
    pub secondary_strength: Decimal,
    /// Tie-breaker: average dollar volume
    pub liquidity: Decimal,
    pub price: Decimal,
    pub volatility: Decimal,
    pub fast_lane: bool,
}

pub struct ScoringEngine {
    weights: HashMap<String, Decimal>,
    caps: HashMap<String, Decimal>,
    alt_categories: HashSet<String>,
    max_age_days: u32,
}

impl ScoringEngine {
    pub fn new(scoring: &ScoringConfig, alt: &AltDataConfig) -> Self {
        Self {
            weights: scoring.weights.clone(),
            caps: scoring.caps.clone(),
            alt_categories: alt.categories.iter().cloned().collect(),
            max_age_days: alt.max_age_days,
        }
    }

    /// Σ min(value, cap) × weight over weighted features; stale values count as zero.
    pub fn score(&self, features: &FeatureSet) -> ScoreBreakdown {
        let mut breakdown = ScoreBreakdown::default();
        for (name, weight) in &self.weights {
            let value = features.fresh_value(name, self.max_age_days);
            let capped = match self.caps.get(name) {
                Some(cap) => value.min(*cap),
                None => value,
            };
            let contribution = capped * *weight;
            breakdown.total += contribution;
            if self.alt_categories.contains(name) {
                breakdown.alt_data += contribution;
            }
        }
        breakdown
    }
}

/// Order by score, then secondary strength, then liquidity, all descending.
///
/// The sort is stable, so full ties keep scan order.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.secondary_strength.cmp(&a.secondary_strength))
            .then_with(|| b.liquidity.cmp(&a.liquidity))
    });
}
