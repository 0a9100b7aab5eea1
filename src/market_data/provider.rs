//! Provider trait and snapshot type.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::features::FeatureSet;
use crate::utils::decimal::{safe_div, to_pct};

/// Endpoint names used for retry labels and cooldown bookkeeping.
pub const SNAPSHOT_ENDPOINT: &str = "snapshot";
pub const ALT_FEATURES_ENDPOINT: &str = "alt_features";

/// Price, volume and volatility for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: Decimal,
    /// Average daily share volume
    pub avg_volume: Decimal,
    /// ATR-like volatility in price units
    pub volatility: Decimal,
    /// Market capitalization in USD, when the source knows it
    pub market_cap: Option<Decimal>,
    /// Short-term trend flag, when the source computes one
    pub trend_positive: Option<bool>,
    /// Seconds since the data was observed
    pub age_secs: u64,
}

impl MarketSnapshot {
    /// Volatility as a percent of price.
    pub fn volatility_pct(&self) -> Decimal {
        to_pct(safe_div(self.volatility, self.price))
    }

    /// Average dollar volume, the liquidity tie-breaker.
    pub fn dollar_volume(&self) -> Decimal {
        self.avg_volume * self.price
    }
}

/// Provider failure classes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("rate limited on {endpoint}")]
    RateLimited { endpoint: String },

    #[error("{endpoint} unavailable: {reason}")]
    Unavailable { endpoint: String, reason: String },

    #[error("missing {field} for {symbol}")]
    MissingData { symbol: String, field: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Unavailable { .. } | ProviderError::Timeout(_))
    }

    pub fn missing(symbol: &str, field: &str) -> Self {
        ProviderError::MissingData {
            symbol: symbol.to_string(),
            field: field.to_string(),
        }
    }
}

/// Source of market snapshots and alternative-data features.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ProviderError>;

    async fn fetch_alt_features(&self, symbol: &str) -> Result<FeatureSet, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_derived_metrics() {
        let snap = MarketSnapshot {
            symbol: "NVDA".to_string(),
            price: dec!(600),
            avg_volume: dec!(400000),
            volatility: dec!(30),
            market_cap: Some(dec!(2000000000)),
            trend_positive: Some(true),
            age_secs: 0,
        };
        assert_eq!(snap.volatility_pct(), dec!(5));
        assert_eq!(snap.dollar_volume(), dec!(240000000));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ProviderError::missing("AAPL", "price").is_transient());
        assert!(!ProviderError::RateLimited { endpoint: "snapshot".into() }.is_transient());
    }
}
