//! Directory of per-symbol JSON documents.
//!
//! Each `<dir>/<SYMBOL>.json` holds:
//!
//! ```json
//! {
//!   "snapshot": {
//!     "price": "600", "avg_volume": "400000", "volatility": "30",
//!     "market_cap": "2000000000", "trend_positive": true,
//!     "as_of": "2026-03-02T14:30:00Z"
//!   },
//!   "alt_features": { "insider_buy_count": { "value": "3", "age_days": 1 } }
//! }
//! ```
//!
//! An external collector refreshes the files; this provider only reads them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use super::features::FeatureSet;
use super::provider::{
    MarketDataProvider, MarketSnapshot, ProviderError, ALT_FEATURES_ENDPOINT, SNAPSHOT_ENDPOINT,
};

#[derive(Debug, Deserialize)]
struct FeedDocument {
    #[serde(default)]
    snapshot: Option<RawSnapshot>,
    #[serde(default)]
    alt_features: Option<FeatureSet>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    price: Option<Decimal>,
    avg_volume: Option<Decimal>,
    volatility: Option<Decimal>,
    #[serde(default)]
    market_cap: Option<Decimal>,
    #[serde(default)]
    trend_positive: Option<bool>,
    #[serde(default)]
    as_of: Option<DateTime<Utc>>,
}

/// Reads snapshots and features from a feed directory.
pub struct JsonFeedProvider {
    dir: PathBuf,
}

impl JsonFeedProvider {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.json", symbol.to_uppercase()))
    }

    async fn read_document(&self, symbol: &str, endpoint: &str) -> Result<FeedDocument, ProviderError> {
        let path = self.path_for(symbol);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::missing(symbol, "feed_document"));
            }
            Err(e) => {
                return Err(ProviderError::Unavailable {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        serde_json::from_str(&text).map_err(|e| {
            debug!("Malformed feed document {}: {}", path.display(), e);
            ProviderError::missing(symbol, "feed_document")
        })
    }
}

#[async_trait]
impl MarketDataProvider for JsonFeedProvider {
    #[instrument(skip(self))]
    async fn fetch_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ProviderError> {
        let doc = self.read_document(symbol, SNAPSHOT_ENDPOINT).await?;
        let raw = doc
            .snapshot
            .ok_or_else(|| ProviderError::missing(symbol, "snapshot"))?;

        let price = raw
            .price
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| ProviderError::missing(symbol, "price"))?;
        let avg_volume = raw
            .avg_volume
            .ok_or_else(|| ProviderError::missing(symbol, "avg_volume"))?;
        let volatility = raw
            .volatility
            .ok_or_else(|| ProviderError::missing(symbol, "volatility"))?;

        let age_secs = raw
            .as_of
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0);

        Ok(MarketSnapshot {
            symbol: symbol.to_uppercase(),
            price,
            avg_volume,
            volatility,
            market_cap: raw.market_cap,
            trend_positive: raw.trend_positive,
            age_secs,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_alt_features(&self, symbol: &str) -> Result<FeatureSet, ProviderError> {
        let doc = self.read_document(symbol, ALT_FEATURES_ENDPOINT).await?;
        Ok(doc.alt_features.unwrap_or_default())
    }
}
