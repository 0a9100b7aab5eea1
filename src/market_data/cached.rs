//! Caching, retrying provider wrapper.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::cache::{ExpiringCache, FileStore, MemoryStore};
use super::features::FeatureSet;
use super::provider::{
    MarketDataProvider, MarketSnapshot, ProviderError, ALT_FEATURES_ENDPOINT, SNAPSHOT_ENDPOINT,
};
use super::retry::{EndpointCooldowns, RetryPolicy};
use crate::config::{CacheConfig, ProviderConfig};

/// Wraps a provider with TTL caches, bounded retries and rate-limit cooldowns.
pub struct CachedProvider<P> {
    inner: P,
    snapshots: ExpiringCache<MarketSnapshot>,
    alt_features: ExpiringCache<FeatureSet>,
    retry: RetryPolicy,
    cooldowns: EndpointCooldowns,
}

impl<P: MarketDataProvider> CachedProvider<P> {
    pub fn new(inner: P, cache: &CacheConfig, provider: &ProviderConfig) -> Self {
        let alt_store: Box<dyn super::cache::CacheStore<FeatureSet>> = match &cache.file {
            Some(path) => Box::new(FileStore::open(path)),
            None => Box::new(MemoryStore::new()),
        };
        Self {
            inner,
            snapshots: ExpiringCache::new(
                Box::new(MemoryStore::new()),
                chrono::Duration::seconds(cache.snapshot_ttl_secs as i64),
            ),
            alt_features: ExpiringCache::new(
                alt_store,
                chrono::Duration::seconds(cache.alt_features_ttl_secs as i64),
            ),
            retry: RetryPolicy::from_config(provider),
            cooldowns: EndpointCooldowns::new(chrono::Duration::seconds(
                provider.rate_limit_cooldown_secs as i64,
            )),
        }
    }

    fn check_cooldown(&self, endpoint: &str) -> Result<(), ProviderError> {
        match self.cooldowns.suppressed_until(endpoint, Utc::now()) {
            Some(until) => Err(ProviderError::Unavailable {
                endpoint: endpoint.to_string(),
                reason: format!("suppressed until {}", until),
            }),
            None => Ok(()),
        }
    }

    fn note_failure(&self, endpoint: &str, err: &ProviderError) {
        if matches!(err, ProviderError::RateLimited { .. }) {
            self.cooldowns.suppress(endpoint, Utc::now());
        }
    }
}

#[async_trait]
impl<P: MarketDataProvider> MarketDataProvider for CachedProvider<P> {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ProviderError> {
        if let Some(snap) = self.snapshots.get(symbol, Utc::now()) {
            debug!("Snapshot cache hit for {}", symbol);
            return Ok(snap);
        }
        self.check_cooldown(SNAPSHOT_ENDPOINT)?;

        let result = self
            .retry
            .run(SNAPSHOT_ENDPOINT, move || self.inner.fetch_snapshot(symbol))
            .await;
        match result {
            Ok(snap) => {
                self.snapshots.insert(symbol, snap.clone(), Utc::now());
                Ok(snap)
            }
            Err(e) => {
                self.note_failure(SNAPSHOT_ENDPOINT, &e);
                Err(e)
            }
        }
    }

    async fn fetch_alt_features(&self, symbol: &str) -> Result<FeatureSet, ProviderError> {
        if let Some(features) = self.alt_features.get(symbol, Utc::now()) {
            debug!("Alt-feature cache hit for {}", symbol);
            return Ok(features);
        }
        self.check_cooldown(ALT_FEATURES_ENDPOINT)?;

        let result = self
            .retry
            .run(ALT_FEATURES_ENDPOINT, move || self.inner.fetch_alt_features(symbol))
            .await;
        match result {
            Ok(features) => {
                self.alt_features.insert(symbol, features.clone(), Utc::now());
                Ok(features)
            }
            Err(e) => {
                self.note_failure(ALT_FEATURES_ENDPOINT, &e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::provider::MockMarketDataProvider;
    use rust_decimal_macros::dec;

    fn snapshot(symbol: &str) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            price: dec!(50),
            avg_volume: dec!(500000),
            volatility: dec!(1.5),
            market_cap: Some(dec!(5000000000)),
            trend_positive: Some(true),
            age_secs: 0,
        }
    }

    fn quick_provider_config() -> ProviderConfig {
        ProviderConfig {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..ProviderConfig::default()
        }
    }

    #[tokio::test]
    async fn test_snapshot_served_from_cache() {
        let mut mock = MockMarketDataProvider::new();
        mock.expect_fetch_snapshot()
            .times(1)
            .returning(|s| Ok(snapshot(s)));

        let provider = CachedProvider::new(mock, &CacheConfig::default(), &quick_provider_config());
        provider.fetch_snapshot("AAPL").await.unwrap();
        let second = provider.fetch_snapshot("AAPL").await.unwrap();
        assert_eq!(second.price, dec!(50));
    }

    #[tokio::test]
    async fn test_rate_limit_suppresses_endpoint() {
        let mut mock = MockMarketDataProvider::new();
        mock.expect_fetch_alt_features().times(1).returning(|_| {
            Err(ProviderError::RateLimited {
                endpoint: ALT_FEATURES_ENDPOINT.to_string(),
            })
        });

        let provider = CachedProvider::new(mock, &CacheConfig::default(), &quick_provider_config());
        let first = provider.fetch_alt_features("AAPL").await.unwrap_err();
        assert!(matches!(first, ProviderError::RateLimited { .. }));

        // inner provider is not called again while the cooldown holds
        let second = provider.fetch_alt_features("MSFT").await.unwrap_err();
        assert!(matches!(second, ProviderError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let mut mock = MockMarketDataProvider::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_fetch_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ProviderError::Timeout(std::time::Duration::from_millis(5))));
        mock.expect_fetch_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|s| Ok(snapshot(s)));

        let provider = CachedProvider::new(mock, &CacheConfig::default(), &quick_provider_config());
        assert!(provider.fetch_snapshot("AAPL").await.is_ok());
    }
}
