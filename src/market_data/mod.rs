//! Market snapshots and alternative-data features.
//!
//! The engine reads everything through [`MarketDataProvider`]; the concrete
//! provider is a JSON feed directory wrapped in a caching, retrying layer.

pub mod cache;
pub mod cached;
pub mod features;
pub mod feed;
pub mod provider;
pub mod retry;

pub use cache::{CacheStore, ExpiringCache, FileStore, MemoryStore};
pub use cached::CachedProvider;
pub use features::FeatureSet;
pub use feed::JsonFeedProvider;
pub use provider::{MarketDataProvider, MarketSnapshot, ProviderError};
pub use retry::{EndpointCooldowns, RetryPolicy};

#[cfg(test)]
pub use provider::MockMarketDataProvider;
