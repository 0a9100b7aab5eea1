//! Bounded retry with exponential backoff, and per-endpoint cooldowns.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use super::provider::ProviderError;
use crate::config::ProviderConfig;

/// Retry schedule for provider calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.backoff_multiplier.max(1),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay after the `attempt`-th failure (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only transient failures are retried; rate limits return at once so the
    /// caller can put the endpoint on cooldown.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        label, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Endpoints suppressed after a rate-limit response.
pub struct EndpointCooldowns {
    cooldown: chrono::Duration,
    until: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl EndpointCooldowns {
    pub fn new(cooldown: chrono::Duration) -> Self {
        Self {
            cooldown,
            until: Mutex::new(HashMap::new()),
        }
    }

    pub fn suppress(&self, endpoint: &str, now: DateTime<Utc>) {
        let until = now + self.cooldown;
        warn!("Endpoint {} rate limited; suppressed until {}", endpoint, until);
        self.until
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(endpoint.to_string(), until);
    }

    /// End of the cooldown if `endpoint` is still suppressed at `now`.
    pub fn suppressed_until(&self, endpoint: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut until = self.until.lock().unwrap_or_else(|p| p.into_inner());
        match until.get(endpoint) {
            Some(t) if now < *t => Some(*t),
            Some(_) => {
                until.remove(endpoint);
                None
            }
            None => None,
        }
    }
}
