//! Time-boxed permission for order placement and protection transitions.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::config::SafeguardsConfig;

/// Window anchored at a reset timestamp.
///
/// Without an anchor or a TTL the window is open-ended. A disabled window is
/// never active.
#[derive(Debug)]
pub struct SafeguardsWindow {
    enabled: bool,
    started_at: Option<DateTime<Utc>>,
    ttl: Option<Duration>,
    expiry_logged: AtomicBool,
}

impl SafeguardsWindow {
    pub fn from_config(config: &SafeguardsConfig) -> Self {
        Self {
            enabled: config.enabled,
            started_at: config.started_at,
            ttl: (config.ttl_days > 0).then(|| Duration::days(i64::from(config.ttl_days))),
            expiry_logged: AtomicBool::new(false),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match (self.started_at, self.ttl) {
            (Some(start), Some(ttl)) => Some(start + ttl),
            _ => None,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.expires_at() {
            Some(expiry) if now >= expiry => {
                if !self.expiry_logged.swap(true, Ordering::SeqCst) {
                    warn!(
                        target: "safeguards",
                        expired_at = %expiry,
                        "SAFEGUARDS window expired; orders and protection transitions suppressed"
                    );
                }
                false
            }
            _ => true,
        }
    }
}
