//! Persistence seams for risk and protection state.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::daily_state::DailyRiskState;
use super::protector::OpenPositionState;

/// Where daily risk state lives between restarts.
pub trait DailyStateStore: Send + Sync {
    fn load_daily_state(&self) -> Result<Option<DailyRiskState>>;
    fn save_daily_state(&self, state: &DailyRiskState) -> Result<()>;
}

/// Where per-position protection state lives between restarts.
pub trait PositionStateStore: Send + Sync {
    fn load_position_states(&self) -> Result<Vec<OpenPositionState>>;
    fn save_position_state(&self, state: &OpenPositionState) -> Result<()>;
    fn delete_position_state(&self, symbol: &str) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    daily: Option<DailyRiskState>,
    positions: BTreeMap<String, OpenPositionState>,
}

/// Non-durable store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: DailyRiskState) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                daily: Some(state),
                positions: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("state store lock poisoned"))
    }
}

impl DailyStateStore for MemoryStateStore {
    fn load_daily_state(&self) -> Result<Option<DailyRiskState>> {
        Ok(self.lock()?.daily.clone())
    }

    fn save_daily_state(&self, state: &DailyRiskState) -> Result<()> {
        self.lock()?.daily = Some(state.clone());
        Ok(())
    }
}

impl PositionStateStore for MemoryStateStore {
    fn load_position_states(&self) -> Result<Vec<OpenPositionState>> {
        Ok(self.lock()?.positions.values().cloned().collect())
    }

    fn save_position_state(&self, state: &OpenPositionState) -> Result<()> {
        self.lock()?
            .positions
            .insert(state.symbol.clone(), state.clone());
        Ok(())
    }

    fn delete_position_state(&self, symbol: &str) -> Result<()> {
        self.lock()?.positions.remove(symbol);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStateStore::new();
        assert!(store.load_daily_state().unwrap().is_none());

        let state = DailyRiskState::fresh(NaiveDate::from_ymd_opt(2026, 3, 4).unwrap());
        store.save_daily_state(&state).unwrap();
        assert_eq!(store.load_daily_state().unwrap(), Some(state));

        let position = OpenPositionState::new("AAPL", dec!(5), dec!(100), dec!(95), Utc::now());
        store.save_position_state(&position).unwrap();
        assert_eq!(store.load_position_states().unwrap(), vec![position]);
        store.delete_position_state("AAPL").unwrap();
        assert!(store.load_position_states().unwrap().is_empty());
    }
}
