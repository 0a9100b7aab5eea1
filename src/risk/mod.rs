//! Risk management for new entries and open positions.
//!
//! Provides:
//! - Ordered portfolio and daily limit checks with risk-budget sizing
//! - Per-trading-day counters that survive restarts
//! - Break-even and trailing-stop protection for open positions
//! - The safeguards window gating orders and protection

mod daily_state;
mod manager;
mod protector;
mod safeguards;
mod store;

pub use daily_state::{DailyRiskState, Reservation};
pub use manager::{CandidatePlan, PlanResult, RiskManager, Sizing};
pub use protector::{
    OpenPositionState, PositionProtector, ProtectionAction, ProtectionReport, ProtectionStage,
};
pub use safeguards::SafeguardsWindow;
pub use store::{DailyStateStore, MemoryStateStore, PositionStateStore};
