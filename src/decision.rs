//! Reason codes and per-symbol decision records.
//!
//! Every rejection at every pipeline stage carries a [`ReasonCode`]; every
//! symbol scanned in a cycle yields exactly one [`DecisionRecord`], which is
//! emitted as a structured log line and persisted for audit.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Machine-readable rejection/suppression reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    // Cycle level
    KillSwitch,
    UniverseMappingFailure,
    CycleCancelled,

    // Data
    MissingData,
    StaleSnapshot,
    ProviderUnavailable,

    // Gates
    PriceBelowMin,
    PriceAboveMax,
    MarketCapBelowMin,
    AvgVolumeBelowMin,
    VolatilityAboveMax,
    TrendNotPositive,
    AltDataNoSignal,
    AltDataInsufficientCategories,

    // Risk, in check order
    DailySpendExceeded,
    DailyPositionsExceeded,
    MaxOpenPositions,
    InvalidEquity,
    CashBuffer,
    MaxExposure,
    SymbolExposure,
    PositionOpen,
    OrderPending,
    SymbolTradedToday,
    SymbolCooldown,

    // Sizing
    InvalidPrice,
    InvalidStopDistance,
    InvalidPlanSpend,
    SizeBelowMin,

    // Bracket validation
    InvalidBracketPrices,
    RrRatioLow,

    // Submission
    BrokerRejected,
    BrokerUnavailable,

    // Deliberate suppression, not rejection
    SafeguardsInactive,
    DryRun,
}

impl ReasonCode {
    /// Wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::KillSwitch => "kill_switch",
            ReasonCode::UniverseMappingFailure => "universe_mapping_failure",
            ReasonCode::CycleCancelled => "cycle_cancelled",
            ReasonCode::MissingData => "missing_data",
            ReasonCode::StaleSnapshot => "stale_snapshot",
            ReasonCode::ProviderUnavailable => "provider_unavailable",
            ReasonCode::PriceBelowMin => "price_below_min",
            ReasonCode::PriceAboveMax => "price_above_max",
            ReasonCode::MarketCapBelowMin => "market_cap_below_min",
            ReasonCode::AvgVolumeBelowMin => "avg_volume_below_min",
            ReasonCode::VolatilityAboveMax => "volatility_above_max",
            ReasonCode::TrendNotPositive => "trend_not_positive",
            ReasonCode::AltDataNoSignal => "alt_data_no_signal",
            ReasonCode::AltDataInsufficientCategories => "alt_data_insufficient_categories",
            ReasonCode::DailySpendExceeded => "daily_spend_exceeded",
            ReasonCode::DailyPositionsExceeded => "daily_positions_exceeded",
            ReasonCode::MaxOpenPositions => "max_open_positions",
            ReasonCode::InvalidEquity => "invalid_equity",
            ReasonCode::CashBuffer => "cash_buffer",
            ReasonCode::MaxExposure => "max_exposure",
            ReasonCode::SymbolExposure => "symbol_exposure",
            ReasonCode::PositionOpen => "position_open",
            ReasonCode::OrderPending => "order_pending",
            ReasonCode::SymbolTradedToday => "symbol_traded_today",
            ReasonCode::SymbolCooldown => "symbol_cooldown",
            ReasonCode::InvalidPrice => "invalid_price",
            ReasonCode::InvalidStopDistance => "invalid_stop_distance",
            ReasonCode::InvalidPlanSpend => "invalid_plan_spend",
            ReasonCode::SizeBelowMin => "size_below_min",
            ReasonCode::InvalidBracketPrices => "invalid_bracket_prices",
            ReasonCode::RrRatioLow => "rr_ratio_low",
            ReasonCode::BrokerRejected => "broker_rejected",
            ReasonCode::BrokerUnavailable => "broker_unavailable",
            ReasonCode::SafeguardsInactive => "safeguards_inactive",
            ReasonCode::DryRun => "dry_run",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a whole scan cycle stopped before trading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AbortReason {
    KillSwitch,
    UniverseMappingFailure { failed: usize, scanned: usize },
}

impl AbortReason {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            AbortReason::KillSwitch => ReasonCode::KillSwitch,
            AbortReason::UniverseMappingFailure { .. } => ReasonCode::UniverseMappingFailure,
        }
    }
}

/// Which liquidity thresholds applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    Strict,
    Relaxed,
}

/// A fast-lane trigger that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FastLaneTrigger {
    InsiderBuys,
    ContractAmount,
    Momentum,
}

/// Per-gate outcomes; `None` means the gate was not evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcomes {
    pub price_band: bool,
    pub liquidity: Option<bool>,
    pub alt_data: Option<bool>,
}

/// Result of gate evaluation for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub symbol: String,
    pub mode: GateMode,
    pub outcomes: GateOutcomes,
    pub reasons: Vec<ReasonCode>,
    pub fast_lane: bool,
    pub fast_lane_triggers: Vec<FastLaneTrigger>,
}

impl GateDecision {
    pub fn passed(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// Final outcome for a symbol in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Bracket order accepted by the broker
    Accepted,
    /// Rejected at some stage; see reasons
    Rejected,
    /// Approved but deliberately held back (safeguards window, dry run)
    Suppressed,
    /// Not reached this cycle (cancellation, abort)
    Skipped,
}

/// Structured per-symbol trace for the audit collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub cycle_id: u64,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub gate: Option<GateDecision>,
    pub partial_data: bool,
    pub score: Option<Decimal>,
    pub rank: Option<usize>,
    pub verdict: Verdict,
    pub reasons: Vec<ReasonCode>,
    pub order_id: Option<String>,
}

impl DecisionRecord {
    pub fn new(cycle_id: u64, symbol: &str) -> Self {
        Self {
            cycle_id,
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            gate: None,
            partial_data: false,
            score: None,
            rank: None,
            verdict: Verdict::Skipped,
            reasons: Vec::new(),
            order_id: None,
        }
    }

    pub fn reject(&mut self, reason: ReasonCode) {
        self.verdict = Verdict::Rejected;
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }

    pub fn suppress(&mut self, reason: ReasonCode) {
        self.verdict = Verdict::Suppressed;
        self.reasons.push(reason);
    }

    pub fn skip(&mut self, reason: ReasonCode) {
        self.verdict = Verdict::Skipped;
        self.reasons.push(reason);
    }

    pub fn accept(&mut self, order_id: String) {
        self.verdict = Verdict::Accepted;
        self.order_id = Some(order_id);
    }

    /// Emit as structured log for audit parsing.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        info!(target: "decision", "DECISION: {}", json);
    }
}
