//! Entry-side decision pipeline.
//!
//! Contains the core logic for:
//! - Gating symbols on price, liquidity and alternative-data signals
//! - Fast-lane detection for strong recent signals
//! - Scoring and ranking candidates
//! - Bracket price validation and idempotent submission

mod executor;
mod fast_lane;
mod gate;
mod order_plan;
mod scanner;
mod scoring;

pub use executor::{with_timeout, OrderExecutor, SubmitOutcome};
pub use fast_lane::FastLaneDetector;
pub use gate::GateEvaluator;
pub use order_plan::{client_order_id, validate_bracket, BracketOrderPlan, BracketPrices, OrderPlanValidator};
pub use scanner::{ScanOutcome, Scanner};
pub use scoring::{rank, Candidate, ScoreBreakdown, ScoringEngine};
