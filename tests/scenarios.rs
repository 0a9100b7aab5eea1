//! End-to-end decision scenarios through the public API.

use bracket_trader::broker::{AccountSnapshot, Broker, PaperBroker};
use bracket_trader::config::{AltDataConfig, ExecutionConfig, FastLaneConfig, GateConfig, RiskConfig};
use bracket_trader::decision::{GateMode, ReasonCode};
use bracket_trader::market_data::{features, FeatureSet, MarketSnapshot};
use bracket_trader::persistence::PersistenceManager;
use bracket_trader::risk::{
    DailyRiskState, MemoryStateStore, PositionProtector, ProtectionStage, RiskManager,
};
use bracket_trader::strategy::{Candidate, GateEvaluator, OrderPlanValidator};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
}

fn snapshot(price: Decimal, market_cap: Decimal, avg_volume: Decimal, volatility: Decimal) -> MarketSnapshot {
    MarketSnapshot {
        symbol: "XYZ".to_string(),
        price,
        avg_volume,
        volatility,
        market_cap: Some(market_cap),
        trend_positive: Some(true),
        age_secs: 0,
    }
}

fn gate() -> GateEvaluator {
    GateEvaluator::new(GateConfig::default(), AltDataConfig::default(), FastLaneConfig::default())
}

fn account(equity: Decimal) -> AccountSnapshot {
    AccountSnapshot {
        equity,
        cash: equity,
        buying_power: equity,
        positions: Vec::new(),
        open_orders: Vec::new(),
    }
}

fn candidate(symbol: &str, price: Decimal, volatility: Decimal) -> Candidate {
    Candidate {
        symbol: symbol.to_string(),
        score: dec!(5),
        secondary_strength: dec!(0.5),
        liquidity: dec!(100000000),
        price,
        volatility,
        fast_lane: false,
    }
}

fn risk_manager(config: RiskConfig, state: Option<DailyRiskState>) -> RiskManager {
    let store = match state {
        Some(state) => MemoryStateStore::with_state(state),
        None => MemoryStateStore::new(),
    };
    RiskManager::load(config, &ExecutionConfig::default(), Arc::new(store)).unwrap()
}

#[test]
fn scenario_strict_gate_pass() {
    // $600, $2B cap, 400k volume, volatility 5% of price
    let snap = snapshot(dec!(600), dec!(2000000000), dec!(400000), dec!(30));
    let signals = FeatureSet::new()
        .with(features::INSIDER_BUY_COUNT, dec!(1), Some(1))
        .with(features::HOUSE_PURCHASE_COUNT, dec!(1), Some(3));

    let decision = gate().evaluate(&snap, &signals);
    assert!(decision.passed(), "{:?}", decision.reasons);
    assert_eq!(decision.mode, GateMode::Strict);
    assert!(!decision.fast_lane);

    // Same inputs, same decision
    assert_eq!(gate().evaluate(&snap, &signals), decision);
}

#[test]
fn scenario_fast_lane_relaxes_market_cap_floor() {
    let snap = snapshot(dec!(600), dec!(500000000), dec!(400000), dec!(30));
    let insider = FeatureSet::new().with(features::INSIDER_BUY_COUNT, dec!(3), Some(1));

    let decision = gate().evaluate(&snap, &insider);
    assert!(decision.fast_lane);
    assert_eq!(decision.mode, GateMode::Relaxed);
    assert!(decision.passed(), "{:?}", decision.reasons);
}

#[test]
fn scenario_risk_sizing_capped_by_position_size() {
    let config = RiskConfig {
        max_position_size_usd: dec!(500),
        ..RiskConfig::default()
    };
    let risk = risk_manager(config, None);

    // Volatility 5 x multiplier 2 = $10 stop distance; 1% of $10k risks $100
    let plan = risk
        .evaluate(&candidate("XYZ", dec!(100), dec!(5)), &account(dec!(10000)), day(2))
        .unwrap();
    assert_eq!(plan.sizing.stop_distance, dec!(10));
    assert_eq!(plan.sizing.risk_qty, dec!(10));
    assert_eq!(plan.qty, dec!(5));
    assert_eq!(plan.prices.stop, dec!(90));
    assert!(plan.prices.stop < plan.prices.entry && plan.prices.entry < plan.prices.take_profit);
}

#[test]
fn scenario_cooldown_rejects_recent_symbol() {
    let mut state = DailyRiskState::fresh(day(5));
    state.symbol_last_trade.insert("XYZ".to_string(), day(2));
    let risk = risk_manager(RiskConfig::default(), Some(state));

    let result = risk.evaluate(&candidate("XYZ", dec!(100), dec!(2)), &account(dec!(10000)), day(5));
    assert_eq!(result.unwrap_err(), ReasonCode::SymbolCooldown);
}

#[test]
fn daily_spend_reported_before_cooldown() {
    let mut state = DailyRiskState::fresh(day(5));
    state.symbol_last_trade.insert("XYZ".to_string(), day(2));
    state.spent_today_usd = dec!(3000);
    let risk = risk_manager(RiskConfig::default(), Some(state));

    let result = risk.evaluate(&candidate("XYZ", dec!(100), dec!(2)), &account(dec!(10000)), day(5));
    assert_eq!(result.unwrap_err(), ReasonCode::DailySpendExceeded);
}

#[test]
fn engineered_low_reward_risk_is_rejected() {
    let validator = OrderPlanValidator::new(&ExecutionConfig::default(), &RiskConfig::default());
    // Target 3 x 1 = $3 above entry against a $10 stop
    assert_eq!(
        validator.compute(dec!(100), dec!(1), dec!(10)),
        Err(ReasonCode::RrRatioLow)
    );
}

#[tokio::test]
async fn scenario_break_even_promotion_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    let broker = PaperBroker::new(dec!(10000));
    let execution = ExecutionConfig::default();
    let risk = RiskConfig::default();

    let validator = OrderPlanValidator::new(&execution, &risk);
    let prices = validator.compute(dec!(100), dec!(5), dec!(5)).unwrap();
    assert_eq!(prices.stop, dec!(95));
    let plan = validator.build_plan("XYZ", dec!(10), prices, day(2)).unwrap();
    broker.submit_bracket_order(&plan).await.unwrap();

    {
        let store = Arc::new(PersistenceManager::new(&db).unwrap());
        let mut protector = PositionProtector::load(&execution, &risk, store, Duration::from_secs(1)).unwrap();
        protector.register_entry(&plan);

        // 1.2R gain promotes the stop to entry plus 0.1%
        broker.mark_price("XYZ", dec!(106)).await;
        let report = protector.run(&broker, true, Utc::now()).await.unwrap();
        assert_eq!(report.applied.len(), 1);
        let state = protector.state("XYZ").unwrap();
        assert_eq!(state.stage, ProtectionStage::BreakEven);
        assert_eq!(state.current_stop(), dec!(100.10));
    }

    // Restart, then a dip to 102 never lowers the stop
    let store = Arc::new(PersistenceManager::new(&db).unwrap());
    let mut protector = PositionProtector::load(&execution, &risk, store, Duration::from_secs(1)).unwrap();
    broker.mark_price("XYZ", dec!(102)).await;
    let report = protector.run(&broker, true, Utc::now()).await.unwrap();
    assert!(report.applied.is_empty());

    let state = protector.state("XYZ").unwrap();
    assert_eq!(state.current_stop(), dec!(100.10));
    assert!(state.current_stop() > dec!(95));

    let orders = broker.list_open_orders().await.unwrap();
    let stops: Vec<Decimal> = orders
        .iter()
        .filter(|o| o.is_protective_stop())
        .filter_map(|o| o.stop_price)
        .collect();
    assert_eq!(stops, vec![dec!(100.10)]);
}
