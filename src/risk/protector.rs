//! Stop management for open long positions.
//!
//! Each position moves through `Initial -> BreakEven -> Trailing`. The stop
//! only ever moves up: every candidate stop passes through
//! [`OpenPositionState::raise_stop`], which ignores anything that is not
//! strictly higher than the current one. A pass is safe to repeat every tick;
//! broker orders are re-read first and nothing is submitted twice.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::store::PositionStateStore;
use crate::broker::{Broker, BrokerPosition, OpenOrder, OrderSide};
use crate::config::{ExecutionConfig, RiskConfig};
use crate::strategy::{with_timeout, BracketOrderPlan};
use crate::utils::decimal::{equity_tick, round_to_tick, safe_div, TickRounding};

/// Transitions evaluated per position per pass.
const MAX_TRANSITIONS_PER_PASS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionStage {
    Initial,
    BreakEven,
    Trailing,
}

/// Protection bookkeeping for one open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPositionState {
    pub symbol: String,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub initial_stop: Decimal,
    current_stop: Decimal,
    pub stage: ProtectionStage,
    pub trailing_active: bool,
    pub stop_order_id: Option<String>,
    pub trailing_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OpenPositionState {
    pub fn new(symbol: &str, qty: Decimal, entry_price: Decimal, initial_stop: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty,
            entry_price,
            initial_stop,
            current_stop: initial_stop,
            stage: ProtectionStage::Initial,
            trailing_active: false,
            stop_order_id: None,
            trailing_order_id: None,
            opened_at: now,
            updated_at: now,
        }
    }

    pub fn current_stop(&self) -> Decimal {
        self.current_stop
    }

    /// Initial risk per share (1R).
    pub fn r_distance(&self) -> Decimal {
        self.entry_price - self.initial_stop
    }

    /// Unrealized gain in R at `last_price`.
    pub fn r_multiple(&self, last_price: Decimal) -> Decimal {
        safe_div(last_price - self.entry_price, self.r_distance())
    }

    /// Move the stop to `candidate` if strictly higher. Returns whether it moved.
    pub fn raise_stop(&mut self, candidate: Decimal) -> bool {
        if candidate > self.current_stop {
            self.current_stop = candidate;
            true
        } else {
            false
        }
    }

    fn is_protected(&self) -> bool {
        self.stop_order_id.is_some() || self.trailing_order_id.is_some()
    }
}

/// One step the protector wants to take for a position.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtectionAction {
    /// No stop and no trailing order: place a stop at the current level
    PlaceStop { stop: Decimal, limit: Option<Decimal> },
    /// Trailing stage lost its trailing order
    ResubmitTrailing { trail_pct: Decimal },
    /// A fixed stop left behind after switching to trailing
    CancelStaleStop { order_id: String },
    PromoteBreakEven { stop: Decimal, limit: Option<Decimal> },
    StartTrailing { trail_pct: Decimal },
}

impl ProtectionAction {
    pub fn name(&self) -> &'static str {
        match self {
            ProtectionAction::PlaceStop { .. } => "missing_protection",
            ProtectionAction::ResubmitTrailing { .. } => "missing_trailing",
            ProtectionAction::CancelStaleStop { .. } => "cancel_stale_stop",
            ProtectionAction::PromoteBreakEven { .. } => "break_even",
            ProtectionAction::StartTrailing { .. } => "activate_trailing",
        }
    }
}

/// Summary of one protection pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProtectionReport {
    pub positions: usize,
    /// (symbol, action name)
    pub applied: Vec<(String, String)>,
    pub suppressed: Vec<(String, String)>,
    pub skipped_pending: Vec<String>,
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct ProtectionSettings {
    break_even_r: Decimal,
    break_even_buffer_pct: Decimal,
    trailing_enabled: bool,
    trailing_trigger_r: Decimal,
    trailing_pct: Decimal,
    slippage_buffer_pct: Decimal,
    min_stop_pct: Decimal,
    tick_ge_1: Decimal,
    tick_lt_1: Decimal,
}

pub struct PositionProtector {
    settings: ProtectionSettings,
    states: BTreeMap<String, OpenPositionState>,
    /// Initial stops of submitted brackets not yet seen as positions
    expected_stops: HashMap<String, Decimal>,
    store: Arc<dyn PositionStateStore>,
    broker_timeout: Duration,
}

impl PositionProtector {
    /// Build a protector, resuming any persisted position states.
    pub fn load(
        execution: &ExecutionConfig,
        risk: &RiskConfig,
        store: Arc<dyn PositionStateStore>,
        broker_timeout: Duration,
    ) -> Result<Self> {
        let states: BTreeMap<String, OpenPositionState> = store
            .load_position_states()
            .context("Failed to load position states")?
            .into_iter()
            .map(|s| (s.symbol.clone(), s))
            .collect();
        if !states.is_empty() {
            info!(positions = states.len(), "Resumed position protection state");
        }

        Ok(Self {
            settings: ProtectionSettings {
                break_even_r: execution.break_even_r,
                break_even_buffer_pct: execution.break_even_buffer_pct,
                trailing_enabled: execution.trailing_enabled,
                trailing_trigger_r: execution.trailing_trigger_r,
                trailing_pct: execution.trailing_pct,
                slippage_buffer_pct: execution.slippage_buffer_pct,
                min_stop_pct: risk.min_stop_pct,
                tick_ge_1: risk.tick_ge_1,
                tick_lt_1: risk.tick_lt_1,
            },
            states,
            expected_stops: HashMap::new(),
            store,
            broker_timeout,
        })
    }

    pub fn states(&self) -> &BTreeMap<String, OpenPositionState> {
        &self.states
    }

    pub fn state(&self, symbol: &str) -> Option<&OpenPositionState> {
        self.states.get(symbol)
    }

    /// Remember the bracket's stop so the fill is tracked against it.
    pub fn register_entry(&mut self, plan: &BracketOrderPlan) {
        self.expected_stops
            .insert(plan.symbol().to_string(), plan.stop_price());
    }

    /// Drop the remembered stop of an entry the broker never took.
    pub fn forget_entry(&mut self, symbol: &str) {
        self.expected_stops.remove(symbol);
    }

    fn round(&self, price: Decimal, mode: TickRounding) -> Decimal {
        round_to_tick(
            price,
            equity_tick(price, self.settings.tick_ge_1, self.settings.tick_lt_1),
            mode,
        )
    }

    fn stop_limit(&self, stop: Decimal) -> Option<Decimal> {
        if self.settings.slippage_buffer_pct <= Decimal::ZERO {
            return None;
        }
        let limit = self.round(stop * (Decimal::ONE - self.settings.slippage_buffer_pct), TickRounding::Down);
        (limit > Decimal::ZERO && limit < stop).then_some(limit)
    }

    fn fallback_stop(&self, entry: Decimal) -> Decimal {
        self.round(entry * (Decimal::ONE - self.settings.min_stop_pct), TickRounding::Down)
    }

    fn persist(&self, state: &OpenPositionState) -> Result<()> {
        self.store
            .save_position_state(state)
            .with_context(|| format!("Failed to persist protection state for {}", state.symbol))
    }

    /// Rebuild a state for a position seen for the first time.
    fn reconstruct(
        &mut self,
        position: &BrokerPosition,
        stop: Option<&OpenOrder>,
        trailing: Option<&OpenOrder>,
        now: DateTime<Utc>,
    ) -> OpenPositionState {
        let entry = position.avg_entry_price;
        let broker_stop = stop.and_then(|o| o.stop_price);
        let initial_stop = match self.expected_stops.remove(&position.symbol) {
            Some(expected) if expected < entry => expected,
            _ => match broker_stop {
                Some(s) if s < entry => s,
                _ => self.fallback_stop(entry),
            },
        };

        let mut state = OpenPositionState::new(&position.symbol, position.qty, entry, initial_stop, now);
        if let Some(s) = broker_stop {
            state.raise_stop(s);
            if s >= entry {
                state.stage = ProtectionStage::BreakEven;
            }
        }
        if trailing.is_some() {
            state.stage = ProtectionStage::Trailing;
            state.trailing_active = true;
        }
        info!(
            symbol = %state.symbol,
            entry = %entry,
            initial_stop = %state.initial_stop,
            current_stop = %state.current_stop,
            stage = ?state.stage,
            "Tracking new position"
        );
        state
    }

    /// Align tracked states with broker positions and protective orders.
    pub fn sync(&mut self, positions: &[BrokerPosition], orders: &[OpenOrder], now: DateTime<Utc>) -> Result<()> {
        let open: Vec<&BrokerPosition> = positions.iter().filter(|p| p.qty > Decimal::ZERO).collect();

        let closed: Vec<String> = self
            .states
            .keys()
            .filter(|symbol| !open.iter().any(|p| &p.symbol == *symbol))
            .cloned()
            .collect();
        for symbol in closed {
            self.states.remove(&symbol);
            self.store
                .delete_position_state(&symbol)
                .with_context(|| format!("Failed to delete protection state for {}", symbol))?;
            info!(%symbol, "Position closed; protection state dropped");
        }

        for position in open {
            let symbol = position.symbol.as_str();
            let sells = orders.iter().filter(|o| o.symbol == symbol && o.side == OrderSide::Sell);
            // Highest stop wins when several are working
            let stop = sells
                .clone()
                .filter(|o| o.is_protective_stop())
                .max_by_key(|o| o.stop_price.unwrap_or(Decimal::ZERO));
            let trailing = sells.clone().find(|o| o.is_trailing_stop());

            let (mut state, is_new) = match self.states.remove(symbol) {
                Some(existing) => (existing, false),
                None => (self.reconstruct(position, stop, trailing, now), true),
            };
            let before = state.clone();

            state.qty = position.qty;
            state.stop_order_id = stop.map(|o| o.id.clone());
            state.trailing_order_id = trailing.map(|o| o.id.clone());
            if let Some(broker_stop) = stop.and_then(|o| o.stop_price) {
                state.raise_stop(broker_stop);
            }
            if trailing.is_some() {
                state.stage = ProtectionStage::Trailing;
                state.trailing_active = true;
            } else {
                state.trailing_active = false;
            }

            if is_new || state != before {
                state.updated_at = now;
                self.persist(&state)?;
            }
            self.states.insert(symbol.to_string(), state);
        }
        Ok(())
    }

    /// Next step for `state` at `last_price`; pure.
    pub fn evaluate(&self, state: &OpenPositionState, last_price: Decimal) -> Option<ProtectionAction> {
        if state.trailing_order_id.is_some() {
            return state
                .stop_order_id
                .as_ref()
                .map(|id| ProtectionAction::CancelStaleStop { order_id: id.clone() });
        }

        if state.stage == ProtectionStage::Trailing {
            if state.is_protected() {
                return None;
            }
            return Some(ProtectionAction::ResubmitTrailing {
                trail_pct: self.settings.trailing_pct,
            });
        }

        if state.stop_order_id.is_none() {
            return Some(ProtectionAction::PlaceStop {
                stop: state.current_stop,
                limit: self.stop_limit(state.current_stop),
            });
        }

        let r = state.r_distance();
        if r <= Decimal::ZERO || last_price <= Decimal::ZERO {
            return None;
        }

        if state.stage == ProtectionStage::Initial && state.r_multiple(last_price) >= self.settings.break_even_r {
            let stop = self.round(
                state.entry_price * (Decimal::ONE + self.settings.break_even_buffer_pct),
                TickRounding::Up,
            );
            if stop >= last_price {
                debug!(symbol = %state.symbol, %stop, last = %last_price, "Break-even stop at or above last price; waiting");
                return None;
            }
            return Some(ProtectionAction::PromoteBreakEven {
                stop,
                limit: self.stop_limit(stop),
            });
        }

        if self.settings.trailing_enabled
            && state.stage == ProtectionStage::BreakEven
            && last_price >= state.entry_price + self.settings.trailing_trigger_r * r
        {
            return Some(ProtectionAction::StartTrailing {
                trail_pct: self.settings.trailing_pct,
            });
        }

        None
    }

    /// Carry out `action` against the broker, updating and persisting the state.
    async fn execute(
        &self,
        broker: &dyn Broker,
        state: &mut OpenPositionState,
        action: &ProtectionAction,
        last_price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let symbol = state.symbol.clone();
        match action {
            ProtectionAction::PlaceStop { stop, limit } => {
                warn!(%symbol, stop = %stop, "RISK_PROTECT missing_protection; placing stop");
                let ack = with_timeout(
                    self.broker_timeout,
                    broker.submit_stop_order(&symbol, state.qty, *stop, *limit),
                )
                .await?;
                state.stop_order_id = Some(ack.order_id);
            }
            ProtectionAction::ResubmitTrailing { trail_pct } => {
                warn!(%symbol, trail_pct = %trail_pct, "RISK_PROTECT missing_protection; resubmitting trailing stop");
                let ack = with_timeout(
                    self.broker_timeout,
                    broker.submit_trailing_stop(&symbol, state.qty, *trail_pct),
                )
                .await?;
                state.trailing_order_id = Some(ack.order_id);
                state.trailing_active = true;
            }
            ProtectionAction::CancelStaleStop { order_id } => {
                with_timeout(self.broker_timeout, broker.cancel_order(order_id)).await?;
                info!(%symbol, %order_id, "Stale fixed stop canceled");
                state.stop_order_id = None;
            }
            ProtectionAction::PromoteBreakEven { stop, limit } => {
                let old_stop = state.current_stop;
                if *stop <= old_stop {
                    state.stage = ProtectionStage::BreakEven;
                    debug!(%symbol, current = %old_stop, candidate = %stop, "Stop already at or above break-even");
                } else {
                    // Both exits must not be live at once
                    if let Some(id) = state.stop_order_id.clone() {
                        with_timeout(self.broker_timeout, broker.cancel_order(&id)).await?;
                        state.stop_order_id = None;
                    }
                    state.raise_stop(*stop);
                    state.stage = ProtectionStage::BreakEven;
                    state.updated_at = now;
                    self.persist(state)?;
                    info!(
                        %symbol,
                        old_stop = %old_stop,
                        new_stop = %stop,
                        last = %last_price,
                        entry = %state.entry_price,
                        r = %state.r_distance(),
                        "RISK_PROTECT move_stop_to_breakeven"
                    );
                    let ack = with_timeout(
                        self.broker_timeout,
                        broker.submit_stop_order(&symbol, state.qty, *stop, *limit),
                    )
                    .await?;
                    state.stop_order_id = Some(ack.order_id);
                }
            }
            ProtectionAction::StartTrailing { trail_pct } => {
                let ack = with_timeout(
                    self.broker_timeout,
                    broker.submit_trailing_stop(&symbol, state.qty, *trail_pct),
                )
                .await?;
                state.trailing_order_id = Some(ack.order_id);
                state.trailing_active = true;
                state.stage = ProtectionStage::Trailing;
                state.updated_at = now;
                self.persist(state)?;
                info!(
                    %symbol,
                    trail_pct = %trail_pct,
                    last = %last_price,
                    entry = %state.entry_price,
                    "RISK_PROTECT activate_trailing"
                );
                if let Some(id) = state.stop_order_id.clone() {
                    match with_timeout(self.broker_timeout, broker.cancel_order(&id)).await {
                        Ok(()) => state.stop_order_id = None,
                        // retried next pass as a stale stop
                        Err(e) => warn!(%symbol, order_id = %id, error = %e, "Failed to cancel fixed stop after trailing"),
                    }
                }
            }
        }
        state.updated_at = now;
        self.persist(state)
    }

    /// One protection pass over every open position.
    ///
    /// With safeguards inactive nothing is submitted or canceled; the
    /// intended actions are logged and reported as suppressed.
    pub async fn run(
        &mut self,
        broker: &dyn Broker,
        safeguards_active: bool,
        now: DateTime<Utc>,
    ) -> Result<ProtectionReport> {
        let positions = with_timeout(self.broker_timeout, broker.list_positions())
            .await
            .context("Failed to list positions")?;
        let orders = with_timeout(self.broker_timeout, broker.list_open_orders())
            .await
            .context("Failed to list open orders")?;
        self.sync(&positions, &orders, now)?;

        let mut report = ProtectionReport {
            positions: self.states.len(),
            ..ProtectionReport::default()
        };

        for position in positions.iter().filter(|p| p.qty > Decimal::ZERO) {
            let symbol = position.symbol.as_str();
            if orders.iter().any(|o| o.symbol == symbol && o.is_entry()) {
                debug!(%symbol, "Entry order still working; skipping protection");
                report.skipped_pending.push(symbol.to_string());
                continue;
            }
            let Some(mut state) = self.states.get(symbol).cloned() else {
                continue;
            };
            let last_price = position.current_price;

            for _ in 0..MAX_TRANSITIONS_PER_PASS {
                let Some(action) = self.evaluate(&state, last_price) else {
                    break;
                };
                if !safeguards_active {
                    warn!(
                        target: "safeguards",
                        %symbol,
                        action = action.name(),
                        "SAFEGUARDS inactive; protection action suppressed"
                    );
                    report.suppressed.push((symbol.to_string(), action.name().to_string()));
                    break;
                }
                match self.execute(broker, &mut state, &action, last_price, now).await {
                    Ok(()) => report.applied.push((symbol.to_string(), action.name().to_string())),
                    Err(e) => {
                        error!(%symbol, action = action.name(), error = %e, "Protection action failed");
                        report.errors.push((symbol.to_string(), e.to_string()));
                        break;
                    }
                }
            }
            self.states.insert(symbol.to_string(), state);
        }

        if !report.applied.is_empty() || !report.errors.is_empty() {
            info!(
                positions = report.positions,
                applied = report.applied.len(),
                errors = report.errors.len(),
                "Protection pass complete"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{OrderKind, PaperBroker};
    use crate::risk::MemoryStateStore;
    use crate::strategy::OrderPlanValidator;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn protector(store: Arc<MemoryStateStore>) -> PositionProtector {
        PositionProtector::load(
            &ExecutionConfig::default(),
            &RiskConfig::default(),
            store,
            Duration::from_secs(1),
        )
        .unwrap()
    }

    /// Bracket at entry 100 with the stop at 95.
    async fn open_bracket(broker: &PaperBroker, protector: &mut PositionProtector) {
        let validator = OrderPlanValidator::new(&ExecutionConfig::default(), &RiskConfig::default());
        let prices = validator.compute(dec!(100), dec!(5), dec!(5)).unwrap();
        let plan = validator
            .build_plan("AAPL", dec!(10), prices, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap())
            .unwrap();
        broker.submit_bracket_order(&plan).await.unwrap();
        protector.register_entry(&plan);
    }

    fn stops(orders: &[OpenOrder]) -> Vec<Decimal> {
        orders
            .iter()
            .filter(|o| o.is_protective_stop())
            .filter_map(|o| o.stop_price)
            .collect()
    }

    #[tokio::test]
    async fn test_break_even_promotion_never_moves_down() {
        let broker = PaperBroker::new(dec!(10000));
        let mut protector = protector(Arc::new(MemoryStateStore::new()));
        open_bracket(&broker, &mut protector).await;

        let report = protector.run(&broker, true, Utc::now()).await.unwrap();
        assert!(report.applied.is_empty());
        let state = protector.state("AAPL").unwrap();
        assert_eq!(state.initial_stop, dec!(95));
        assert_eq!(state.current_stop(), dec!(95));
        assert_eq!(state.stage, ProtectionStage::Initial);

        // 1.2R
        broker.mark_price("AAPL", dec!(106)).await;
        let report = protector.run(&broker, true, Utc::now()).await.unwrap();
        assert_eq!(report.applied, vec![("AAPL".to_string(), "break_even".to_string())]);
        let state = protector.state("AAPL").unwrap();
        assert_eq!(state.current_stop(), dec!(100.10));
        assert_eq!(state.stage, ProtectionStage::BreakEven);
        assert_eq!(stops(&broker.get_state().await.orders), vec![dec!(100.10)]);

        broker.mark_price("AAPL", dec!(102)).await;
        let report = protector.run(&broker, true, Utc::now()).await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(protector.state("AAPL").unwrap().current_stop(), dec!(100.10));
        assert_eq!(stops(&broker.get_state().await.orders), vec![dec!(100.10)]);
    }

    #[tokio::test]
    async fn test_gap_up_promotes_twice_then_idles() {
        let broker = PaperBroker::new(dec!(10000));
        let mut protector = protector(Arc::new(MemoryStateStore::new()));
        open_bracket(&broker, &mut protector).await;
        protector.run(&broker, true, Utc::now()).await.unwrap();

        // 1.6R clears both break-even and the 1.5R trailing trigger
        broker.mark_price("AAPL", dec!(108)).await;
        let report = protector.run(&broker, true, Utc::now()).await.unwrap();
        let names: Vec<&str> = report.applied.iter().map(|(_, a)| a.as_str()).collect();
        assert_eq!(names, vec!["break_even", "activate_trailing"]);

        let state = protector.state("AAPL").unwrap();
        assert_eq!(state.stage, ProtectionStage::Trailing);
        assert!(state.trailing_active);
        assert!(state.stop_order_id.is_none());

        let orders = broker.get_state().await.orders;
        assert!(stops(&orders).is_empty());
        assert_eq!(orders.iter().filter(|o| o.kind == OrderKind::TrailingStop).count(), 1);

        let report = protector.run(&broker, true, Utc::now()).await.unwrap();
        assert!(report.applied.is_empty());
        let orders = broker.get_state().await.orders;
        assert_eq!(orders.iter().filter(|o| o.kind == OrderKind::TrailingStop).count(), 1);
    }

    #[tokio::test]
    async fn test_unprotected_position_gets_stop() {
        let broker = PaperBroker::new(dec!(10000));
        broker.seed_position("MSFT", dec!(10), dec!(50)).await;
        let mut protector = protector(Arc::new(MemoryStateStore::new()));

        let report = protector.run(&broker, true, Utc::now()).await.unwrap();
        assert_eq!(report.applied, vec![("MSFT".to_string(), "missing_protection".to_string())]);

        let orders = broker.get_state().await.orders;
        assert_eq!(stops(&orders), vec![dec!(48.5)]);
        assert_eq!(orders[0].limit_price, Some(dec!(48.25)));

        let report = protector.run(&broker, true, Utc::now()).await.unwrap();
        assert!(report.applied.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_safeguards_suppress_everything() {
        let broker = PaperBroker::new(dec!(10000));
        broker.seed_position("MSFT", dec!(10), dec!(50)).await;
        let mut protector = protector(Arc::new(MemoryStateStore::new()));

        let report = protector.run(&broker, false, Utc::now()).await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.suppressed, vec![("MSFT".to_string(), "missing_protection".to_string())]);
        assert!(broker.get_state().await.orders.is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_restart_and_close() {
        let broker = PaperBroker::new(dec!(10000));
        let store = Arc::new(MemoryStateStore::new());
        let mut first = protector(store.clone());
        open_bracket(&broker, &mut first).await;
        broker.mark_price("AAPL", dec!(106)).await;
        first.run(&broker, true, Utc::now()).await.unwrap();

        let mut second = protector(store.clone());
        assert_eq!(second.state("AAPL"), first.state("AAPL"));
        assert_eq!(second.state("AAPL").unwrap().initial_stop, dec!(95));

        // stop at 100.10 fills and the position closes
        broker.mark_price("AAPL", dec!(100)).await;
        second.run(&broker, true, Utc::now()).await.unwrap();
        assert!(second.states().is_empty());
        assert!(store.load_position_states().unwrap().is_empty());
    }

    #[test]
    fn test_raise_stop_is_monotonic() {
        let mut state = OpenPositionState::new("X", dec!(1), dec!(100), dec!(95), Utc::now());
        assert!(!state.raise_stop(dec!(90)));
        assert!(!state.raise_stop(dec!(95)));
        assert!(state.raise_stop(dec!(97)));
        assert!(!state.raise_stop(dec!(96)));
        assert_eq!(state.current_stop(), dec!(97));
        assert_eq!(state.r_multiple(dec!(110)), dec!(2));
    }

    #[test]
    fn test_reconstruct_from_raised_broker_stop() {
        let mut protector = protector(Arc::new(MemoryStateStore::new()));
        let position = BrokerPosition {
            symbol: "AMD".to_string(),
            qty: dec!(4),
            avg_entry_price: dec!(100),
            current_price: dec!(112),
        };
        let stop = OpenOrder {
            id: "s-1".to_string(),
            client_order_id: None,
            symbol: "AMD".to_string(),
            side: OrderSide::Sell,
            kind: OrderKind::Stop,
            qty: dec!(4),
            limit_price: None,
            stop_price: Some(dec!(101)),
            trail_percent: None,
        };
        protector.sync(&[position], &[stop], Utc::now()).unwrap();

        let state = protector.state("AMD").unwrap();
        assert_eq!(state.stage, ProtectionStage::BreakEven);
        assert_eq!(state.current_stop(), dec!(101));
        assert_eq!(state.initial_stop, dec!(97));
        // 112 >= 100 + 1.5 * 3
        assert_eq!(
            protector.evaluate(state, dec!(112)),
            Some(ProtectionAction::StartTrailing { trail_pct: dec!(2) })
        );
    }
}
