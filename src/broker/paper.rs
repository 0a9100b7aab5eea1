//! In-memory paper broker.
//!
//! Entries fill immediately at the plan's reference price; exits fill when
//! [`PaperBroker::mark_price`] crosses a working stop, trailing stop or target.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::traits::{Broker, BrokerError};
use super::types::{
    AccountBalances, BrokerPosition, MarketClock, OpenOrder, OrderAck, OrderKind, OrderSide,
};
use crate::strategy::BracketOrderPlan;

/// New York standard time; close enough for paper trading-day boundaries.
const PAPER_EXCHANGE_OFFSET_SECS: i32 = -5 * 3600;

/// Simulated position.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperPosition {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub last_price: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// Simulated account state.
#[derive(Debug, Clone)]
pub struct PaperState {
    pub initial_cash: Decimal,
    pub cash: Decimal,
    pub positions: HashMap<String, PaperPosition>,
    pub orders: Vec<OpenOrder>,
    pub used_client_ids: HashSet<String>,
    pub canceled_order_ids: Vec<String>,
    pub realized_pnl: Decimal,
    pub order_count: u64,
    pub market_open: bool,
    pub clock_override: Option<DateTime<FixedOffset>>,
    /// High-water mark per trailing-stop order id
    trailing_highs: HashMap<String, Decimal>,
}

impl PaperState {
    fn new(initial_cash: Decimal) -> Self {
        Self {
            initial_cash,
            cash: initial_cash,
            positions: HashMap::new(),
            orders: Vec::new(),
            used_client_ids: HashSet::new(),
            canceled_order_ids: Vec::new(),
            realized_pnl: Decimal::ZERO,
            order_count: 0,
            market_open: true,
            clock_override: None,
            trailing_highs: HashMap::new(),
        }
    }

    pub fn equity(&self) -> Decimal {
        self.cash
            + self
                .positions
                .values()
                .map(|p| p.qty * p.last_price)
                .sum::<Decimal>()
    }

    fn close_position(&mut self, symbol: &str, price: Decimal) {
        if let Some(pos) = self.positions.remove(symbol) {
            let proceeds = pos.qty * price;
            self.cash += proceeds;
            self.realized_pnl += proceeds - pos.qty * pos.avg_entry_price;
            info!(
                %symbol,
                qty = %pos.qty,
                exit = %price,
                "Paper position closed"
            );
        }
        // one-cancels-other: remaining exits for the symbol are void
        let removed: Vec<String> = self
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .map(|o| o.id.clone())
            .collect();
        self.orders.retain(|o| o.symbol != symbol);
        for id in removed {
            self.trailing_highs.remove(&id);
        }
    }
}

/// Paper broker with shared state.
pub struct PaperBroker {
    state: Arc<RwLock<PaperState>>,
    order_id_counter: AtomicU64,
    injected_failure: RwLock<Option<BrokerError>>,
}

impl PaperBroker {
    /// Create a paper account holding `initial_cash`.
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperState::new(initial_cash))),
            order_id_counter: AtomicU64::new(1),
            injected_failure: RwLock::new(None),
        }
    }

    fn next_order_id(&self) -> String {
        format!("paper-{}", self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Clone of the current state for inspection.
    pub async fn get_state(&self) -> PaperState {
        self.state.read().await.clone()
    }

    pub async fn set_market_open(&self, open: bool) {
        self.state.write().await.market_open = open;
    }

    /// Pin the clock to a fixed instant.
    pub async fn set_clock(&self, timestamp: DateTime<FixedOffset>) {
        self.state.write().await.clock_override = Some(timestamp);
    }

    /// Fail the next order submission with `error`.
    pub async fn inject_failure(&self, error: BrokerError) {
        *self.injected_failure.write().await = Some(error);
    }

    async fn take_injected_failure(&self) -> Result<(), BrokerError> {
        match self.injected_failure.write().await.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Seed a position directly, without any protective orders.
    pub async fn seed_position(&self, symbol: &str, qty: Decimal, entry: Decimal) {
        let mut state = self.state.write().await;
        state.cash -= qty * entry;
        state.positions.insert(
            symbol.to_string(),
            PaperPosition {
                symbol: symbol.to_string(),
                qty,
                avg_entry_price: entry,
                last_price: entry,
                opened_at: Utc::now(),
            },
        );
    }

    /// Update the last price and fill any exit it crosses.
    pub async fn mark_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.write().await;
        match state.positions.get_mut(symbol) {
            Some(pos) => pos.last_price = price,
            None => return,
        }

        let mut fill: Option<Decimal> = None;
        let orders: Vec<OpenOrder> = state
            .orders
            .iter()
            .filter(|o| o.symbol == symbol && o.side == OrderSide::Sell)
            .cloned()
            .collect();
        for order in orders {
            match order.kind {
                OrderKind::Stop | OrderKind::StopLimit => {
                    if let Some(stop) = order.stop_price.filter(|s| price <= *s) {
                        fill = Some(stop);
                    }
                }
                OrderKind::Limit => {
                    if let Some(limit) = order.limit_price.filter(|l| price >= *l) {
                        fill = Some(limit);
                    }
                }
                OrderKind::TrailingStop => {
                    let trail = order.trail_percent.unwrap_or(Decimal::ZERO) / Decimal::ONE_HUNDRED;
                    let high = state
                        .trailing_highs
                        .entry(order.id.clone())
                        .or_insert(price);
                    if price > *high {
                        *high = price;
                    }
                    let trigger = *high * (Decimal::ONE - trail);
                    if price <= trigger {
                        fill = Some(price);
                    }
                }
                OrderKind::Market => fill = Some(price),
            }
            if fill.is_some() {
                break;
            }
        }

        if let Some(exit) = fill {
            state.close_position(symbol, exit);
        }
    }

    fn position_qty(state: &PaperState, symbol: &str) -> Decimal {
        state
            .positions
            .get(symbol)
            .map(|p| p.qty)
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn get_clock(&self) -> Result<MarketClock, BrokerError> {
        let state = self.state.read().await;
        let offset = FixedOffset::east_opt(PAPER_EXCHANGE_OFFSET_SECS).unwrap_or(Utc.fix());
        let timestamp = state
            .clock_override
            .unwrap_or_else(|| Utc::now().with_timezone(&offset));
        Ok(MarketClock {
            timestamp,
            is_open: state.market_open,
            next_open: None,
            next_close: None,
        })
    }

    async fn get_account(&self) -> Result<AccountBalances, BrokerError> {
        let state = self.state.read().await;
        Ok(AccountBalances {
            equity: state.equity(),
            cash: state.cash,
            buying_power: state.cash,
        })
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let state = self.state.read().await;
        let mut positions: Vec<BrokerPosition> = state
            .positions
            .values()
            .map(|p| BrokerPosition {
                symbol: p.symbol.clone(),
                qty: p.qty,
                avg_entry_price: p.avg_entry_price,
                current_price: p.last_price,
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError> {
        Ok(self.state.read().await.orders.clone())
    }

    async fn submit_bracket_order(&self, plan: &BracketOrderPlan) -> Result<OrderAck, BrokerError> {
        self.take_injected_failure().await?;
        let mut state = self.state.write().await;

        if state.used_client_ids.contains(plan.client_order_id()) {
            return Err(BrokerError::Rejected(format!(
                "client_order_id {} already used",
                plan.client_order_id()
            )));
        }
        let notional = plan.notional();
        if notional > state.cash {
            return Err(BrokerError::Rejected("insufficient buying power".to_string()));
        }

        let symbol = plan.symbol().to_string();
        let price = plan.entry_price();
        state.cash -= notional;
        let position = state
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| PaperPosition {
                symbol: symbol.clone(),
                qty: Decimal::ZERO,
                avg_entry_price: price,
                last_price: price,
                opened_at: Utc::now(),
            });
        let total = position.qty + plan.qty();
        position.avg_entry_price = (position.avg_entry_price * position.qty + notional) / total;
        position.qty = total;
        position.last_price = price;

        let parent_id = self.next_order_id();
        let take_profit = OpenOrder {
            id: self.next_order_id(),
            client_order_id: None,
            symbol: symbol.clone(),
            side: OrderSide::Sell,
            kind: OrderKind::Limit,
            qty: plan.qty(),
            limit_price: Some(plan.take_profit_price()),
            stop_price: None,
            trail_percent: None,
        };
        let stop_loss = OpenOrder {
            id: self.next_order_id(),
            client_order_id: None,
            symbol: symbol.clone(),
            side: OrderSide::Sell,
            kind: if plan.stop_limit_price().is_some() {
                OrderKind::StopLimit
            } else {
                OrderKind::Stop
            },
            qty: plan.qty(),
            limit_price: plan.stop_limit_price(),
            stop_price: Some(plan.stop_price()),
            trail_percent: None,
        };
        state.orders.push(take_profit);
        state.orders.push(stop_loss);
        state.used_client_ids.insert(plan.client_order_id().to_string());
        state.order_count += 1;

        info!(
            order_id = %parent_id,
            %symbol,
            qty = %plan.qty(),
            entry = %price,
            stop = %plan.stop_price(),
            take_profit = %plan.take_profit_price(),
            "Paper bracket order filled"
        );

        Ok(OrderAck {
            order_id: parent_id,
            client_order_id: Some(plan.client_order_id().to_string()),
        })
    }

    async fn submit_stop_order(
        &self,
        symbol: &str,
        qty: Decimal,
        stop_price: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<OrderAck, BrokerError> {
        self.take_injected_failure().await?;
        let mut state = self.state.write().await;
        if Self::position_qty(&state, symbol) < qty {
            return Err(BrokerError::Rejected(format!("insufficient qty for {}", symbol)));
        }

        let id = self.next_order_id();
        state.orders.push(OpenOrder {
            id: id.clone(),
            client_order_id: None,
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            kind: if limit_price.is_some() {
                OrderKind::StopLimit
            } else {
                OrderKind::Stop
            },
            qty,
            limit_price,
            stop_price: Some(stop_price),
            trail_percent: None,
        });
        state.order_count += 1;
        debug!(%symbol, %stop_price, order_id = %id, "Paper stop order placed");

        Ok(OrderAck {
            order_id: id,
            client_order_id: None,
        })
    }

    async fn submit_trailing_stop(
        &self,
        symbol: &str,
        qty: Decimal,
        trail_pct: Decimal,
    ) -> Result<OrderAck, BrokerError> {
        self.take_injected_failure().await?;
        let mut state = self.state.write().await;
        if Self::position_qty(&state, symbol) < qty {
            return Err(BrokerError::Rejected(format!("insufficient qty for {}", symbol)));
        }

        let id = self.next_order_id();
        let last = state
            .positions
            .get(symbol)
            .map(|p| p.last_price)
            .unwrap_or(Decimal::ZERO);
        state.trailing_highs.insert(id.clone(), last);
        state.orders.push(OpenOrder {
            id: id.clone(),
            client_order_id: None,
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            kind: OrderKind::TrailingStop,
            qty,
            limit_price: None,
            stop_price: None,
            trail_percent: Some(trail_pct),
        });
        state.order_count += 1;
        debug!(%symbol, %trail_pct, order_id = %id, "Paper trailing stop placed");

        Ok(OrderAck {
            order_id: id,
            client_order_id: None,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        let before = state.orders.len();
        state.orders.retain(|o| o.id != order_id);
        if state.orders.len() == before {
            return Err(BrokerError::Rejected(format!("order {} not found", order_id)));
        }
        state.trailing_highs.remove(order_id);
        state.canceled_order_ids.push(order_id.to_string());
        Ok(())
    }
}
