//! Broker abstraction.
//!
//! New long exposure can only be opened through [`Broker::submit_bracket_order`],
//! which accepts nothing but a validated [`BracketOrderPlan`].

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

use super::types::{AccountBalances, AccountSnapshot, BrokerPosition, MarketClock, OpenOrder, OrderAck};
use crate::strategy::BracketOrderPlan;

/// Broker failure classes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("rate limited")]
    RateLimited,

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::RateLimited | BrokerError::Unavailable(_) | BrokerError::Timeout(_)
        )
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_clock(&self) -> Result<MarketClock, BrokerError>;

    async fn get_account(&self) -> Result<AccountBalances, BrokerError>;

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError>;

    /// Balances, positions and working orders in one read.
    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        let balances = self.get_account().await?;
        let positions = self.list_positions().await?;
        let open_orders = self.list_open_orders().await?;
        Ok(AccountSnapshot {
            equity: balances.equity,
            cash: balances.cash,
            buying_power: balances.buying_power,
            positions,
            open_orders,
        })
    }

    /// Market entry with attached stop-loss and take-profit legs.
    async fn submit_bracket_order(&self, plan: &BracketOrderPlan) -> Result<OrderAck, BrokerError>;

    /// Standalone sell stop (stop-limit when `limit_price` is set) protecting a position.
    async fn submit_stop_order(
        &self,
        symbol: &str,
        qty: Decimal,
        stop_price: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<OrderAck, BrokerError>;

    /// Sell trailing stop, `trail_pct` in percent of price.
    async fn submit_trailing_stop(
        &self,
        symbol: &str,
        qty: Decimal,
        trail_pct: Decimal,
    ) -> Result<OrderAck, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;
}
