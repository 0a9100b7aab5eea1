//! Idempotent bracket-order submission.

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use super::order_plan::BracketOrderPlan;
use crate::broker::{Broker, BrokerError, OrderAck};

/// Bound a broker call by `timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout(timeout)),
    }
}

/// How a submission resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Broker accepted a new order
    Submitted(OrderAck),
    /// An order with the same client id was already working
    AlreadyWorking(OrderAck),
}

impl SubmitOutcome {
    pub fn ack(&self) -> &OrderAck {
        match self {
            SubmitOutcome::Submitted(ack) | SubmitOutcome::AlreadyWorking(ack) => ack,
        }
    }
}

/// Submits validated bracket plans exactly once.
pub struct OrderExecutor {
    broker_timeout: Duration,
}

impl OrderExecutor {
    pub fn new(broker_timeout: Duration) -> Self {
        Self { broker_timeout }
    }

    async fn find_working(&self, broker: &dyn Broker, client_order_id: &str) -> Result<Option<OrderAck>, BrokerError> {
        let orders = with_timeout(self.broker_timeout, broker.list_open_orders()).await?;
        Ok(orders
            .into_iter()
            .find(|o| o.client_order_id.as_deref() == Some(client_order_id))
            .map(|o| OrderAck {
                order_id: o.id,
                client_order_id: o.client_order_id,
            }))
    }

    /// Submit `plan` unless an order with its client id is already working.
    ///
    /// A timed-out submission is resolved by looking the client id up again,
    /// since the broker may have accepted it before the deadline.
    pub async fn submit(&self, broker: &dyn Broker, plan: &BracketOrderPlan) -> Result<SubmitOutcome, BrokerError> {
        let client_id = plan.client_order_id();
        if let Some(existing) = self.find_working(broker, client_id).await? {
            info!(symbol = %plan.symbol(), %client_id, "Bracket already working; not resubmitting");
            return Ok(SubmitOutcome::AlreadyWorking(existing));
        }

        match with_timeout(self.broker_timeout, broker.submit_bracket_order(plan)).await {
            Ok(ack) => {
                info!(
                    symbol = %plan.symbol(),
                    order_id = %ack.order_id,
                    qty = %plan.qty(),
                    entry = %plan.entry_price(),
                    stop = %plan.stop_price(),
                    take_profit = %plan.take_profit_price(),
                    rr = %plan.reward_risk().round_dp(2),
                    "Bracket order submitted"
                );
                Ok(SubmitOutcome::Submitted(ack))
            }
            Err(BrokerError::Timeout(elapsed)) => {
                warn!(symbol = %plan.symbol(), "Bracket submission timed out; checking broker");
                match self.find_working(broker, client_id).await {
                    Ok(Some(ack)) => Ok(SubmitOutcome::AlreadyWorking(ack)),
                    _ => Err(BrokerError::Timeout(elapsed)),
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::config::{ExecutionConfig, RiskConfig};
    use crate::strategy::OrderPlanValidator;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn plan() -> BracketOrderPlan {
        let validator = OrderPlanValidator::new(&ExecutionConfig::default(), &RiskConfig::default());
        let prices = validator.compute(dec!(100), dec!(5), dec!(10)).unwrap();
        validator
            .build_plan("AAPL", dec!(3), prices, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_then_propagate_rejection() {
        let broker = PaperBroker::new(dec!(10000));
        let executor = OrderExecutor::new(Duration::from_secs(1));

        let first = executor.submit(&broker, &plan()).await.unwrap();
        assert!(matches!(first, SubmitOutcome::Submitted(_)));

        // paper fills instantly, so the client id is consumed and no longer working
        let second = executor.submit(&broker, &plan()).await;
        assert!(matches!(second, Err(BrokerError::Rejected(_))));
        assert_eq!(broker.get_state().await.positions["AAPL"].qty, dec!(3));
    }

    #[tokio::test]
    async fn test_working_order_is_not_resubmitted() {
        use crate::broker::{OpenOrder, OrderKind, OrderSide};
        use async_trait::async_trait;

        struct WorkingBroker {
            inner: PaperBroker,
            client_id: String,
        }

        #[async_trait]
        impl Broker for WorkingBroker {
            async fn get_clock(&self) -> Result<crate::broker::MarketClock, BrokerError> {
                self.inner.get_clock().await
            }
            async fn get_account(&self) -> Result<crate::broker::AccountBalances, BrokerError> {
                self.inner.get_account().await
            }
            async fn list_positions(&self) -> Result<Vec<crate::broker::BrokerPosition>, BrokerError> {
                self.inner.list_positions().await
            }
            async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError> {
                Ok(vec![OpenOrder {
                    id: "entry-1".to_string(),
                    client_order_id: Some(self.client_id.clone()),
                    symbol: "AAPL".to_string(),
                    side: OrderSide::Buy,
                    kind: OrderKind::Market,
                    qty: dec!(3),
                    limit_price: None,
                    stop_price: None,
                    trail_percent: None,
                }])
            }
            async fn submit_bracket_order(&self, _plan: &BracketOrderPlan) -> Result<OrderAck, BrokerError> {
                panic!("must not resubmit a working order");
            }
            async fn submit_stop_order(
                &self,
                symbol: &str,
                qty: rust_decimal::Decimal,
                stop: rust_decimal::Decimal,
                limit: Option<rust_decimal::Decimal>,
            ) -> Result<OrderAck, BrokerError> {
                self.inner.submit_stop_order(symbol, qty, stop, limit).await
            }
            async fn submit_trailing_stop(
                &self,
                symbol: &str,
                qty: rust_decimal::Decimal,
                trail_pct: rust_decimal::Decimal,
            ) -> Result<OrderAck, BrokerError> {
                self.inner.submit_trailing_stop(symbol, qty, trail_pct).await
            }
            async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
                self.inner.cancel_order(order_id).await
            }
        }

        let plan = plan();
        let broker = WorkingBroker {
            inner: PaperBroker::new(dec!(10000)),
            client_id: plan.client_order_id().to_string(),
        };
        let outcome = OrderExecutor::new(Duration::from_secs(1))
            .submit(&broker, &plan)
            .await
            .unwrap();
        assert_eq!(outcome.ack().order_id, "entry-1");
        assert!(matches!(outcome, SubmitOutcome::AlreadyWorking(_)));
    }
}
