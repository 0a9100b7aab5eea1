//! Alpaca trading REST API client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

use super::traits::{Broker, BrokerError};
use super::types::{
    AccountBalances, BrokerPosition, MarketClock, OpenOrder, OrderAck, OrderKind, OrderSide,
};
use crate::config::BrokerConfig;
use crate::strategy::BracketOrderPlan;

/// Protective exits must outlive the session they were placed in.
const PROTECTION_TIME_IN_FORCE: &str = "gtc";

const OPEN_STATUSES: &[&str] = &[
    "new",
    "accepted",
    "pending_new",
    "accepted_for_bidding",
    "held",
    "partially_filled",
    "pending_replace",
];

#[derive(Debug, Deserialize)]
struct RawClock {
    timestamp: DateTime<FixedOffset>,
    is_open: bool,
    #[serde(default)]
    next_open: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    next_close: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    equity: Decimal,
    cash: Decimal,
    buying_power: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    symbol: String,
    qty: Decimal,
    avg_entry_price: Decimal,
    #[serde(default)]
    current_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    id: String,
    #[serde(default)]
    client_order_id: Option<String>,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    qty: Option<Decimal>,
    #[serde(default)]
    limit_price: Option<Decimal>,
    #[serde(default)]
    stop_price: Option<Decimal>,
    #[serde(default)]
    trail_percent: Option<Decimal>,
    #[serde(default)]
    legs: Option<Vec<RawOrder>>,
}

impl RawOrder {
    fn is_open(&self) -> bool {
        self.status
            .as_deref()
            .map_or(true, |s| OPEN_STATUSES.contains(&s))
    }

    fn into_open_orders(self, out: &mut Vec<OpenOrder>) {
        let is_open = self.is_open();
        let legs = self.legs.unwrap_or_default();
        if is_open {
            let side = if self.side.eq_ignore_ascii_case("buy") {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            let kind = match self.kind.as_str() {
                "market" => Some(OrderKind::Market),
                "limit" => Some(OrderKind::Limit),
                "stop" => Some(OrderKind::Stop),
                "stop_limit" => Some(OrderKind::StopLimit),
                "trailing_stop" => Some(OrderKind::TrailingStop),
                _ => None,
            };
            if let Some(kind) = kind {
                out.push(OpenOrder {
                    id: self.id,
                    client_order_id: self.client_order_id,
                    symbol: self.symbol,
                    side,
                    kind,
                    qty: self.qty.unwrap_or(Decimal::ZERO),
                    limit_price: self.limit_price,
                    stop_price: self.stop_price,
                    trail_percent: self.trail_percent,
                });
            }
        }
        for leg in legs {
            leg.into_open_orders(out);
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawOrderAck {
    id: String,
    #[serde(default)]
    client_order_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TakeProfitLeg {
    limit_price: Decimal,
}

#[derive(Debug, Serialize)]
struct StopLossLeg {
    stop_price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<Decimal>,
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    symbol: &'a str,
    qty: Decimal,
    side: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    time_in_force: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trail_percent: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_order_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    take_profit: Option<TakeProfitLeg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_loss: Option<StopLossLeg>,
}

impl<'a> OrderRequest<'a> {
    fn sell(symbol: &'a str, qty: Decimal, kind: &'static str) -> Self {
        Self {
            symbol,
            qty,
            side: "sell",
            kind,
            time_in_force: PROTECTION_TIME_IN_FORCE,
            limit_price: None,
            stop_price: None,
            trail_percent: None,
            order_class: None,
            client_order_id: None,
            take_profit: None,
            stop_loss: None,
        }
    }
}

/// Alpaca REST client (paper or live endpoint per config).
pub struct AlpacaClient {
    http: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
    timeout: Duration,
}

impl AlpacaClient {
    /// Create a new client from configuration.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }

    fn map_transport(&self, err: reqwest::Error) -> BrokerError {
        if err.is_timeout() {
            BrokerError::Timeout(self.timeout)
        } else if err.is_connect() || err.is_request() {
            BrokerError::Unavailable(err.to_string())
        } else {
            BrokerError::Other(err.to_string())
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BrokerError> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, body))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BrokerError> {
        let response = self.send(self.http.get(self.url(path))).await?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::Other(format!("Failed to parse {} response: {}", path, e)))
    }

    async fn post_order(&self, order: &OrderRequest<'_>) -> Result<OrderAck, BrokerError> {
        debug!("Submitting order: {:?}", order);
        let response = self
            .send(self.http.post(self.url("/v2/orders")).json(order))
            .await?;
        let ack: RawOrderAck = response
            .json()
            .await
            .map_err(|e| BrokerError::Other(format!("Failed to parse order response: {}", e)))?;
        Ok(OrderAck {
            order_id: ack.id,
            client_order_id: ack.client_order_id,
        })
    }
}

fn map_status(status: StatusCode, body: String) -> BrokerError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        BrokerError::RateLimited
    } else if status.is_server_error() {
        BrokerError::Unavailable(format!("{}: {}", status, body))
    } else {
        BrokerError::Rejected(format!("{}: {}", status, body))
    }
}

#[async_trait]
impl Broker for AlpacaClient {
    #[instrument(skip(self))]
    async fn get_clock(&self) -> Result<MarketClock, BrokerError> {
        let raw: RawClock = self.get_json("/v2/clock").await?;
        Ok(MarketClock {
            timestamp: raw.timestamp,
            is_open: raw.is_open,
            next_open: raw.next_open,
            next_close: raw.next_close,
        })
    }

    #[instrument(skip(self))]
    async fn get_account(&self) -> Result<AccountBalances, BrokerError> {
        let raw: RawAccount = self.get_json("/v2/account").await?;
        Ok(AccountBalances {
            equity: raw.equity,
            cash: raw.cash,
            buying_power: raw.buying_power,
        })
    }

    #[instrument(skip(self))]
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let raw: Vec<RawPosition> = self.get_json("/v2/positions").await?;
        Ok(raw
            .into_iter()
            .map(|p| BrokerPosition {
                current_price: p.current_price.unwrap_or(p.avg_entry_price),
                symbol: p.symbol,
                qty: p.qty,
                avg_entry_price: p.avg_entry_price,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError> {
        let raw: Vec<RawOrder> = self
            .get_json("/v2/orders?status=open&nested=true&limit=500")
            .await?;
        let mut orders = Vec::new();
        for order in raw {
            order.into_open_orders(&mut orders);
        }
        Ok(orders)
    }

    #[instrument(skip(self, plan), fields(symbol = %plan.symbol(), client_order_id = %plan.client_order_id()))]
    async fn submit_bracket_order(&self, plan: &BracketOrderPlan) -> Result<OrderAck, BrokerError> {
        let order = OrderRequest {
            symbol: plan.symbol(),
            qty: plan.qty(),
            side: "buy",
            kind: "market",
            time_in_force: plan.time_in_force(),
            limit_price: None,
            stop_price: None,
            trail_percent: None,
            order_class: Some("bracket"),
            client_order_id: Some(plan.client_order_id()),
            take_profit: Some(TakeProfitLeg {
                limit_price: plan.take_profit_price(),
            }),
            stop_loss: Some(StopLossLeg {
                stop_price: plan.stop_price(),
                limit_price: plan.stop_limit_price(),
            }),
        };
        self.post_order(&order).await
    }

    #[instrument(skip(self))]
    async fn submit_stop_order(
        &self,
        symbol: &str,
        qty: Decimal,
        stop_price: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<OrderAck, BrokerError> {
        let kind = if limit_price.is_some() { "stop_limit" } else { "stop" };
        let order = OrderRequest {
            stop_price: Some(stop_price),
            limit_price,
            ..OrderRequest::sell(symbol, qty, kind)
        };
        self.post_order(&order).await
    }

    #[instrument(skip(self))]
    async fn submit_trailing_stop(
        &self,
        symbol: &str,
        qty: Decimal,
        trail_pct: Decimal,
    ) -> Result<OrderAck, BrokerError> {
        let order = OrderRequest {
            trail_percent: Some(trail_pct),
            ..OrderRequest::sell(symbol, qty, "trailing_stop")
        };
        self.post_order(&order).await
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let path = format!("/v2/orders/{}", order_id);
        self.send(self.http.delete(self.url(&path))).await?;
        Ok(())
    }
}
