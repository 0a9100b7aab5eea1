//! Broker-neutral account, position and order types.

use chrono::{DateTime, FixedOffset, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Market clock as reported by the broker, in exchange-local time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketClock {
    pub timestamp: DateTime<FixedOffset>,
    pub is_open: bool,
    #[serde(default)]
    pub next_open: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub next_close: Option<DateTime<FixedOffset>>,
}

impl MarketClock {
    /// Exchange-local calendar date; daily limits reset when it changes.
    pub fn trading_day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Cash balances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountBalances {
    pub equity: Decimal,
    pub cash: Decimal,
    pub buying_power: Decimal,
}

/// A long equity position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub current_price: Decimal,
}

impl BrokerPosition {
    pub fn market_value(&self) -> Decimal {
        self.qty * self.current_price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

/// An order still working at the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub trail_percent: Option<Decimal>,
}

impl OpenOrder {
    /// Fixed stop (plain or stop-limit) on the sell side.
    pub fn is_protective_stop(&self) -> bool {
        self.side == OrderSide::Sell && matches!(self.kind, OrderKind::Stop | OrderKind::StopLimit)
    }

    pub fn is_trailing_stop(&self) -> bool {
        self.side == OrderSide::Sell && self.kind == OrderKind::TrailingStop
    }

    /// Anything that is neither a stop nor a take-profit exit.
    pub fn is_entry(&self) -> bool {
        self.side == OrderSide::Buy
    }
}

/// Broker acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: Option<String>,
}

/// Account state read at the start of a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub cash: Decimal,
    pub buying_power: Decimal,
    pub positions: Vec<BrokerPosition>,
    pub open_orders: Vec<OpenOrder>,
}

impl AccountSnapshot {
    pub fn total_exposure(&self) -> Decimal {
        self.positions.iter().map(|p| p.market_value()).sum()
    }

    pub fn symbol_exposure(&self, symbol: &str) -> Decimal {
        self.positions
            .iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.market_value())
            .sum()
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions
            .iter()
            .any(|p| p.symbol == symbol && p.qty > Decimal::ZERO)
    }

    /// An unfilled buy for `symbol`; exit legs do not count.
    pub fn has_pending_entry(&self, symbol: &str) -> bool {
        self.open_orders.iter().any(|o| o.symbol == symbol && o.is_entry())
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.iter().filter(|p| p.qty > Decimal::ZERO).count()
    }

    /// Reflect an accepted entry so later candidates in the same tick see it.
    pub fn apply_entry(&mut self, symbol: &str, qty: Decimal, price: Decimal) {
        let notional = qty * price;
        self.cash -= notional;
        self.buying_power -= notional;
        match self.positions.iter_mut().find(|p| p.symbol == symbol) {
            Some(pos) => {
                let total = pos.qty + qty;
                pos.avg_entry_price = (pos.avg_entry_price * pos.qty + notional) / total;
                pos.qty = total;
                pos.current_price = price;
            }
            None => self.positions.push(BrokerPosition {
                symbol: symbol.to_string(),
                qty,
                avg_entry_price: price,
                current_price: price,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot() -> AccountSnapshot {
        AccountSnapshot {
            equity: dec!(10000),
            cash: dec!(8000),
            buying_power: dec!(8000),
            positions: vec![BrokerPosition {
                symbol: "AAPL".to_string(),
                qty: dec!(10),
                avg_entry_price: dec!(190),
                current_price: dec!(200),
            }],
            open_orders: vec![],
        }
    }

    #[test]
    fn test_exposure() {
        let snap = snapshot();
        assert_eq!(snap.total_exposure(), dec!(2000));
        assert_eq!(snap.symbol_exposure("AAPL"), dec!(2000));
        assert_eq!(snap.symbol_exposure("MSFT"), Decimal::ZERO);
        assert!(snap.has_position("AAPL"));
    }

    #[test]
    fn test_apply_entry() {
        let mut snap = snapshot();
        snap.apply_entry("MSFT", dec!(2), dec!(400));
        assert_eq!(snap.cash, dec!(7200));
        assert_eq!(snap.open_position_count(), 2);
        assert_eq!(snap.total_exposure(), dec!(2800));
    }

    #[test]
    fn test_trading_day_uses_exchange_offset() {
        // 23:30 in New York is already the next UTC day
        let ts = DateTime::parse_from_rfc3339("2026-03-02T23:30:00-05:00").unwrap();
        let clock = MarketClock {
            timestamp: ts,
            is_open: false,
            next_open: None,
            next_close: None,
        };
        assert_eq!(clock.trading_day(), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
    }
}
