//! Typed events flowing through the bus.
//!
//! Every event is built once by its producing component and never mutated
//! afterwards; handlers only ever see `&Event`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Signed quantity per ticker. Positive is net long, negative is net short.
pub type Positions = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Market,
    Signal,
    Order,
    Fill,
    Position,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Market,
        EventKind::Signal,
        EventKind::Order,
        EventKind::Fill,
        EventKind::Position,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Market => "MARKET",
            EventKind::Signal => "SIGNAL",
            EventKind::Order => "ORDER",
            EventKind::Fill => "FILL",
            EventKind::Position => "POSITION",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("unknown event kind: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }

    /// +1 for BUY, -1 for SELL.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Buy => 1.0,
            Direction::Sell => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MKT")]
    Market,
    #[serde(rename = "LMT")]
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MKT",
            OrderType::Limit => "LMT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub ticker: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub ticker: String,
    pub action: Direction,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub ticker: String,
    pub order_type: OrderType,
    pub quantity: f64,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub ticker: String,
    pub quantity: f64,
    pub direction: Direction,
    pub fill_price: f64,
    pub commission: f64,
}

impl FillEvent {
    /// Quantity with the direction's sign applied.
    pub fn signed_quantity(&self) -> f64 {
        self.quantity * self.direction.sign()
    }
}

/// Full point-in-time position snapshot, not a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub positions: Positions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum Event {
    Market(MarketEvent),
    Signal(SignalEvent),
    Order(OrderEvent),
    Fill(FillEvent),
    Position(PositionEvent),
}

impl Event {
    pub fn market(ticker: impl Into<String>, price: f64) -> Self {
        Event::Market(MarketEvent { ticker: ticker.into(), price })
    }

    pub fn signal(ticker: impl Into<String>, action: Direction, price: f64) -> Self {
        Event::Signal(SignalEvent { ticker: ticker.into(), action, price })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Market(_) => EventKind::Market,
            Event::Signal(_) => EventKind::Signal,
            Event::Order(_) => EventKind::Order,
            Event::Fill(_) => EventKind::Fill,
            Event::Position(_) => EventKind::Position,
        }
    }

    /// Ticker the event refers to. Position snapshots span all tickers.
    pub fn ticker(&self) -> Option<&str> {
        match self {
            Event::Market(e) => Some(&e.ticker),
            Event::Signal(e) => Some(&e.ticker),
            Event::Order(e) => Some(&e.ticker),
            Event::Fill(e) => Some(&e.ticker),
            Event::Position(_) => None,
        }
    }
}

impl From<MarketEvent> for Event {
    fn from(e: MarketEvent) -> Self {
        Event::Market(e)
    }
}

impl From<SignalEvent> for Event {
    fn from(e: SignalEvent) -> Self {
        Event::Signal(e)
    }
}

impl From<OrderEvent> for Event {
    fn from(e: OrderEvent) -> Self {
        Event::Order(e)
    }
}

impl From<FillEvent> for Event {
    fn from(e: FillEvent) -> Self {
        Event::Fill(e)
    }
}

impl From<PositionEvent> for Event {
    fn from(e: PositionEvent) -> Self {
        Event::Position(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(Event::market("AAPL", 1.0).kind(), EventKind::Market);
        assert_eq!(Event::signal("AAPL", Direction::Buy, 1.0).kind(), EventKind::Signal);
        let pos = Event::from(PositionEvent { positions: Positions::new() });
        assert_eq!(pos.kind(), EventKind::Position);
        assert!(pos.ticker().is_none());
    }

    #[test]
    fn test_kind_parse_rejects_unknown() {
        assert_eq!("fill".parse::<EventKind>().unwrap(), EventKind::Fill);
        assert_eq!(" MARKET ".parse::<EventKind>().unwrap(), EventKind::Market);
        assert!("TICK".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_signed_quantity() {
        let mut fill = FillEvent {
            ticker: "AAPL".to_string(),
            quantity: 100.0,
            direction: Direction::Buy,
            fill_price: 150.0,
            commission: 5.0,
        };
        assert_eq!(fill.signed_quantity(), 100.0);
        fill.direction = Direction::Sell;
        assert_eq!(fill.signed_quantity(), -100.0);
    }

    #[test]
    fn test_wire_names() {
        let order = Event::Order(OrderEvent {
            ticker: "MSFT".to_string(),
            order_type: OrderType::Market,
            quantity: 10.0,
            direction: Direction::Sell,
        });
        let v = serde_json::to_value(&order).unwrap();
        assert_eq!(v["kind"], "ORDER");
        assert_eq!(v["order_type"], "MKT");
        assert_eq!(v["direction"], "SELL");
    }
}
