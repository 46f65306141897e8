//! Observe-only equity monitor.
//!
//! Keeps the latest price per ticker (from Market events) and the latest
//! position snapshot (from Position events). Each snapshot triggers an
//! equity check; a breach is logged and recorded but nothing is blocked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::bus::EventBus;
use crate::events::{Event, EventKind, MarketEvent, PositionEvent, Positions};
use crate::logging::{log_risk_breach, log_risk_check};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskBreach {
    pub equity: f64,
    pub limit: f64,
}

/// Σ position × price over tickers present in both maps. A ticker missing
/// from either side contributes nothing.
pub fn total_equity(positions: &Positions, prices: &HashMap<String, f64>) -> f64 {
    positions
        .iter()
        .filter_map(|(ticker, qty)| prices.get(ticker).map(|price| qty * price))
        .sum()
}

#[derive(Debug, Clone)]
pub struct RiskMonitor {
    equity_limit: f64,
    prices: HashMap<String, f64>,
    positions: Positions,
    last_equity: Option<f64>,
    breaches: Vec<RiskBreach>,
}

impl RiskMonitor {
    pub fn new(equity_limit: f64) -> Self {
        Self {
            equity_limit,
            prices: HashMap::new(),
            positions: Positions::new(),
            last_equity: None,
            breaches: Vec::new(),
        }
    }

    pub fn on_market(&mut self, event: &MarketEvent) {
        self.prices.insert(event.ticker.clone(), event.price);
    }

    /// Replace the snapshot and check equity. Skipped until at least one
    /// price has been seen.
    pub fn on_position(&mut self, event: &PositionEvent) -> Option<RiskBreach> {
        self.positions = event.positions.clone();
        if self.prices.is_empty() {
            return None;
        }
        let equity = self.total_equity();
        self.last_equity = Some(equity);
        let breached = equity > self.equity_limit;
        log_risk_check(equity, self.equity_limit, breached);
        if !breached {
            return None;
        }
        let breach = RiskBreach { equity, limit: self.equity_limit };
        log_risk_breach(equity, self.equity_limit);
        self.breaches.push(breach);
        Some(breach)
    }

    pub fn total_equity(&self) -> f64 {
        total_equity(&self.positions, &self.prices)
    }

    pub fn latest_price(&self, ticker: &str) -> Option<f64> {
        self.prices.get(ticker).copied()
    }

    pub fn last_equity(&self) -> Option<f64> {
        self.last_equity
    }

    pub fn breaches(&self) -> &[RiskBreach] {
        &self.breaches
    }
}

/// Bus-facing wrapper around [`RiskMonitor`].
pub struct RiskManager {
    monitor: Arc<Mutex<RiskMonitor>>,
}

impl RiskManager {
    pub fn attach(bus: &EventBus, equity_limit: f64) -> Self {
        let monitor = Arc::new(Mutex::new(RiskMonitor::new(equity_limit)));

        let m = Arc::clone(&monitor);
        bus.subscribe(EventKind::Market, "risk.on_market", move |event| {
            if let Event::Market(market) = event {
                m.lock().unwrap_or_else(PoisonError::into_inner).on_market(market);
            }
            Ok(())
        });

        let m = Arc::clone(&monitor);
        bus.subscribe(EventKind::Position, "risk.on_position", move |event| {
            if let Event::Position(snapshot) = event {
                m.lock().unwrap_or_else(PoisonError::into_inner).on_position(snapshot);
            }
            Ok(())
        });

        Self { monitor }
    }

    pub fn total_equity(&self) -> f64 {
        self.lock().total_equity()
    }

    /// Equity computed at the most recent Position event, if any.
    pub fn last_equity(&self) -> Option<f64> {
        self.lock().last_equity()
    }

    pub fn latest_price(&self, ticker: &str) -> Option<f64> {
        self.lock().latest_price(ticker)
    }

    pub fn breaches(&self) -> Vec<RiskBreach> {
        self.lock().breaches().to_vec()
    }

    pub fn breach_count(&self) -> usize {
        self.lock().breaches().len()
    }

    fn lock(&self) -> MutexGuard<'_, RiskMonitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(pairs: &[(&str, f64)]) -> PositionEvent {
        PositionEvent {
            positions: pairs.iter().map(|(t, q)| (t.to_string(), *q)).collect(),
        }
    }

    fn market(ticker: &str, price: f64) -> MarketEvent {
        MarketEvent { ticker: ticker.to_string(), price }
    }

    #[test]
    fn test_no_check_without_prices() {
        let mut risk = RiskMonitor::new(1.0);
        assert!(risk.on_position(&positions(&[("AAPL", 100.0)])).is_none());
        assert!(risk.last_equity().is_none());
        assert!(risk.breaches().is_empty());
    }

    #[test]
    fn test_equity_and_breach() {
        let mut risk = RiskMonitor::new(1_000.0);
        risk.on_market(&market("AAPL", 150.0));
        let breach = risk.on_position(&positions(&[("AAPL", 100.0)])).unwrap();
        assert_eq!(breach.equity, 15_000.0);
        assert_eq!(breach.limit, 1_000.0);
        assert_eq!(risk.last_equity(), Some(15_000.0));
        assert_eq!(risk.breaches().len(), 1);
    }

    #[test]
    fn test_under_limit_is_quiet() {
        let mut risk = RiskMonitor::new(1_000_000.0);
        risk.on_market(&market("AAPL", 150.0));
        assert!(risk.on_position(&positions(&[("AAPL", 100.0)])).is_none());
        assert_eq!(risk.total_equity(), 15_000.0);
    }

    #[test]
    fn test_missing_tickers_contribute_zero() {
        let mut risk = RiskMonitor::new(f64::MAX);
        risk.on_market(&market("AAPL", 10.0));
        risk.on_market(&market("GOOG", 99.0));
        risk.on_position(&positions(&[("AAPL", 5.0), ("MSFT", 1_000.0)]));
        assert_eq!(risk.total_equity(), 50.0);
    }

    #[test]
    fn test_short_positions_reduce_equity() {
        let mut prices = HashMap::new();
        prices.insert("AAPL".to_string(), 10.0);
        prices.insert("MSFT".to_string(), 20.0);
        let pos = positions(&[("AAPL", 10.0), ("MSFT", -2.0)]).positions;
        assert_eq!(total_equity(&pos, &prices), 60.0);
    }

    #[test]
    fn test_snapshot_replaced_wholesale() {
        let mut risk = RiskMonitor::new(f64::MAX);
        risk.on_market(&market("AAPL", 10.0));
        risk.on_market(&market("MSFT", 10.0));
        risk.on_position(&positions(&[("AAPL", 1.0), ("MSFT", 1.0)]));
        risk.on_position(&positions(&[("MSFT", 3.0)]));
        assert_eq!(risk.total_equity(), 30.0);
    }
}
