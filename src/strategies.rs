//! Concrete strategies.
//!
//! Strategies keep whatever history they need themselves, built from the
//! Market events they receive; none of them reads the feed's bar history.

use std::collections::{HashMap, HashSet};

use anyhow::{ensure, Result};

use crate::events::{Direction, MarketEvent, SignalEvent};
use crate::indicators::Sma;
use crate::strategy::Strategy;

// =============================================================================
// Moving average crossover
// =============================================================================

#[derive(Debug, Clone)]
struct CrossoverState {
    short: Sma,
    long: Sma,
    bought: bool,
}

/// Buys once per ticker the first time SMA(short) >= SMA(long) over a full
/// long window, then stays silent for that ticker.
#[derive(Debug, Clone)]
pub struct MovingAverageCrossover {
    short_window: usize,
    long_window: usize,
    tickers: HashMap<String, CrossoverState>,
}

impl MovingAverageCrossover {
    pub fn new(short_window: usize, long_window: usize) -> Result<Self> {
        ensure!(
            short_window > 0 && long_window > 0,
            "windows must be positive (short={}, long={})",
            short_window,
            long_window
        );
        ensure!(
            short_window < long_window,
            "short window {} must be below long window {}",
            short_window,
            long_window
        );
        Ok(Self { short_window, long_window, tickers: HashMap::new() })
    }

    pub fn has_bought(&self, ticker: &str) -> bool {
        self.tickers.get(ticker).map(|s| s.bought).unwrap_or(false)
    }
}

impl Strategy for MovingAverageCrossover {
    fn id(&self) -> &str {
        "ma_crossover"
    }

    fn evaluate(&mut self, event: &MarketEvent) -> Option<SignalEvent> {
        let (short_window, long_window) = (self.short_window, self.long_window);
        let state = self.tickers.entry(event.ticker.clone()).or_insert_with(|| CrossoverState {
            short: Sma::new(short_window),
            long: Sma::new(long_window),
            bought: false,
        });
        let short = state.short.update(event.price);
        let long = state.long.update(event.price);
        if state.bought {
            return None;
        }
        match (short, long) {
            (Some(short), Some(long)) if short >= long => {
                state.bought = true;
                Some(SignalEvent {
                    ticker: event.ticker.clone(),
                    action: Direction::Buy,
                    price: event.price,
                })
            }
            _ => None,
        }
    }
}

// =============================================================================
// Buy once
// =============================================================================

/// Emits a single BUY at the first price seen for each watched ticker.
/// An empty watch list means every ticker.
#[derive(Debug, Clone, Default)]
pub struct BuyOnce {
    watch: HashSet<String>,
    done: HashSet<String>,
}

impl BuyOnce {
    pub fn new<I, S>(tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            watch: tickers.into_iter().map(Into::into).collect(),
            done: HashSet::new(),
        }
    }
}

impl Strategy for BuyOnce {
    fn id(&self) -> &str {
        "buy_once"
    }

    fn evaluate(&mut self, event: &MarketEvent) -> Option<SignalEvent> {
        if !self.watch.is_empty() && !self.watch.contains(&event.ticker) {
            return None;
        }
        if !self.done.insert(event.ticker.clone()) {
            return None;
        }
        Some(SignalEvent {
            ticker: event.ticker.clone(),
            action: Direction::Buy,
            price: event.price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ticker: &str, price: f64) -> MarketEvent {
        MarketEvent { ticker: ticker.to_string(), price }
    }

    #[test]
    fn test_crossover_rejects_bad_windows() {
        assert!(MovingAverageCrossover::new(0, 10).is_err());
        assert!(MovingAverageCrossover::new(10, 10).is_err());
        assert!(MovingAverageCrossover::new(3, 5).is_ok());
    }

    #[test]
    fn test_crossover_waits_for_full_window() {
        let mut strat = MovingAverageCrossover::new(2, 4).unwrap();
        for p in [10.0, 11.0, 12.0] {
            assert!(strat.evaluate(&bar("AAPL", p)).is_none());
        }
        let signal = strat.evaluate(&bar("AAPL", 13.0)).unwrap();
        assert_eq!(signal.action, Direction::Buy);
        assert_eq!(signal.price, 13.0);
        assert!(strat.has_bought("AAPL"));
    }

    #[test]
    fn test_crossover_needs_short_above_long() {
        let mut strat = MovingAverageCrossover::new(2, 4).unwrap();
        // Falling prices keep the short average below the long one.
        for p in [20.0, 18.0, 16.0, 14.0, 12.0] {
            assert!(strat.evaluate(&bar("AAPL", p)).is_none());
        }
        // Recovery pulls the short average back over.
        let mut fired = 0;
        for p in [20.0, 30.0, 40.0] {
            if strat.evaluate(&bar("AAPL", p)).is_some() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_crossover_tracks_tickers_independently() {
        let mut strat = MovingAverageCrossover::new(1, 2).unwrap();
        strat.evaluate(&bar("AAPL", 1.0));
        assert!(strat.evaluate(&bar("AAPL", 2.0)).is_some());
        assert!(strat.evaluate(&bar("MSFT", 5.0)).is_none());
        assert!(strat.evaluate(&bar("MSFT", 6.0)).is_some());
        assert!(strat.evaluate(&bar("AAPL", 3.0)).is_none());
    }

    #[test]
    fn test_buy_once_per_ticker() {
        let mut strat = BuyOnce::new(["AAPL"]);
        assert!(strat.evaluate(&bar("MSFT", 1.0)).is_none());
        let s = strat.evaluate(&bar("AAPL", 150.0)).unwrap();
        assert_eq!(s.price, 150.0);
        assert!(strat.evaluate(&bar("AAPL", 151.0)).is_none());
    }

    #[test]
    fn test_buy_once_empty_watch_means_all() {
        let mut strat = BuyOnce::default();
        assert!(strat.evaluate(&bar("MSFT", 1.0)).is_some());
        assert!(strat.evaluate(&bar("AAPL", 1.0)).is_some());
        assert!(strat.evaluate(&bar("AAPL", 1.0)).is_none());
    }
}
