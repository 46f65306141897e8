//! Incremental indicators over a price stream.

use std::collections::VecDeque;

/// Rolling mean that only reports a value once its window is full.
#[derive(Debug, Clone)]
pub struct Sma {
    prices: VecDeque<f64>,
    window: usize,
    total: f64,
}

impl Sma {
    pub fn new(window: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(window + 1),
            window,
            total: 0.0,
        }
    }

    /// Push a price and return the mean over the last `window` prices, or
    /// `None` while fewer than `window` have been seen.
    pub fn update(&mut self, price: f64) -> Option<f64> {
        self.prices.push_back(price);
        self.total += price;
        while self.prices.len() > self.window {
            if let Some(old) = self.prices.pop_front() {
                self.total -= old;
            }
        }
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.window == 0 || self.prices.len() < self.window {
            return None;
        }
        Some(self.total / self.window as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_until_window_full() {
        let mut sma = Sma::new(3);
        assert_eq!(sma.update(1.0), None);
        assert_eq!(sma.update(2.0), None);
        assert_eq!(sma.update(3.0), Some(2.0));
        assert_eq!(sma.value(), Some(2.0));
    }

    #[test]
    fn test_oldest_price_drops_out() {
        let mut sma = Sma::new(2);
        sma.update(1.0);
        sma.update(3.0);
        assert_eq!(sma.update(5.0), Some(4.0));
    }

    #[test]
    fn test_zero_window_never_reports() {
        let mut sma = Sma::new(0);
        assert_eq!(sma.update(1.0), None);
    }
}
