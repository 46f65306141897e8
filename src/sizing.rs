//! Order sizing policies.
//!
//! All policies return a quantity in shares/units for one order.

/// Decides how many units an order for `ticker` at `price` should carry.
pub trait SizingPolicy: Send {
    fn quantity(&self, ticker: &str, price: f64) -> f64;
}

impl<F> SizingPolicy for F
where
    F: Fn(&str, f64) -> f64 + Send,
{
    fn quantity(&self, ticker: &str, price: f64) -> f64 {
        self(ticker, price)
    }
}

/// Same quantity for every order (default: 100).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedQuantity(pub f64);

impl Default for FixedQuantity {
    fn default() -> Self {
        Self(100.0)
    }
}

impl SizingPolicy for FixedQuantity {
    fn quantity(&self, _ticker: &str, _price: f64) -> f64 {
        self.0
    }
}

/// Whole units worth at most the given notional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedNotional(pub f64);

impl SizingPolicy for FixedNotional {
    fn quantity(&self, _ticker: &str, price: f64) -> f64 {
        fixed_notional(self.0, price)
    }
}

pub fn fixed_notional(notional: f64, price: f64) -> f64 {
    if price <= 0.0 || notional <= 0.0 {
        return 0.0;
    }
    (notional / price).floor()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_quantity_ignores_price() {
        let p = FixedQuantity::default();
        assert_eq!(p.quantity("AAPL", 1.0), 100.0);
        assert_eq!(p.quantity("MSFT", 9_999.0), 100.0);
    }

    #[test]
    fn test_fixed_notional_rounds_down() {
        assert_eq!(fixed_notional(1_000.0, 150.0), 6.0);
        assert_eq!(fixed_notional(1_500.0, 150.0), 10.0);
        assert_eq!(fixed_notional(1_000.0, 0.0), 0.0);
    }

    #[test]
    fn test_closure_policy() {
        let p = |ticker: &str, _price: f64| if ticker == "AAPL" { 7.0 } else { 1.0 };
        assert_eq!(p.quantity("AAPL", 10.0), 7.0);
        assert_eq!(p.quantity("GOOG", 10.0), 1.0);
    }
}
