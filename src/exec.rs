//! Simulated broker: every Signal becomes one Order followed by one Fill.
//!
//! Fills happen at the signal's price. There is no slippage, latency,
//! partial fill or rejection model.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Result};

use crate::bus::EventBus;
use crate::events::{Event, EventKind, FillEvent, OrderEvent, OrderType, SignalEvent};
use crate::logging::{log_fill, log_order};
use crate::sizing::{FixedQuantity, SizingPolicy};

pub trait CommissionModel: Send {
    fn commission(&self, quantity: f64, price: f64) -> f64;
}

impl<F> CommissionModel for F
where
    F: Fn(f64, f64) -> f64 + Send,
{
    fn commission(&self, quantity: f64, price: f64) -> f64 {
        self(quantity, price)
    }
}

/// Fixed fee per fill (default: 5.0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatCommission(pub f64);

impl Default for FlatCommission {
    fn default() -> Self {
        Self(5.0)
    }
}

impl CommissionModel for FlatCommission {
    fn commission(&self, _quantity: f64, _price: f64) -> f64 {
        self.0
    }
}

/// Fee as a fraction of traded notional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProportionalCommission {
    pub rate: f64,
}

impl ProportionalCommission {
    pub fn from_bps(bps: f64) -> Self {
        Self { rate: bps / 10_000.0 }
    }
}

impl CommissionModel for ProportionalCommission {
    fn commission(&self, quantity: f64, price: f64) -> f64 {
        quantity.abs() * price * self.rate
    }
}

pub struct SimulatedBroker {
    sizing: Box<dyn SizingPolicy>,
    commission: Box<dyn CommissionModel>,
}

impl SimulatedBroker {
    pub fn new(sizing: Box<dyn SizingPolicy>, commission: Box<dyn CommissionModel>) -> Self {
        Self { sizing, commission }
    }

    pub fn execute(&self, signal: &SignalEvent) -> Result<(OrderEvent, FillEvent)> {
        let quantity = self.sizing.quantity(&signal.ticker, signal.price);
        ensure!(
            quantity.is_finite() && quantity > 0.0,
            "sizing produced unusable quantity {} for {} at {}",
            quantity,
            signal.ticker,
            signal.price
        );
        let order = OrderEvent {
            ticker: signal.ticker.clone(),
            order_type: OrderType::Market,
            quantity,
            direction: signal.action,
        };
        let fill = FillEvent {
            ticker: signal.ticker.clone(),
            quantity,
            direction: signal.action,
            fill_price: signal.price,
            commission: self.commission.commission(quantity, signal.price),
        };
        Ok((order, fill))
    }
}

impl Default for SimulatedBroker {
    fn default() -> Self {
        Self::new(Box::new(FixedQuantity::default()), Box::new(FlatCommission::default()))
    }
}

/// Turns Signal events into Order and Fill events on the bus.
pub struct ExecutionHandler {
    fills: Arc<AtomicU64>,
}

impl ExecutionHandler {
    pub fn attach(bus: &EventBus, broker: SimulatedBroker) -> Self {
        let fills = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fills);
        let publisher = bus.publisher();
        bus.subscribe(EventKind::Signal, "execution.on_signal", move |event| {
            let Event::Signal(signal) = event else {
                return Ok(());
            };
            let (order, fill) = broker.execute(signal)?;
            log_order(&order.ticker, order.order_type.as_str(), order.direction, order.quantity);
            publisher.publish(order)?;
            log_fill(&fill.ticker, fill.direction, fill.quantity, fill.fill_price, fill.commission);
            publisher.publish(fill)?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        Self { fills }
    }

    /// Number of signals fully executed so far.
    pub fn fills(&self) -> u64 {
        self.fills.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Direction;
    use crate::sizing::FixedNotional;

    fn signal(action: Direction, price: f64) -> SignalEvent {
        SignalEvent { ticker: "AAPL".to_string(), action, price }
    }

    #[test]
    fn test_default_broker_fills_at_signal_price() {
        let (order, fill) = SimulatedBroker::default().execute(&signal(Direction::Buy, 150.0)).unwrap();
        assert_eq!(order.order_type, OrderType::Market);
        assert_eq!(order.quantity, 100.0);
        assert_eq!(order.direction, Direction::Buy);
        assert_eq!(fill.quantity, 100.0);
        assert_eq!(fill.fill_price, 150.0);
        assert_eq!(fill.commission, 5.0);
    }

    #[test]
    fn test_sell_keeps_direction() {
        let (order, fill) = SimulatedBroker::default().execute(&signal(Direction::Sell, 10.0)).unwrap();
        assert_eq!(order.direction, Direction::Sell);
        assert_eq!(fill.signed_quantity(), -100.0);
    }

    #[test]
    fn test_proportional_commission() {
        let broker = SimulatedBroker::new(
            Box::new(FixedQuantity(10.0)),
            Box::new(ProportionalCommission::from_bps(10.0)),
        );
        let (_, fill) = broker.execute(&signal(Direction::Buy, 200.0)).unwrap();
        assert!((fill.commission - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_quantity_is_rejected() {
        let broker = SimulatedBroker::new(Box::new(FixedNotional(100.0)), Box::new(FlatCommission(0.0)));
        assert!(broker.execute(&signal(Direction::Buy, 150.0)).is_err());
    }
}
