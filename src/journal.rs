use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::EventBus;
use crate::events::{Event, EventKind, FillEvent, OrderEvent};

#[derive(Debug, Clone, Default)]
pub struct JournalEntries {
    pub orders: Vec<OrderEvent>,
    pub fills: Vec<FillEvent>,
}

impl JournalEntries {
    pub fn total_commission(&self) -> f64 {
        self.fills.iter().map(|f| f.commission).sum()
    }
}

/// In-memory record of every Order and Fill seen on the bus.
pub struct TradeJournal {
    entries: Arc<Mutex<JournalEntries>>,
}

impl TradeJournal {
    pub fn attach(bus: &EventBus) -> Self {
        let entries = Arc::new(Mutex::new(JournalEntries::default()));

        let e = Arc::clone(&entries);
        bus.subscribe(EventKind::Order, "journal.on_order", move |event| {
            if let Event::Order(order) = event {
                e.lock().unwrap_or_else(PoisonError::into_inner).orders.push(order.clone());
            }
            Ok(())
        });

        let e = Arc::clone(&entries);
        bus.subscribe(EventKind::Fill, "journal.on_fill", move |event| {
            if let Event::Fill(fill) = event {
                e.lock().unwrap_or_else(PoisonError::into_inner).fills.push(fill.clone());
            }
            Ok(())
        });

        Self { entries }
    }

    pub fn orders(&self) -> Vec<OrderEvent> {
        self.lock().orders.clone()
    }

    pub fn fills(&self) -> Vec<FillEvent> {
        self.lock().fills.clone()
    }

    pub fn snapshot(&self) -> JournalEntries {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, JournalEntries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Direction, OrderType};

    #[test]
    fn test_total_commission_sums_fills() {
        let fill = |commission| FillEvent {
            ticker: "AAPL".to_string(),
            quantity: 1.0,
            direction: Direction::Buy,
            fill_price: 10.0,
            commission,
        };
        let entries = JournalEntries { orders: Vec::new(), fills: vec![fill(5.0), fill(2.5)] };
        assert_eq!(entries.total_commission(), 7.5);
    }

    #[test]
    fn test_records_published_orders() {
        let bus = EventBus::default();
        let journal = TradeJournal::attach(&bus);
        assert_eq!(bus.handler_count(EventKind::Order), 1);
        assert_eq!(bus.handler_count(EventKind::Fill), 1);

        bus.publish(OrderEvent {
            ticker: "AAPL".to_string(),
            order_type: OrderType::Market,
            quantity: 100.0,
            direction: Direction::Buy,
        })
        .unwrap();
        bus.start().unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while journal.orders().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        bus.stop().unwrap();
        assert_eq!(journal.orders().len(), 1);
        assert!(journal.fills().is_empty());
    }
}
