use std::sync::{Arc, Mutex, PoisonError};

use crate::bus::EventBus;
use crate::events::{Event, EventKind, FillEvent, PositionEvent, Positions};
use crate::logging::log_position;

/// Net signed quantity per ticker, built from fills in processing order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionBook {
    positions: Positions,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fill and return the ticker's new net quantity.
    pub fn apply_fill(&mut self, fill: &FillEvent) -> f64 {
        let qty = self.positions.entry(fill.ticker.clone()).or_insert(0.0);
        *qty += fill.signed_quantity();
        *qty
    }

    /// Missing tickers read as flat.
    pub fn get(&self, ticker: &str) -> f64 {
        self.positions.get(ticker).copied().unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> Positions {
        self.positions.clone()
    }
}

/// Consumes Fill events and publishes a full Position snapshot after each.
///
/// The book is only mutated on the dispatch thread; the mutex exists so
/// callers on other threads can read it.
pub struct PositionManager {
    book: Arc<Mutex<PositionBook>>,
}

impl PositionManager {
    pub fn attach(bus: &EventBus) -> Self {
        let book = Arc::new(Mutex::new(PositionBook::new()));
        let shared = Arc::clone(&book);
        let publisher = bus.publisher();
        bus.subscribe(EventKind::Fill, "position.on_fill", move |event| {
            let Event::Fill(fill) = event else {
                return Ok(());
            };
            let snapshot = {
                let mut book = shared.lock().unwrap_or_else(PoisonError::into_inner);
                let qty = book.apply_fill(fill);
                let snapshot = book.snapshot();
                log_position(&fill.ticker, qty, &snapshot);
                snapshot
            };
            publisher.publish(PositionEvent { positions: snapshot })
        });
        Self { book }
    }

    pub fn position(&self, ticker: &str) -> f64 {
        self.lock().get(ticker)
    }

    pub fn positions(&self) -> Positions {
        self.lock().snapshot()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PositionBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
