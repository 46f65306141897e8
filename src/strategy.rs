use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bus::EventBus;
use crate::events::{Event, EventKind, MarketEvent, SignalEvent};
use crate::logging::log_signal;

/// A signal generator driven only by the Market events it is given.
///
/// `evaluate` must be deterministic for a given internal state and input so
/// that replays reproduce the same signals.
pub trait Strategy: Send {
    fn id(&self) -> &str;
    fn evaluate(&mut self, event: &MarketEvent) -> Option<SignalEvent>;
}

/// Fans each Market event out to every strategy in registration order and
/// publishes whatever they emit.
pub struct StrategyEngine {
    signals: Arc<AtomicU64>,
}

impl StrategyEngine {
    pub fn attach(bus: &EventBus, mut strategies: Vec<Box<dyn Strategy>>) -> Self {
        let signals = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&signals);
        let publisher = bus.publisher();
        bus.subscribe(EventKind::Market, "strategy_engine.on_market", move |event| {
            let Event::Market(market) = event else {
                return Ok(());
            };
            for strategy in strategies.iter_mut() {
                if let Some(signal) = strategy.evaluate(market) {
                    log_signal(strategy.id(), &signal.ticker, signal.action, signal.price);
                    publisher.publish(signal)?;
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(())
        });
        Self { signals }
    }

    /// Signals published so far.
    pub fn signals(&self) -> u64 {
        self.signals.load(Ordering::SeqCst)
    }
}
