//! Wires one bus to the full market -> signal -> order -> fill -> position
//! -> risk loop.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::bus::{DispatchStats, EventBus, Publisher};
use crate::config::Config;
use crate::events::Positions;
use crate::exec::{ExecutionHandler, SimulatedBroker};
use crate::journal::TradeJournal;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::position::PositionManager;
use crate::risk::RiskManager;
use crate::strategy::{Strategy, StrategyEngine};

/// End-of-run view of a pipeline, suitable for logging as one record.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub dispatch: DispatchStats,
    pub signals: u64,
    pub fills: u64,
    pub total_commission: f64,
    pub positions: Positions,
    pub last_equity: Option<f64>,
    pub risk_breaches: usize,
}

pub struct Pipeline {
    bus: EventBus,
    risk: RiskManager,
    strategies: StrategyEngine,
    execution: ExecutionHandler,
    positions: PositionManager,
    journal: TradeJournal,
}

impl Pipeline {
    /// Validate `config` and subscribe every component. The bus is not
    /// started; events published before `start()` wait in the queue.
    pub fn new(config: &Config, strategies: Vec<Box<dyn Strategy>>) -> Result<Self> {
        config.validate().context("invalid pipeline config")?;
        let bus = EventBus::new(config.bus_config());

        let risk = RiskManager::attach(&bus, config.equity_limit);
        let strategy_count = strategies.len();
        let strategies = StrategyEngine::attach(&bus, strategies);
        let broker = SimulatedBroker::new(config.sizing_policy(), config.commission_model());
        let execution = ExecutionHandler::attach(&bus, broker);
        let positions = PositionManager::attach(&bus);
        let journal = TradeJournal::attach(&bus);

        log(
            Level::Info,
            Domain::System,
            "pipeline_built",
            obj(&[
                ("strategies", v_num(strategy_count as f64)),
                ("equity_limit", v_num(config.equity_limit)),
            ]),
        );
        Ok(Self { bus, risk, strategies, execution, positions, journal })
    }

    pub fn start(&self) -> Result<()> {
        self.bus.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.bus.stop()
    }

    pub fn is_running(&self) -> bool {
        self.bus.is_running()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Handle for producers; see [`crate::feed`].
    pub fn publisher(&self) -> Publisher {
        self.bus.publisher()
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn strategy_engine(&self) -> &StrategyEngine {
        &self.strategies
    }

    pub fn execution(&self) -> &ExecutionHandler {
        &self.execution
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn journal(&self) -> &TradeJournal {
        &self.journal
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            dispatch: self.bus.stats(),
            signals: self.strategies.signals(),
            fills: self.execution.fills(),
            total_commission: self.journal.snapshot().total_commission(),
            positions: self.positions.positions(),
            last_equity: self.risk.last_equity(),
            risk_breaches: self.risk.breach_count(),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(err) = self.bus.stop() {
            log(
                Level::Error,
                Domain::System,
                "pipeline_stop_failed",
                obj(&[("error", v_str(&format!("{:#}", err)))]),
            );
        }
    }
}
