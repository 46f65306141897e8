use std::time::Duration;

use anyhow::{bail, ensure, Result};

use crate::bus::BusConfig;
use crate::exec::{CommissionModel, FlatCommission, ProportionalCommission};
use crate::sizing::{FixedNotional, FixedQuantity, SizingPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingKind {
    Fixed,
    Notional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissionKind {
    Flat,
    Bps,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Total equity above which the risk manager warns. `f64::MAX` disables it.
    pub equity_limit: f64,
    pub sizing: SizingKind,
    pub order_qty: f64,
    pub order_notional: f64,
    pub commission: CommissionKind,
    pub commission_flat: f64,
    pub commission_bps: f64,
    pub short_window: usize,
    pub long_window: usize,
    pub bus_tick_ms: u64,
    pub bus_stop_timeout_ms: u64,
    pub feed_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            equity_limit: f64::MAX,
            sizing: SizingKind::Fixed,
            order_qty: 100.0,
            order_notional: 10_000.0,
            commission: CommissionKind::Flat,
            commission_flat: 5.0,
            commission_bps: 1.0,
            short_window: 5,
            long_window: 10,
            bus_tick_ms: 100,
            bus_stop_timeout_ms: 2_000,
            feed_interval_ms: 100,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            equity_limit: std::env::var("EQUITY_LIMIT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.equity_limit),
            sizing: match std::env::var("SIZING").as_deref() {
                Ok("notional") => SizingKind::Notional,
                _ => SizingKind::Fixed,
            },
            order_qty: std::env::var("ORDER_QTY").ok().and_then(|v| v.parse().ok()).unwrap_or(d.order_qty),
            order_notional: std::env::var("ORDER_NOTIONAL").ok().and_then(|v| v.parse().ok()).unwrap_or(d.order_notional),
            commission: match std::env::var("COMMISSION").as_deref() {
                Ok("bps") => CommissionKind::Bps,
                _ => CommissionKind::Flat,
            },
            commission_flat: std::env::var("COMMISSION_FLAT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.commission_flat),
            commission_bps: std::env::var("COMMISSION_BPS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.commission_bps),
            short_window: std::env::var("SHORT_WINDOW").ok().and_then(|v| v.parse().ok()).unwrap_or(d.short_window),
            long_window: std::env::var("LONG_WINDOW").ok().and_then(|v| v.parse().ok()).unwrap_or(d.long_window),
            bus_tick_ms: std::env::var("BUS_TICK_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.bus_tick_ms),
            bus_stop_timeout_ms: std::env::var("BUS_STOP_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.bus_stop_timeout_ms),
            feed_interval_ms: std::env::var("FEED_INTERVAL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.feed_interval_ms),
        }
    }

    /// Reject settings that cannot produce a working pipeline. Run before the bus starts.
    pub fn validate(&self) -> Result<()> {
        // NaN fails this comparison too.
        ensure!(self.equity_limit > 0.0, "equity_limit must be positive, got {}", self.equity_limit);
        ensure!(self.order_qty > 0.0, "order_qty must be positive, got {}", self.order_qty);
        ensure!(self.order_notional > 0.0, "order_notional must be positive, got {}", self.order_notional);
        ensure!(self.commission_flat >= 0.0, "commission_flat must be >= 0, got {}", self.commission_flat);
        ensure!(self.commission_bps >= 0.0, "commission_bps must be >= 0, got {}", self.commission_bps);
        if self.short_window == 0 || self.long_window == 0 {
            bail!("strategy windows must be positive (short={}, long={})", self.short_window, self.long_window);
        }
        ensure!(
            self.short_window < self.long_window,
            "short_window ({}) must be below long_window ({})",
            self.short_window,
            self.long_window
        );
        ensure!(self.bus_tick_ms > 0, "bus_tick_ms must be positive");
        ensure!(self.bus_stop_timeout_ms > 0, "bus_stop_timeout_ms must be positive");
        Ok(())
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            tick: Duration::from_millis(self.bus_tick_ms),
            stop_timeout: Duration::from_millis(self.bus_stop_timeout_ms),
        }
    }

    pub fn feed_interval(&self) -> Duration {
        Duration::from_millis(self.feed_interval_ms)
    }

    pub fn sizing_policy(&self) -> Box<dyn SizingPolicy> {
        match self.sizing {
            SizingKind::Fixed => Box::new(FixedQuantity(self.order_qty)),
            SizingKind::Notional => Box::new(FixedNotional(self.order_notional)),
        }
    }

    pub fn commission_model(&self) -> Box<dyn CommissionModel> {
        match self.commission {
            CommissionKind::Flat => Box::new(FlatCommission(self.commission_flat)),
            CommissionKind::Bps => Box::new(ProportionalCommission::from_bps(self.commission_bps)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.order_qty, 100.0);
        assert_eq!(cfg.equity_limit, f64::MAX);
    }

    #[test]
    fn test_rejects_zero_window() {
        let cfg = Config { short_window: 0, ..Config::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_windows() {
        let cfg = Config { short_window: 20, long_window: 10, ..Config::default() };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("short_window"), "{}", err);
    }

    #[test]
    fn test_rejects_non_positive_limit_and_qty() {
        assert!(Config { equity_limit: 0.0, ..Config::default() }.validate().is_err());
        assert!(Config { equity_limit: f64::NAN, ..Config::default() }.validate().is_err());
        assert!(Config { order_qty: -1.0, ..Config::default() }.validate().is_err());
        assert!(Config { commission_flat: -0.5, ..Config::default() }.validate().is_err());
    }

    #[test]
    fn test_builds_configured_policies() {
        let cfg = Config {
            sizing: SizingKind::Notional,
            order_notional: 1_500.0,
            commission: CommissionKind::Bps,
            commission_bps: 10.0,
            ..Config::default()
        };
        assert_eq!(cfg.sizing_policy().quantity("AAPL", 150.0), 10.0);
        let fee = cfg.commission_model().commission(10.0, 150.0);
        assert!((fee - 1.5).abs() < 1e-9);
    }
}
