//! Event-driven simulated trading.
//!
//! Market data enters through a [`feed`], fans out over the [`bus`] to the
//! [`strategy`] engine, and the resulting signals flow through [`exec`],
//! [`position`] and [`risk`]. [`pipeline::Pipeline`] wires the full loop.

pub mod bus;
pub mod config;
pub mod data;
pub mod events;
pub mod exec;
pub mod feed;
pub mod indicators;
pub mod journal;
pub mod logging;
pub mod pipeline;
pub mod position;
pub mod risk;
pub mod sizing;
pub mod strategies;
pub mod strategy;
