//! Market data producers.
//!
//! A feed owns a background thread that pulls rounds of bars from a
//! [`BarSource`], appends each bar to the shared [`BarHistory`] and then
//! publishes a self-contained Market event for it. Handlers never need to
//! reach back into the history; it exists for callers outside the bus.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::bus::Publisher;
use crate::data::{file_sha256, load_bars_csv, Bar};
use crate::events::MarketEvent;
use crate::logging::{log, log_market, obj, v_num, v_str, Domain, Level};

/// Producer lifecycle as seen by the process owning the pipeline.
pub trait MarketFeed {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl BarField {
    fn read(&self, bar: &Bar) -> f64 {
        match self {
            BarField::Open => bar.open,
            BarField::High => bar.high,
            BarField::Low => bar.low,
            BarField::Close => bar.close,
            BarField::Volume => bar.volume,
        }
    }
}

impl FromStr for BarField {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(BarField::Open),
            "high" => Ok(BarField::High),
            "low" => Ok(BarField::Low),
            "close" => Ok(BarField::Close),
            "volume" => Ok(BarField::Volume),
            other => Err(anyhow!("unknown bar field: {}", other)),
        }
    }
}

/// Append-only per-ticker bar history, safe to read from any thread.
#[derive(Debug, Clone, Default)]
pub struct BarHistory {
    inner: Arc<RwLock<HashMap<String, Vec<Bar>>>>,
}

impl BarHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, ticker: &str, bar: Bar) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entry(ticker.to_string()).or_default().push(bar);
    }

    /// Up to `n` most recent values, oldest first. Unknown tickers yield
    /// an empty vector.
    pub fn latest_bars(&self, ticker: &str, field: BarField, n: usize) -> Vec<f64> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        match inner.get(ticker) {
            Some(bars) => {
                let start = bars.len().saturating_sub(n);
                bars[start..].iter().map(|b| field.read(b)).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn len(&self, ticker: &str) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.get(ticker).map(Vec::len).unwrap_or(0)
    }

    pub fn tickers(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut tickers: Vec<String> = inner.keys().cloned().collect();
        tickers.sort();
        tickers
    }
}

/// Yields one round of `(ticker, bar)` pairs per call; `None` once exhausted.
pub trait BarSource: Send + 'static {
    fn next_round(&mut self) -> Option<Vec<(String, Bar)>>;
}

// =============================================================================
// Sources
// =============================================================================

/// Replays fixed per-ticker series in lockstep, one bar per ticker per round.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    series: Vec<(String, Vec<Bar>)>,
    cursor: usize,
}

impl ReplaySource {
    pub fn new(series: Vec<(String, Vec<Bar>)>) -> Self {
        Self { series, cursor: 0 }
    }

    /// Load one CSV per ticker. Any unreadable file fails the whole load.
    pub fn from_csv<P: AsRef<Path>>(files: &[(P, &str)]) -> Result<Self> {
        let mut series = Vec::with_capacity(files.len());
        for (path, ticker) in files {
            let path: &Path = path.as_ref();
            let bars = load_bars_csv(path)?;
            let hash = file_sha256(path)?;
            log(
                Level::Info,
                Domain::Market,
                "dataset_loaded",
                obj(&[
                    ("ticker", v_str(ticker)),
                    ("path", v_str(&path.to_string_lossy())),
                    ("sha256", v_str(&hash)),
                    ("rows", json!(bars.len())),
                ]),
            );
            series.push((ticker.to_string(), bars));
        }
        Ok(Self::new(series))
    }
}

impl BarSource for ReplaySource {
    fn next_round(&mut self) -> Option<Vec<(String, Bar)>> {
        let cursor = self.cursor;
        let round: Vec<(String, Bar)> = self
            .series
            .iter()
            .filter_map(|(ticker, bars)| bars.get(cursor).map(|b| (ticker.clone(), b.clone())))
            .collect();
        if round.is_empty() {
            return None;
        }
        self.cursor += 1;
        Some(round)
    }
}

/// Seeded random walk for a single ticker.
#[derive(Debug, Clone)]
pub struct RandomWalk {
    ticker: String,
    price: f64,
    volatility: f64,
    rng: StdRng,
    emitted: usize,
    limit: Option<usize>,
}

impl RandomWalk {
    pub fn new(ticker: impl Into<String>, start_price: f64, volatility: f64, seed: u64) -> Result<Self> {
        if !(start_price > 0.0) {
            bail!("start price must be positive, got {}", start_price);
        }
        if !(0.0..1.0).contains(&volatility) {
            bail!("volatility must be in [0, 1), got {}", volatility);
        }
        Ok(Self {
            ticker: ticker.into(),
            price: start_price,
            volatility,
            rng: StdRng::seed_from_u64(seed),
            emitted: 0,
            limit: None,
        })
    }

    /// Stop after `n` bars instead of running forever.
    pub fn with_limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

impl BarSource for RandomWalk {
    fn next_round(&mut self) -> Option<Vec<(String, Bar)>> {
        if self.limit.is_some_and(|n| self.emitted >= n) {
            return None;
        }
        let step: f64 = self.rng.gen_range(-1.0_f64..=1.0) * self.volatility;
        let open = self.price;
        self.price = (self.price * (1.0 + step)).max(0.01);
        let bar = Bar {
            ts: self.emitted.to_string(),
            open,
            high: open.max(self.price),
            low: open.min(self.price),
            close: self.price,
            volume: 0.0,
        };
        self.emitted += 1;
        Some(vec![(self.ticker.clone(), bar)])
    }
}

// =============================================================================
// Feed thread
// =============================================================================

struct Worker<S> {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<S>,
}

/// Threaded producer around any [`BarSource`]. Stopping hands the source
/// back so a later `start()` resumes where it left off.
pub struct Feed<S: BarSource> {
    name: String,
    publisher: Publisher,
    history: BarHistory,
    interval: Duration,
    source: Option<S>,
    worker: Option<Worker<S>>,
    running: Arc<AtomicBool>,
}

pub type ReplayFeed = Feed<ReplaySource>;
pub type RandomWalkFeed = Feed<RandomWalk>;

impl<S: BarSource> Feed<S> {
    pub fn new(
        name: impl Into<String>,
        source: S,
        publisher: Publisher,
        history: BarHistory,
        interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            publisher,
            history,
            interval,
            source: Some(source),
            worker: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn history(&self) -> &BarHistory {
        &self.history
    }

    fn reap(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let source = worker
                .handle
                .join()
                .map_err(|_| anyhow!("feed thread {} panicked", self.name))?;
            self.source = Some(source);
        }
        Ok(())
    }
}

impl<S: BarSource> MarketFeed for Feed<S> {
    fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        // An exhausted thread may still be parked here.
        self.reap()?;
        let mut source = self
            .source
            .take()
            .ok_or_else(|| anyhow!("feed {} lost its source", self.name))?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let publisher = self.publisher.clone();
        let history = self.history.clone();
        let running = Arc::clone(&self.running);
        let interval = self.interval;
        let name = self.name.clone();

        running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name(format!("feed-{}", self.name))
            .spawn(move || {
                let mut bars = 0u64;
                loop {
                    let Some(round) = source.next_round() else {
                        log(
                            Level::Info,
                            Domain::Market,
                            "feed_exhausted",
                            obj(&[("feed", v_str(&name)), ("bars", json!(bars))]),
                        );
                        break;
                    };
                    for (ticker, bar) in round {
                        let price = bar.close;
                        history.append(&ticker, bar);
                        log_market(&ticker, price);
                        if let Err(err) = publisher.publish(MarketEvent { ticker, price }) {
                            log(
                                Level::Error,
                                Domain::Market,
                                "feed_publish_failed",
                                obj(&[("feed", v_str(&name)), ("error", v_str(&format!("{:#}", err)))]),
                            );
                            running.store(false, Ordering::SeqCst);
                            return source;
                        }
                        bars += 1;
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                running.store(false, Ordering::SeqCst);
                source
            });

        let handle = match handle {
            Ok(h) => h,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(err).with_context(|| format!("spawning feed thread {}", self.name));
            }
        };
        self.worker = Some(Worker { stop_tx, handle });
        log(
            Level::Info,
            Domain::Market,
            "feed_started",
            obj(&[("feed", v_str(&self.name)), ("interval_ms", v_num(self.interval.as_millis() as f64))]),
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.reap()?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl<S: BarSource> Drop for Feed<S> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars(closes: &[f64]) -> Vec<Bar> {
        closes.iter().enumerate().map(|(i, c)| Bar::from_close(i.to_string(), *c)).collect()
    }

    #[test]
    fn test_latest_bars_returns_tail() {
        let history = BarHistory::new();
        for (i, c) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            history.append("AAPL", Bar::from_close(i.to_string(), *c));
        }
        assert_eq!(history.latest_bars("AAPL", BarField::Close, 2), vec![3.0, 4.0]);
        assert_eq!(history.latest_bars("AAPL", BarField::Close, 10).len(), 4);
        assert!(history.latest_bars("MSFT", BarField::Close, 3).is_empty());
        assert_eq!(history.len("AAPL"), 4);
    }

    #[test]
    fn test_bar_field_parse() {
        assert_eq!("Close".parse::<BarField>().unwrap(), BarField::Close);
        assert!("vwap".parse::<BarField>().is_err());
    }

    #[test]
    fn test_replay_rounds_run_in_lockstep() {
        let mut src = ReplaySource::new(vec![
            ("AAPL".to_string(), bars(&[1.0, 2.0, 3.0])),
            ("MSFT".to_string(), bars(&[10.0])),
        ]);
        let first = src.next_round().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].0, "MSFT");
        assert_eq!(src.next_round().unwrap().len(), 1);
        assert_eq!(src.next_round().unwrap()[0].1.close, 3.0);
        assert!(src.next_round().is_none());
    }

    #[test]
    fn test_random_walk_is_seeded() {
        let mut a = RandomWalk::new("AAPL", 100.0, 0.02, 7).unwrap().with_limit(20);
        let mut b = RandomWalk::new("AAPL", 100.0, 0.02, 7).unwrap().with_limit(20);
        let mut count = 0;
        while let (Some(x), Some(y)) = (a.next_round(), b.next_round()) {
            assert_eq!(x, y);
            assert!(x[0].1.close > 0.0);
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn test_random_walk_rejects_bad_params() {
        assert!(RandomWalk::new("AAPL", 0.0, 0.01, 1).is_err());
        assert!(RandomWalk::new("AAPL", 10.0, 1.5, 1).is_err());
    }
}
