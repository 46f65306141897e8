//! Paper-trade session: replay CSV bars (or a seeded random walk) through
//! the full pipeline and log a summary when the feed runs dry.
//!
//! Usage: paper_trade [CSV_PATH TICKER]...
//! With no arguments a random walk for `WALK_TICKER` (default AAPL) is used.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde_json::json;

use autotrader::config::Config;
use autotrader::feed::{BarHistory, Feed, MarketFeed, RandomWalk, ReplaySource};
use autotrader::logging::{log, obj, v_str, Domain, Level};
use autotrader::pipeline::Pipeline;
use autotrader::strategies::MovingAverageCrossover;
use autotrader::strategy::Strategy;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn wait_for_drain(pipeline: &Pipeline, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pipeline.bus().is_drained() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    pipeline.bus().is_drained()
}

fn run_feed<F: MarketFeed>(mut feed: F, pipeline: &Pipeline, cfg: &Config) -> Result<()> {
    pipeline.start()?;
    feed.start()?;
    while feed.is_running() {
        thread::sleep(Duration::from_millis(50));
    }
    feed.stop()?;
    if !wait_for_drain(pipeline, cfg.bus_config().stop_timeout) {
        log(
            Level::Warn,
            Domain::System,
            "drain_timeout",
            obj(&[("msg", v_str("stopping with events still queued"))]),
        );
    }
    pipeline.stop()
}

fn main() -> Result<()> {
    let cfg = Config::from_env();
    let strategies: Vec<Box<dyn Strategy>> =
        vec![Box::new(MovingAverageCrossover::new(cfg.short_window, cfg.long_window)?)];
    let pipeline = Pipeline::new(&cfg, strategies)?;
    let history = BarHistory::new();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() % 2 != 0 {
        bail!("usage: paper_trade [CSV_PATH TICKER]...");
    }

    if args.is_empty() {
        let ticker: String = env_or("WALK_TICKER", "AAPL".to_string());
        let walk = RandomWalk::new(
            ticker,
            env_or("WALK_START", 100.0),
            env_or("WALK_VOL", 0.01),
            env_or("SEED", 42),
        )?
        .with_limit(env_or("WALK_BARS", 200));
        let feed = Feed::new("random_walk", walk, pipeline.publisher(), history.clone(), cfg.feed_interval());
        run_feed(feed, &pipeline, &cfg)?;
    } else {
        let files: Vec<(&str, &str)> = args.chunks(2).map(|p| (p[0].as_str(), p[1].as_str())).collect();
        let source = ReplaySource::from_csv(&files).context("loading replay data")?;
        let feed = Feed::new("replay", source, pipeline.publisher(), history.clone(), cfg.feed_interval());
        run_feed(feed, &pipeline, &cfg)?;
    }

    let summary = pipeline.summary();
    let mut fields = obj(&[("tickers", json!(history.tickers()))]);
    if let serde_json::Value::Object(map) = serde_json::to_value(&summary)? {
        fields.extend(map);
    }
    log(Level::Info, Domain::System, "session_summary", fields);
    Ok(())
}
