//! Structured JSON-lines logging for the event pipeline.
//!
//! Every record is a single JSON object on stdout. Filtering:
//! - `LOG_LEVEL`: minimum level (`trace` .. `fatal`, default `info`)
//! - `LOG_DOMAINS`: comma-separated domains or `all`
//! - `LOG_DIR`: when set, records are also appended under `<LOG_DIR>/<run_id>/`

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::events::{Direction, Positions};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Bus,      // Dispatch loop lifecycle, handler failures
    Market,   // Bars, feed lifecycle
    Strategy, // Signal generation
    Exec,     // Orders and simulated fills
    Position, // Position snapshots
    Risk,     // Equity checks, limit breaches
    System,   // Startup, shutdown, summaries
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Bus => "bus",
            Domain::Market => "market",
            Domain::Strategy => "strategy",
            Domain::Exec => "exec",
            Domain::Position => "position",
            Domain::Risk => "risk",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();
// In-memory sink; `None` until `capture_records()` turns it on.
static CAPTURED: Mutex<Option<Vec<Value>>> = Mutex::new(None);

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct FileSinks {
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    sinks: Option<FileSinks>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let sinks = std::env::var("LOG_DIR")
            .ok()
            .and_then(|base| open_sinks(PathBuf::from(base).join(&run_id)));
        RunContext { run_id, sinks }
    })
}

fn open_sinks(run_dir: PathBuf) -> Option<FileSinks> {
    if let Err(err) = create_dir_all(&run_dir) {
        eprintln!("[log] failed to create run dir {}: {}", run_dir.display(), err);
        return None;
    }
    let open = |name: &str| match File::create(run_dir.join(name)) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", name, err);
            None
        }
    };
    Some(FileSinks {
        events: open("events.jsonl")?,
        trace: open("trace.jsonl")?,
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["ticker", "handler", "kind", "strategy_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let record = Value::Object(entry);
    if let Ok(mut captured) = CAPTURED.lock() {
        if let Some(records) = captured.as_mut() {
            records.push(record.clone());
        }
    }
    let line = record.to_string();
    if let Some(sinks) = &ctx.sinks {
        match level {
            Level::Trace | Level::Debug => write_line(&sinks.trace, &line),
            _ => write_line(&sinks.events, &line),
        }
    }
    println!("{}", line);
}

/// Keep a copy of every emitted record in memory from now on, for callers
/// that inspect their own log output. Idempotent.
pub fn capture_records() {
    let mut captured = CAPTURED.lock().unwrap_or_else(PoisonError::into_inner);
    captured.get_or_insert_with(Vec::new);
}

/// Records emitted since `capture_records()`, in emission order.
pub fn captured_records() -> Vec<Value> {
    let captured = CAPTURED.lock().unwrap_or_else(PoisonError::into_inner);
    captured.clone().unwrap_or_default()
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_market(ticker: &str, price: f64) {
    log(
        Level::Trace,
        Domain::Market,
        "bar",
        obj(&[("ticker", v_str(ticker)), ("price", v_num(price))]),
    );
}

pub fn log_signal(strategy_id: &str, ticker: &str, action: Direction, price: f64) {
    log(
        Level::Info,
        Domain::Strategy,
        "signal",
        obj(&[
            ("strategy_id", v_str(strategy_id)),
            ("ticker", v_str(ticker)),
            ("action", v_str(action.as_str())),
            ("price", v_num(price)),
        ]),
    );
}

pub fn log_order(ticker: &str, order_type: &str, direction: Direction, quantity: f64) {
    log(
        Level::Info,
        Domain::Exec,
        "order",
        obj(&[
            ("ticker", v_str(ticker)),
            ("order_type", v_str(order_type)),
            ("direction", v_str(direction.as_str())),
            ("qty", v_num(quantity)),
        ]),
    );
}

pub fn log_fill(ticker: &str, direction: Direction, quantity: f64, price: f64, commission: f64) {
    log(
        Level::Info,
        Domain::Exec,
        "fill",
        obj(&[
            ("ticker", v_str(ticker)),
            ("direction", v_str(direction.as_str())),
            ("qty", v_num(quantity)),
            ("price", v_num(price)),
            ("commission", v_num(commission)),
        ]),
    );
}

pub fn log_position(ticker: &str, quantity: f64, positions: &Positions) {
    log(
        Level::Info,
        Domain::Position,
        "position_update",
        obj(&[
            ("ticker", v_str(ticker)),
            ("qty", v_num(quantity)),
            ("snapshot", json!(positions)),
        ]),
    );
}

pub fn log_risk_check(equity: f64, limit: f64, breached: bool) {
    log(
        Level::Debug,
        Domain::Risk,
        "equity_check",
        obj(&[
            ("equity", v_num(equity)),
            ("limit", v_num(limit)),
            ("breached", Value::Bool(breached)),
        ]),
    );
}

pub fn log_risk_breach(equity: f64, limit: f64) {
    log(
        Level::Warn,
        Domain::Risk,
        "equity_limit_breached",
        obj(&[
            ("msg", v_str("total equity exceeds configured limit")),
            ("equity", v_num(equity)),
            ("limit", v_num(limit)),
        ]),
    );
}

pub fn log_handler_failure(kind: &str, handler: &str, ticker: Option<&str>, error: &str) {
    let mut fields = obj(&[
        ("kind", v_str(kind)),
        ("handler", v_str(handler)),
        ("error", v_str(error)),
    ]);
    if let Some(ticker) = ticker {
        fields.insert("ticker".to_string(), v_str(ticker));
    }
    log(Level::Error, Domain::Bus, "handler_failed", fields);
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_split_promotes_correlation_keys() {
        let (top, data) = split_fields(obj(&[
            ("ticker", v_str("AAPL")),
            ("handler", v_str("risk.on_position")),
            ("equity", v_num(1.0)),
        ]));
        assert_eq!(top.get("ticker").unwrap(), "AAPL");
        assert_eq!(top.get("handler").unwrap(), "risk.on_position");
        assert!(data.contains_key("equity"));
        assert!(!data.contains_key("ticker"));
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }

    #[test]
    fn test_capture_keeps_emitted_records() {
        capture_records();
        log_risk_breach(2_000.0, 1_234.5);
        let found: Vec<Value> = captured_records()
            .into_iter()
            .filter(|r| r["event"] == "equity_limit_breached" && r["data"]["limit"] == 1_234.5)
            .collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["lvl"], "WARN");
        assert_eq!(found[0]["component"], "risk");
    }
}
