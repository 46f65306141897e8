//! Historical bar loading for the replay feed.
//!
//! Expected layout: a header row whose first column is the bar's timestamp
//! label, followed by any of `open,high,low,close,volume` (case-insensitive,
//! any order). Only `close` is required; missing price columns fall back to
//! the close and a missing volume reads as zero.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn from_close(ts: impl Into<String>, close: f64) -> Self {
        Self { ts: ts.into(), open: close, high: close, low: close, close, volume: 0.0 }
    }
}

#[derive(Debug, Clone, Copy)]
struct Columns {
    open: Option<usize>,
    high: Option<usize>,
    low: Option<usize>,
    close: usize,
    volume: Option<usize>,
}

impl Columns {
    fn from_header(header: &str) -> Result<Self> {
        let names: Vec<String> = header.split(',').map(|s| s.trim().to_lowercase()).collect();
        let find = |name: &str| names.iter().skip(1).position(|n| n == name).map(|i| i + 1);
        Ok(Self {
            open: find("open"),
            high: find("high"),
            low: find("low"),
            close: find("close").ok_or_else(|| anyhow!("header has no close column: {}", header))?,
            volume: find("volume"),
        })
    }
}

fn field(parts: &[&str], idx: usize, name: &str) -> Result<f64> {
    let raw = parts.get(idx).ok_or_else(|| anyhow!("missing {} column", name))?;
    raw.trim().parse().with_context(|| format!("bad {} value {:?}", name, raw.trim()))
}

/// Parse one data row against a resolved header.
fn parse_row(line: &str, cols: &Columns) -> Result<Bar> {
    let parts: Vec<&str> = line.split(',').collect();
    let close = field(&parts, cols.close, "close")?;
    let optional = |idx: Option<usize>, name: &str, fallback: f64| match idx {
        Some(i) => field(&parts, i, name),
        None => Ok(fallback),
    };
    Ok(Bar {
        ts: parts.first().map(|s| s.trim().to_string()).unwrap_or_default(),
        open: optional(cols.open, "open", close)?,
        high: optional(cols.high, "high", close)?,
        low: optional(cols.low, "low", close)?,
        close,
        volume: optional(cols.volume, "volume", 0.0)?,
    })
}

pub fn parse_bars<R: BufRead>(reader: R) -> Result<Vec<Bar>> {
    let mut cols: Option<Columns> = None;
    let mut bars = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match &cols {
            None => cols = Some(Columns::from_header(trimmed)?),
            Some(c) => {
                let bar = parse_row(trimmed, c).with_context(|| format!("line {}", idx + 1))?;
                bars.push(bar);
            }
        }
    }
    if cols.is_none() {
        bail!("no header row found");
    }
    Ok(bars)
}

pub fn load_bars_csv(path: &Path) -> Result<Vec<Bar>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    parse_bars(BufReader::new(file)).with_context(|| format!("parsing {}", path.display()))
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
