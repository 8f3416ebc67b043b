//! Bar ingestion and hashing helpers (§6 external interfaces).
//!
//! Grounded on the teacher's `data_handler/mod.rs` CSV loading pattern
//! (header-driven `csv::Reader`, `chrono` timestamp parsing) and on
//! spec.md §6's `dt,do,dh,dl,dc,dv,dd` column convention. Hashing mirrors
//! the reference's dataset/strategy dedup keys; the engine itself never
//! calls these — they exist for a persistence layer built on top of this
//! crate.

use std::path::Path;

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};

use crate::bar::{Bar, OhlcSeries};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    dt: String,
    #[serde(rename = "do")]
    open: f64,
    dh: f64,
    dl: f64,
    dc: f64,
    dv: f64,
    dd: i8,
}

/// Loads an `OhlcSeries` from a CSV file with header
/// `dt,do,dh,dl,dc,dv,dd`. `dt` is `YYYY-MM-DD HH:MM:SS`, parsed as
/// UTC-naive and interpreted as seconds-since-epoch. Rows are sorted
/// ascending by timestamp before `OhlcSeries::new` enforces strict
/// ascent and rejects duplicates.
pub fn load_csv(path: impl AsRef<Path>) -> EngineResult<OhlcSeries> {
    let mut reader = csv::Reader::from_path(path.as_ref()).map_err(|e| {
        EngineError::InvalidInput(format!("failed to open csv '{}': {e}", path.as_ref().display()))
    })?;

    let mut bars = Vec::new();
    for result in reader.deserialize::<CsvRow>() {
        let row = result.map_err(|e| EngineError::InvalidInput(format!("csv row error: {e}")))?;
        let ts = NaiveDateTime::parse_from_str(&row.dt, "%Y-%m-%d %H:%M:%S")
            .map_err(|e| EngineError::InvalidInput(format!("invalid timestamp '{}': {e}", row.dt)))?
            .and_utc()
            .timestamp();
        let bar = Bar::new(ts, row.open, row.dh, row.dl, row.dc, row.dv, row.dd)?;
        bars.push(bar);
    }

    bars.sort_by_key(|b| b.timestamp);
    OhlcSeries::new(bars)
}

/// `SHA-256(concat of "ts,o,h,l,c,v,d|" lines in ascending ts order)`, hex.
pub fn dataset_hash(bars: &OhlcSeries) -> String {
    let mut hasher = Sha256::new();
    for bar in bars.iter() {
        let line = format!(
            "{},{},{},{},{},{},{}|",
            bar.timestamp, bar.open, bar.high, bar.low, bar.close, bar.volume, bar.direction
        );
        hasher.update(line.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// `SHA-256(canonical JSON with sorted keys, no ASCII escaping)`, hex.
/// Callers are expected to pass the strategy definition already
/// serialized with sorted map keys (e.g. via `serde_json` on a
/// `BTreeMap`-backed representation); this function hashes whatever
/// canonical bytes it is given.
pub fn strategy_hash(canonical_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::Bar;

    #[test]
    fn dataset_hash_is_stable_for_identical_series() {
        let bars = OhlcSeries::new(vec![
            Bar::new(0, 1.0, 1.0, 1.0, 1.0, 0.0, 0).unwrap(),
            Bar::new(1, 1.0, 1.0, 1.0, 1.0, 0.0, 0).unwrap(),
        ])
        .unwrap();
        assert_eq!(dataset_hash(&bars), dataset_hash(&bars));
    }

    #[test]
    fn strategy_hash_is_deterministic() {
        let json = r#"{"a":1,"b":2}"#;
        assert_eq!(strategy_hash(json), strategy_hash(json));
    }
}
