//! Bar & trade-direction value types (C1).
//!
//! Grounded on `original_source/engine/models/bar.py`: a single OHLCV
//! observation, validated on construction, immutable afterwards. The
//! reference's `OhlcData` (struct-of-vectors over two instruments) is not
//! carried forward — this spec is single-instrument — but its
//! "vectors aligned by index" shape reappears as [`OhlcSeries`] and as the
//! column store in `indicators.rs`.

use crate::error::EngineError;

/// Position / signal direction. Long or short, no flat state — a flat
/// market is simply "no open position" at the engine level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

/// A single OHLCV observation at one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Bar direction tag: -1 (down), 0 (flat), 1 (up). Informational only —
    /// the engine itself never reads it.
    pub direction: i8,
}

impl Bar {
    pub fn new(
        timestamp: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        direction: i8,
    ) -> Result<Self, EngineError> {
        if timestamp < 0 {
            return Err(EngineError::InvalidInput(format!(
                "timestamp must be >= 0, got {timestamp}"
            )));
        }
        if low > high {
            return Err(EngineError::InvalidInput(format!(
                "low ({low}) must be <= high ({high})"
            )));
        }
        if !(low <= open && open <= high) {
            return Err(EngineError::InvalidInput(format!(
                "open ({open}) must be between low ({low}) and high ({high})"
            )));
        }
        if !(low <= close && close <= high) {
            return Err(EngineError::InvalidInput(format!(
                "close ({close}) must be between low ({low}) and high ({high})"
            )));
        }
        if volume < 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "volume must be >= 0, got {volume}"
            )));
        }
        if !matches!(direction, -1 | 0 | 1) {
            return Err(EngineError::InvalidInput(format!(
                "direction must be -1, 0 or 1, got {direction}"
            )));
        }
        Ok(Bar {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            direction,
        })
    }
}

/// An ordered, strictly-ascending, duplicate-free bar sequence.
///
/// Immutable once constructed — the engine borrows it for the duration of
/// one run and never mutates it.
#[derive(Debug, Clone)]
pub struct OhlcSeries {
    bars: Vec<Bar>,
}

impl OhlcSeries {
    pub fn new(bars: Vec<Bar>) -> Result<Self, EngineError> {
        if bars.is_empty() {
            return Err(EngineError::InvalidInput("bars must not be empty".into()));
        }
        for w in bars.windows(2) {
            if w[0].timestamp >= w[1].timestamp {
                return Err(EngineError::InvalidInput(format!(
                    "bars must be strictly ascending by timestamp (index {}: {} >= index {}: {})",
                    0, w[0].timestamp, 1, w[1].timestamp
                )));
            }
        }
        Ok(OhlcSeries { bars })
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn get(&self, index: usize) -> &Bar {
        &self.bars[index]
    }

    pub fn as_slice(&self) -> &[Bar] {
        &self.bars
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bar> {
        self.bars.iter()
    }

    pub fn timestamp_index(&self) -> std::collections::HashMap<i64, usize> {
        self.bars
            .iter()
            .enumerate()
            .map(|(i, b)| (b.timestamp, i))
            .collect()
    }
}
