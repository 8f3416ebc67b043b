//! Leverage bracket table (C2).
//!
//! Grounded on `original_source/engine/utils/leverage_loader.py`
//! (`LeverageBracket`, `get_max_leverage_for_notional`,
//! `calculate_required_margin`): an ordered, contiguous partition of
//! notional value ranges, each mapping to an integer max leverage and a
//! maintenance-margin schedule.

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LeverageBracket {
    pub bracket_min: f64,
    pub bracket_max: f64,
    pub max_leverage: f64,
    pub maintenance_margin_rate: f64,
    pub maintenance_margin_fixed: f64,
}

/// Ordered, gap-free, overlap-free notional brackets.
#[derive(Debug, Clone)]
pub struct LeverageTable {
    brackets: Vec<LeverageBracket>,
}

impl LeverageTable {
    /// Validates ascending order, contiguity (`min_{i+1} == max_i`) and
    /// absence of overlaps before accepting the table.
    pub fn new(brackets: Vec<LeverageBracket>) -> Result<Self, EngineError> {
        if brackets.is_empty() {
            return Err(EngineError::InvalidConfig(
                "leverage table must have at least one bracket".into(),
            ));
        }
        for w in brackets.windows(2) {
            if w[0].bracket_min >= w[0].bracket_max {
                return Err(EngineError::InvalidConfig(format!(
                    "bracket_min ({}) must be < bracket_max ({})",
                    w[0].bracket_min, w[0].bracket_max
                )));
            }
            if (w[1].bracket_min - w[0].bracket_max).abs() > f64::EPSILON {
                return Err(EngineError::InvalidConfig(format!(
                    "brackets must be contiguous: bracket ending at {} is followed by one starting at {}",
                    w[0].bracket_max, w[1].bracket_min
                )));
            }
        }
        let last = brackets.last().unwrap();
        if last.bracket_min >= last.bracket_max {
            return Err(EngineError::InvalidConfig(format!(
                "bracket_min ({}) must be < bracket_max ({})",
                last.bracket_min, last.bracket_max
            )));
        }
        Ok(LeverageTable { brackets })
    }

    /// Max integer leverage for a notional value: the bracket whose
    /// `[min, max)` contains it, or the final bracket if the notional
    /// exceeds the table's range.
    pub fn max_leverage_for(&self, notional: f64) -> u32 {
        let notional = notional.abs();
        for b in &self.brackets {
            if b.bracket_min <= notional && notional < b.bracket_max {
                return b.max_leverage.floor() as u32;
            }
        }
        let last = self.brackets.last().unwrap();
        if notional >= last.bracket_max {
            return last.max_leverage.floor() as u32;
        }
        // Unreachable for a validated contiguous-from-zero table, but kept
        // as a safety net matching the Python reference's fallback.
        self.brackets
            .iter()
            .map(|b| b.max_leverage.floor() as u32)
            .min()
            .unwrap_or(1)
    }

    pub fn required_margin(&self, size: f64, price: f64, leverage: u32) -> f64 {
        if leverage == 0 {
            return (size * price).abs();
        }
        (size * price).abs() / leverage as f64
    }

    pub fn brackets(&self) -> &[LeverageBracket] {
        &self.brackets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> LeverageTable {
        LeverageTable::new(vec![
            LeverageBracket {
                bracket_min: 0.0,
                bracket_max: 10_000.0,
                max_leverage: 20.0,
                maintenance_margin_rate: 0.004,
                maintenance_margin_fixed: 0.0,
            },
            LeverageBracket {
                bracket_min: 10_000.0,
                bracket_max: 50_000.0,
                max_leverage: 10.0,
                maintenance_margin_rate: 0.005,
                maintenance_margin_fixed: 50.0,
            },
        ])
        .unwrap()
    }

    #[test]
    fn rejects_gaps() {
        let err = LeverageTable::new(vec![
            LeverageBracket {
                bracket_min: 0.0,
                bracket_max: 10_000.0,
                max_leverage: 20.0,
                maintenance_margin_rate: 0.0,
                maintenance_margin_fixed: 0.0,
            },
            LeverageBracket {
                bracket_min: 20_000.0,
                bracket_max: 50_000.0,
                max_leverage: 10.0,
                maintenance_margin_rate: 0.0,
                maintenance_margin_fixed: 0.0,
            },
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn looks_up_bracket() {
        let t = sample_table();
        assert_eq!(t.max_leverage_for(5_000.0), 20);
        assert_eq!(t.max_leverage_for(10_000.0), 10);
        assert_eq!(t.max_leverage_for(49_999.0), 10);
    }

    #[test]
    fn uses_final_bracket_beyond_range() {
        let t = sample_table();
        assert_eq!(t.max_leverage_for(1_000_000.0), 10);
    }

    #[test]
    fn required_margin_is_notional_over_leverage() {
        let t = sample_table();
        assert_eq!(t.required_margin(2.0, 100.0, 10), 20.0);
    }
}
