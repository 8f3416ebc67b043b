//! Risk manager (C3): position sizing, TP1 pricing, breakeven moves.
//!
//! Grounded on `original_source/engine/core/risk_manager.py`
//! (`RiskManager.calculate_position_size`, `calculate_tp1_price`,
//! `move_sl_to_breakeven`). The leverage-clipping loop is a direct port
//! of the Python `for _ in range(10)` bracket-tightening iteration; the
//! convergence threshold (0.01) and the 10-iteration cap are load-bearing
//! constants copied from the reference, not arbitrary choices.

use crate::bar::Direction;
use crate::error::EngineError;
use crate::leverage::LeverageTable;
use crate::trade::Position;

/// Result of a single position-sizing calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingResult {
    pub position_size: u64,
    pub initial_risk: f64,
    pub leverage: u32,
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    pub initial_balance: f64,
    pub risk_percent: f64,
    pub risk_reward_ratio: f64,
    current_balance: f64,
    leverage_table: Option<LeverageTable>,
}

impl RiskManager {
    pub fn new(
        initial_balance: f64,
        risk_percent: f64,
        risk_reward_ratio: f64,
        leverage_table: Option<LeverageTable>,
    ) -> Result<Self, EngineError> {
        if !(initial_balance > 0.0) {
            return Err(EngineError::InvalidConfig(
                "initial_balance must be positive".into(),
            ));
        }
        if !(risk_percent > 0.0 && risk_percent <= 1.0) {
            return Err(EngineError::InvalidConfig(
                "risk_percent must be in (0, 1]".into(),
            ));
        }
        if !(risk_reward_ratio > 0.0) {
            return Err(EngineError::InvalidConfig(
                "risk_reward_ratio must be positive".into(),
            ));
        }
        Ok(RiskManager {
            initial_balance,
            risk_percent,
            risk_reward_ratio,
            current_balance: initial_balance,
            leverage_table,
        })
    }

    pub fn current_balance(&self) -> f64 {
        self.current_balance
    }

    pub fn update_balance(&mut self, new_balance: f64) {
        self.current_balance = new_balance;
    }

    /// Position size, initial risk in quote currency, and the leverage
    /// actually applied, given an entry price and a stop loss.
    ///
    /// Mirrors `risk_manager.py::calculate_position_size` / spec §4.2 step
    /// for step:
    /// 1. risk = |entry - sl|. A zero stop distance returns `(0, 0, 1)`.
    /// 2. raw size = (current_balance * risk_percent) / risk.
    /// 3. if a leverage table is present, iteratively clip the raw size so
    ///    that `size * entry <= current_balance * floor(max_leverage_for(size
    ///    * entry))`, up to 10 iterations or until the change is < 0.01.
    ///    Re-tightening into a lower bracket after a clip is exactly why
    ///    this is iterative rather than a single lookup.
    /// 4. round to an integer; if that rounds to 0 but the raw size was
    ///    positive and a single contract clears its own bracket's margin
    ///    requirement, promote to 1.
    /// 5. re-validate post-rounding: derive `used = max(1, floor(notional /
    ///    current_balance))` clipped to the bracket's max leverage; if the
    ///    notional still exceeds `current_balance * used`, fall back first
    ///    to `floor(raw size)`, then to `floor(current_balance * used /
    ///    entry)` if that is still infeasible.
    /// 6. return the final size, the risk amount, and the leverage used.
    pub fn calculate_position_size(&self, entry: f64, sl: f64) -> SizingResult {
        let risk = (entry - sl).abs();
        if risk <= 0.0 {
            return SizingResult {
                position_size: 0,
                initial_risk: 0.0,
                leverage: 1,
            };
        }

        let initial_risk = self.current_balance * self.risk_percent;
        let mut size = initial_risk / risk;
        let raw_size = size;

        if let Some(table) = &self.leverage_table {
            for _ in 0..10 {
                let notional = size * entry;
                let max_lev = table.max_leverage_for(notional).max(1);
                let cap = self.current_balance * max_lev as f64;
                if notional <= cap {
                    break;
                }
                let clipped = cap / entry;
                let delta = (size - clipped).abs();
                size = clipped;
                if delta < 0.01 {
                    break;
                }
            }
        }

        let mut rounded = size.round() as i64;
        if rounded == 0 && raw_size > 0.0 {
            if let Some(table) = &self.leverage_table {
                let max_lev = table.max_leverage_for(entry).max(1);
                if entry <= self.current_balance * max_lev as f64 {
                    rounded = 1;
                }
            } else {
                rounded = 1;
            }
        }
        let mut rounded = rounded.max(0) as u64;

        let mut leverage = 1u32;
        if let Some(table) = &self.leverage_table {
            let notional = rounded as f64 * entry;
            let max_lev = table.max_leverage_for(notional).max(1);
            let mut used = ((notional / self.current_balance).floor() as i64).max(1) as u32;
            used = used.min(max_lev);
            if notional > self.current_balance * used as f64 {
                // First remedy: raise `used` up to the bracket's max leverage
                // before touching size at all.
                used = max_lev;
                if notional > self.current_balance * used as f64 {
                    // Still infeasible: fall back to the pre-rounding floor,
                    // then to the largest size the raised leverage affords.
                    rounded = raw_size.floor().max(0.0) as u64;
                    let notional = rounded as f64 * entry;
                    if notional > self.current_balance * used as f64 {
                        rounded = ((self.current_balance * used as f64) / entry).floor() as u64;
                    }
                }
            }
            leverage = used;
        }

        SizingResult {
            position_size: rounded,
            initial_risk,
            leverage,
        }
    }

    /// TP1 price: entry plus (for longs) or minus (for shorts) the stop
    /// distance scaled by `risk_reward_ratio`.
    pub fn calculate_tp1_price(&self, entry: f64, sl: f64, direction: Direction) -> f64 {
        let stop_distance = (entry - sl).abs();
        match direction {
            Direction::Long => entry + stop_distance * self.risk_reward_ratio,
            Direction::Short => entry - stop_distance * self.risk_reward_ratio,
        }
    }

    /// Moves a position's stop loss to its entry price. Called once TP1
    /// has fired; idempotent if called again.
    pub fn move_sl_to_be(&self, position: &mut Position) {
        position.stop_loss = position.entry_price;
    }
}
