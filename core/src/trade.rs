//! Position / trade-leg / trade value types (C1 continued).
//!
//! Grounded on `original_source/engine/models/position.py`,
//! `trade_leg.py` and `trade.py`. The Python reference raises in
//! `__post_init__`; here the invariants are enforced by construction
//! helpers that return `Result` (`Position::open`, `TradeLeg::new`),
//! matching `OhlcSeries`/`Bar`'s validate-on-construct style in `bar.rs`.

use crate::bar::Direction;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExitType {
    Sl,
    Tp1,
    Be,
    Reverse,
}

/// The single open position, at most one at a time, owned by the engine.
#[derive(Debug, Clone)]
pub struct Position {
    pub trade_id: u64,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_timestamp: i64,
    pub position_size: u64,
    /// Mutable: moves to breakeven after TP1 and tracks the trailing stop.
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub initial_risk: f64,
    pub tp1_hit: bool,
    /// Reset at the start of every bar.
    pub tp1_occurred_this_bar: bool,
    pub trailing_stop: Option<f64>,
}

impl Position {
    pub fn open(
        trade_id: u64,
        direction: Direction,
        entry_price: f64,
        entry_timestamp: i64,
        position_size: u64,
        stop_loss: f64,
        take_profit_1: f64,
        initial_risk: f64,
    ) -> Result<Self, EngineError> {
        if trade_id == 0 {
            return Err(EngineError::InvalidInput("trade_id must be positive".into()));
        }
        if entry_timestamp < 0 {
            return Err(EngineError::InvalidInput("entry_timestamp must be >= 0".into()));
        }
        if entry_price <= 0.0 || stop_loss <= 0.0 || take_profit_1 <= 0.0 {
            return Err(EngineError::InvalidInput(
                "entry_price, stop_loss and take_profit_1 must be positive".into(),
            ));
        }
        if position_size == 0 {
            return Err(EngineError::InvalidInput("position_size must be >= 1".into()));
        }
        if initial_risk < 0.0 {
            return Err(EngineError::InvalidInput("initial_risk must be >= 0".into()));
        }
        match direction {
            Direction::Long => {
                if stop_loss >= entry_price {
                    return Err(EngineError::InvalidInput(
                        "LONG position requires stop_loss < entry_price".into(),
                    ));
                }
                if take_profit_1 <= entry_price {
                    return Err(EngineError::InvalidInput(
                        "LONG position requires take_profit_1 > entry_price".into(),
                    ));
                }
            }
            Direction::Short => {
                if stop_loss <= entry_price {
                    return Err(EngineError::InvalidInput(
                        "SHORT position requires stop_loss > entry_price".into(),
                    ));
                }
                if take_profit_1 >= entry_price {
                    return Err(EngineError::InvalidInput(
                        "SHORT position requires take_profit_1 < entry_price".into(),
                    ));
                }
            }
        }
        Ok(Position {
            trade_id,
            direction,
            entry_price,
            entry_timestamp,
            position_size,
            stop_loss,
            take_profit_1,
            initial_risk,
            tp1_hit: false,
            tp1_occurred_this_bar: false,
            trailing_stop: None,
        })
    }

    /// Remaining quantity ratio of the position: 0.5 once TP1 has fired
    /// (half already booked), otherwise 1.0.
    pub fn remaining_qty_ratio(&self) -> f64 {
        if self.tp1_hit {
            0.5
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct TradeLeg {
    pub trade_id: u64,
    pub exit_type: ExitType,
    pub exit_timestamp: i64,
    pub exit_price: f64,
    pub qty_ratio: f64,
    pub pnl: f64,
}

impl TradeLeg {
    pub fn new(
        trade_id: u64,
        exit_type: ExitType,
        exit_timestamp: i64,
        exit_price: f64,
        qty_ratio: f64,
        pnl: f64,
    ) -> Result<Self, EngineError> {
        if trade_id == 0 {
            return Err(EngineError::InvalidInput("trade_id must be positive".into()));
        }
        if exit_timestamp < 0 {
            return Err(EngineError::InvalidInput("exit_timestamp must be >= 0".into()));
        }
        if exit_price <= 0.0 {
            return Err(EngineError::InvalidInput("exit_price must be positive".into()));
        }
        if !(qty_ratio > 0.0 && qty_ratio <= 1.0) {
            return Err(EngineError::InvalidInput(
                "qty_ratio must be in (0, 1]".into(),
            ));
        }
        Ok(TradeLeg {
            trade_id,
            exit_type,
            exit_timestamp,
            exit_price,
            qty_ratio,
            pnl,
        })
    }
}

/// A trade from entry to final close. Partial exits (TP1) and the final
/// leg belong to the same trade — at most two legs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Trade {
    pub trade_id: u64,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_timestamp: i64,
    pub position_size: u64,
    pub initial_risk: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub balance_at_entry: f64,
    pub leverage: u32,
    pub legs: Vec<TradeLeg>,
    pub is_closed: bool,
}

impl Trade {
    pub fn new(
        trade_id: u64,
        direction: Direction,
        entry_price: f64,
        entry_timestamp: i64,
        position_size: u64,
        initial_risk: f64,
        stop_loss: f64,
        take_profit_1: f64,
        balance_at_entry: f64,
        leverage: u32,
    ) -> Self {
        Trade {
            trade_id,
            direction,
            entry_price,
            entry_timestamp,
            position_size,
            initial_risk,
            stop_loss,
            take_profit_1,
            balance_at_entry,
            leverage,
            legs: Vec::with_capacity(2),
            is_closed: false,
        }
    }

    pub fn add_leg(&mut self, leg: TradeLeg) -> Result<(), EngineError> {
        if leg.trade_id != self.trade_id {
            return Err(EngineError::InvalidInput(format!(
                "leg trade_id {} does not match trade {}",
                leg.trade_id, self.trade_id
            )));
        }
        if self.legs.len() >= 2 {
            return Err(EngineError::InvalidInput(
                "a trade may have at most two legs".into(),
            ));
        }
        self.legs.push(leg);
        Ok(())
    }

    pub fn close(&mut self) {
        self.is_closed = true;
    }

    pub fn total_pnl(&self) -> f64 {
        self.legs.iter().map(|l| l.pnl).sum()
    }

    pub fn is_winning(&self) -> bool {
        self.total_pnl() > 0.0
    }

    pub fn has_tp1(&self) -> bool {
        self.legs.iter().any(|l| l.exit_type == ExitType::Tp1)
    }

    pub fn has_be_exit(&self) -> bool {
        self.legs.iter().any(|l| l.exit_type == ExitType::Be)
    }
}
