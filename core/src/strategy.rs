//! Strategy evaluator (C5): compiles a declarative strategy definition
//! into per-bar entry/exit/trailing predicates.
//!
//! Grounded on `original_source/engine/utils/strategy_parser.py`
//! (`StrategyParser.evaluate_entry_conditions`,
//! `evaluate_exit_conditions`, stop-loss formula dispatch). The Python
//! reference walks a JSON condition tree at evaluation time; here the
//! tree is compiled once in [`CompiledStrategy::compile`] against the
//! indicator column store, then evaluated per bar via plain field lookups
//! — the same "compile once, evaluate per bar in O(1)" shape the
//! reference achieves through `pandas` vectorization.

use std::collections::HashMap;

use crate::bar::{Direction, OhlcSeries};
use crate::error::EngineError;
use crate::indicators::{ColumnStore, IndicatorSpec};

/// One operand of a condition node.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Price(PriceField),
    Ref { id: String, field: Option<String> },
    Value(f64),
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    CrossAbove,
    CrossBelow,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConditionNode {
    pub left: Operand,
    pub op: CompareOp,
    pub right: Operand,
}

/// Stop-loss formula chosen by a strategy definition.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossRule {
    FixedPercent(f64),
    FixedPoints(f64),
    AtrBased { atr_id: String, multiplier: f64 },
    IndicatorLevel { long_ref: String, short_ref: String },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExitBlock {
    pub indicator_based_long: Vec<ConditionNode>,
    pub indicator_based_short: Vec<ConditionNode>,
    pub atr_trailing: Option<AtrTrailing>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AtrTrailing {
    pub atr_indicator_id: String,
    pub multiplier: f64,
}

/// Opaque-to-the-engine strategy definition: the input C5 compiles.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StrategyDefinition {
    pub indicators: Vec<IndicatorSpec>,
    pub entry_long: Vec<ConditionNode>,
    pub entry_short: Vec<ConditionNode>,
    pub exit: Option<ExitBlock>,
    pub stop_loss: StopLossRule,
}

#[derive(Debug, Clone, Copy)]
pub struct EntrySignal {
    pub direction: Direction,
    pub stop_loss: f64,
}

/// A compiled strategy: the column store it was bound against, plus the
/// definition's condition trees and stop-loss rule. Pure per-bar
/// evaluation — no mutation after `compile`.
pub struct CompiledStrategy {
    store: ColumnStore,
    entry_long: Vec<ConditionNode>,
    entry_short: Vec<ConditionNode>,
    exit: Option<ExitBlock>,
    stop_loss: StopLossRule,
    timestamp_index: HashMap<i64, usize>,
}

impl CompiledStrategy {
    pub fn compile(
        def: &StrategyDefinition,
        bars: &OhlcSeries,
    ) -> Result<Self, EngineError> {
        let mut store = ColumnStore::new(bars);
        for spec in &def.indicators {
            store.calculate_indicator(spec)?;
        }
        Ok(CompiledStrategy {
            store,
            entry_long: def.entry_long.clone(),
            entry_short: def.entry_short.clone(),
            exit: def.exit.clone(),
            stop_loss: def.stop_loss.clone(),
            timestamp_index: bars.timestamp_index(),
        })
    }

    pub fn timestamp_index(&self) -> &HashMap<i64, usize> {
        &self.timestamp_index
    }

    pub fn atr_trailing_config(&self) -> Option<(&str, f64)> {
        self.exit
            .as_ref()
            .and_then(|e| e.atr_trailing.as_ref())
            .map(|t| (t.atr_indicator_id.as_str(), t.multiplier))
    }

    fn resolve(&self, operand: &Operand, bar_index: usize) -> Option<f64> {
        match operand {
            Operand::Value(v) => Some(*v),
            Operand::Price(field) => {
                let name = match field {
                    PriceField::Open => "open",
                    PriceField::High => "high",
                    PriceField::Low => "low",
                    PriceField::Close => "close",
                    PriceField::Volume => "volume",
                };
                self.store.column(name).and_then(|c| c.get(bar_index)).copied()
            }
            Operand::Ref { id, field } => {
                let column_name = match field.as_deref() {
                    None | Some("main") => id.clone(),
                    Some(f) => format!("{id}_{f}"),
                };
                if self.store.has_column(&column_name) {
                    Some(self.store.get_value(&column_name, bar_index))
                } else {
                    None
                }
            }
        }
    }

    fn eval_node(&self, node: &ConditionNode, bar_index: usize) -> bool {
        match node.op {
            CompareOp::CrossAbove => {
                if bar_index == 0 {
                    return false;
                }
                let (Some(l0), Some(r0)) =
                    (self.resolve(&node.left, bar_index - 1), self.resolve(&node.right, bar_index - 1))
                else {
                    return false;
                };
                let (Some(l1), Some(r1)) =
                    (self.resolve(&node.left, bar_index), self.resolve(&node.right, bar_index))
                else {
                    return false;
                };
                l0 <= r0 && l1 > r1
            }
            CompareOp::CrossBelow => {
                if bar_index == 0 {
                    return false;
                }
                let (Some(l0), Some(r0)) =
                    (self.resolve(&node.left, bar_index - 1), self.resolve(&node.right, bar_index - 1))
                else {
                    return false;
                };
                let (Some(l1), Some(r1)) =
                    (self.resolve(&node.left, bar_index), self.resolve(&node.right, bar_index))
                else {
                    return false;
                };
                l0 >= r0 && l1 < r1
            }
            simple_op => {
                let (Some(l), Some(r)) =
                    (self.resolve(&node.left, bar_index), self.resolve(&node.right, bar_index))
                else {
                    return false;
                };
                match simple_op {
                    CompareOp::Gt => l > r,
                    CompareOp::Lt => l < r,
                    CompareOp::Ge => l >= r,
                    CompareOp::Le => l <= r,
                    CompareOp::Eq => (l - r).abs() < 1e-9,
                    CompareOp::CrossAbove | CompareOp::CrossBelow => unreachable!(),
                }
            }
        }
    }

    fn eval_and_tree(&self, nodes: &[ConditionNode], bar_index: usize) -> bool {
        if nodes.is_empty() {
            return false;
        }
        nodes.iter().all(|n| self.eval_node(n, bar_index))
    }

    /// Entry signal at bar `i`. Evaluates both AND-trees; if both fire,
    /// that's ambiguous and counts as no entry. If exactly one fires,
    /// derives the stop loss from the configured rule.
    pub fn entry_signal(&self, bar_index: usize) -> (Option<EntrySignal>, Option<String>) {
        let long_fired = self.eval_and_tree(&self.entry_long, bar_index);
        let short_fired = self.eval_and_tree(&self.entry_short, bar_index);

        let direction = match (long_fired, short_fired) {
            (true, true) => return (None, None),
            (true, false) => Direction::Long,
            (false, true) => Direction::Short,
            (false, false) => return (None, None),
        };

        let close = self
            .store
            .column("close")
            .and_then(|c| c.get(bar_index))
            .copied()
            .unwrap_or(0.0);

        match self.derive_stop_loss(close, bar_index, direction) {
            Ok(sl) => (Some(EntrySignal { direction, stop_loss: sl }), None),
            Err(warning) => (None, Some(warning)),
        }
    }

    fn derive_stop_loss(
        &self,
        close: f64,
        bar_index: usize,
        direction: Direction,
    ) -> Result<f64, String> {
        let sl = match &self.stop_loss {
            StopLossRule::FixedPercent(p) => match direction {
                Direction::Long => close * (1.0 - p / 100.0),
                Direction::Short => close * (1.0 + p / 100.0),
            },
            StopLossRule::FixedPoints(k) => match direction {
                Direction::Long => close - k,
                Direction::Short => close + k,
            },
            StopLossRule::AtrBased { atr_id, multiplier } => {
                let atr = self.store.get_value(atr_id, bar_index);
                if atr <= 0.0 || !self.store.has_column(atr_id) {
                    let msg = format!(
                        "atr_based stop loss unavailable at bar {bar_index}: atr '{atr_id}' missing or non-positive"
                    );
                    tracing::debug!("{msg}");
                    return Err(msg);
                }
                match direction {
                    Direction::Long => close - multiplier * atr,
                    Direction::Short => close + multiplier * atr,
                }
            }
            StopLossRule::IndicatorLevel { long_ref, short_ref } => {
                let reference = match direction {
                    Direction::Long => long_ref,
                    Direction::Short => short_ref,
                };
                if !self.store.has_column(reference) {
                    let msg = format!(
                        "indicator_level stop loss references unknown column '{reference}'"
                    );
                    tracing::debug!("{msg}");
                    return Err(msg);
                }
                let level = self.store.get_value(reference, bar_index);
                if level.is_nan() || level <= 0.0 {
                    let msg = format!(
                        "indicator_level stop loss '{reference}' is NaN or non-positive at bar {bar_index}"
                    );
                    tracing::debug!("{msg}");
                    return Err(msg);
                }
                level
            }
        };

        match direction {
            Direction::Long if sl >= close => {
                Err(format!("derived LONG stop loss {sl} is not below close {close}"))
            }
            Direction::Short if sl <= close => {
                Err(format!("derived SHORT stop loss {sl} is not above close {close}"))
            }
            _ => Ok(sl),
        }
    }

    /// Exit signal at bar `i` for an open position of direction `d`.
    pub fn exit_signal(&self, bar_index: usize, direction: Direction) -> bool {
        let Some(exit) = &self.exit else {
            return false;
        };
        let tree = match direction {
            Direction::Long => &exit.indicator_based_long,
            Direction::Short => &exit.indicator_based_short,
        };
        self.eval_and_tree(tree, bar_index)
    }

    pub fn column_store(&self) -> &ColumnStore {
        &self.store
    }
}
