//! Simulation engine (C6) — the hardest component.
//!
//! Grounded on `original_source/engine/core/backtest_engine.py`
//! (`BacktestEngine.run`, `_process_bar`, `_check_exit_conditions`,
//! `_update_trailing_stop`). Drives the bar loop, owns the single open
//! [`Position`], enforces the SL > TP1 > indicator-exit > reverse
//! priority, and periodically rebalances the risk manager's balance
//! against realized equity.

use std::ops::ControlFlow;

use crate::bar::{Direction, OhlcSeries};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{self, Metrics};
use crate::risk::RiskManager;
use crate::strategy::CompiledStrategy;
use crate::trade::{ExitType, Position, Trade, TradeLeg};

/// Cooperative cancellation / progress hook. `report` is invoked between
/// bars, rate-limited by the engine to at most 100 calls per run (or
/// once per 1% progress, whichever is less frequent). Returning
/// `ControlFlow::Break(())` aborts the run with `RunStatus::Cancelled`.
pub trait ProgressSink {
    fn report(&mut self, done: usize, total: usize) -> ControlFlow<()>;
}

/// A sink that never cancels. Used by the CLI and all tests that don't
/// care about progress.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&mut self, _done: usize, _total: usize) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RunStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineOutput {
    pub trades: Vec<Trade>,
    pub metrics: Metrics,
    pub warnings: Vec<String>,
    pub status: RunStatus,
}

pub struct SimulationEngine<'a> {
    bars: &'a OhlcSeries,
    strategy: &'a CompiledStrategy,
    risk_manager: RiskManager,
    rebalance_interval: u64,
}

impl<'a> SimulationEngine<'a> {
    pub fn new(
        bars: &'a OhlcSeries,
        strategy: &'a CompiledStrategy,
        risk_manager: RiskManager,
        rebalance_interval: u64,
    ) -> EngineResult<Self> {
        if bars.is_empty() {
            return Err(EngineError::InvalidInput("bars must not be empty".into()));
        }
        if rebalance_interval == 0 {
            return Err(EngineError::InvalidConfig(
                "rebalance_interval must be >= 1".into(),
            ));
        }
        Ok(SimulationEngine {
            bars,
            strategy,
            risk_manager,
            rebalance_interval,
        })
    }

    pub fn run(&mut self, sink: &mut dyn ProgressSink) -> EngineResult<EngineOutput> {
        let initial_balance = self.risk_manager.initial_balance;
        let total = self.bars.len();
        let report_every = (total / 100).max(1);

        let mut warnings: Vec<String> = Vec::new();
        let mut trades: Vec<Trade> = Vec::new();
        let mut position: Option<Position> = None;
        let mut trade_id_counter: u64 = 1;
        let mut completed_trades_count: u64 = 0;

        for i in 0..total {
            let bar = self.bars.get(i);
            let mut closed_non_sl_this_bar = false;

            if let Some(pos) = position.as_mut() {
                pos.tp1_occurred_this_bar = false;

                if pos.tp1_hit {
                    self.update_trailing_stop(pos, i, &mut warnings);
                }

                let close_reason = self.evaluate_exit(pos, bar, i, &mut trades, &mut warnings);

                if let Some((exit_type, exit_price, exit_ts)) = close_reason {
                    let trade = trades
                        .iter_mut()
                        .find(|t| t.trade_id == pos.trade_id)
                        .expect("trade row must exist for an open position");

                    let qty_ratio = pos.remaining_qty_ratio();
                    let pnl = pnl_for(pos.direction, pos.entry_price, exit_price, pos.position_size as f64, qty_ratio);

                    match TradeLeg::new(pos.trade_id, exit_type, exit_ts, exit_price, qty_ratio, pnl) {
                        Ok(leg) => {
                            let _ = trade.add_leg(leg);
                        }
                        Err(e) => record_warning(&mut warnings, format!("bar {i}: failed to record final leg: {e}")),
                    }
                    trade.close();
                    completed_trades_count += 1;

                    if completed_trades_count % self.rebalance_interval == 0 {
                        let realized: f64 = trades.iter().map(|t| t.total_pnl()).sum();
                        self.risk_manager.update_balance(initial_balance + realized);
                    }

                    if exit_type != ExitType::Sl {
                        closed_non_sl_this_bar = true;
                    }
                    position = None;
                }
            }

            if position.is_none() && !closed_non_sl_this_bar {
                let (signal, warning) = self.strategy.entry_signal(i);
                if let Some(w) = warning {
                    record_warning(&mut warnings, format!("bar {i}: {w}"));
                }
                if let Some(signal) = signal {
                    let close = bar.close;
                    let valid = signal.stop_loss > 0.0
                        && match signal.direction {
                            Direction::Long => signal.stop_loss < close,
                            Direction::Short => signal.stop_loss > close,
                        };
                    if !valid {
                        record_warning(&mut warnings, format!(
                            "bar {i}: entry signal rejected, stop_loss {} invalid for direction {:?} at close {close}",
                            signal.stop_loss, signal.direction
                        ));
                    } else {
                        let sizing = self.risk_manager.calculate_position_size(close, signal.stop_loss);
                        if sizing.position_size == 0 {
                            record_warning(&mut warnings, format!("bar {i}: position size rounded to 0, skipping entry"));
                        } else {
                            let tp1 = self.risk_manager.calculate_tp1_price(close, signal.stop_loss, signal.direction);
                            let trade_id = trade_id_counter;
                            trade_id_counter += 1;

                            match Position::open(
                                trade_id,
                                signal.direction,
                                close,
                                bar.timestamp,
                                sizing.position_size,
                                signal.stop_loss,
                                tp1,
                                sizing.initial_risk,
                            ) {
                                Ok(new_position) => {
                                    let trade = Trade::new(
                                        trade_id,
                                        signal.direction,
                                        close,
                                        bar.timestamp,
                                        sizing.position_size,
                                        sizing.initial_risk,
                                        signal.stop_loss,
                                        tp1,
                                        self.risk_manager.current_balance(),
                                        sizing.leverage,
                                    );
                                    trades.push(trade);
                                    position = Some(new_position);
                                }
                                Err(e) => record_warning(&mut warnings, format!("bar {i}: failed to open position: {e}")),
                            }
                        }
                    }
                }
            }

            if i % report_every == 0 || i == total - 1 {
                if sink.report(i + 1, total).is_break() {
                    return Ok(EngineOutput {
                        trades,
                        metrics: metrics::compute(&trades),
                        warnings,
                        status: RunStatus::Cancelled,
                    });
                }
            }
        }

        Ok(EngineOutput {
            trades,
            metrics: metrics::compute(&trades),
            warnings,
            status: RunStatus::Completed,
        })
    }

    /// Trailing stop update: only runs once TP1 has fired. Initializes
    /// the trail to the entry price on first call, then only advances in
    /// the favorable direction (monotone).
    fn update_trailing_stop(&self, pos: &mut Position, bar_index: usize, warnings: &mut Vec<String>) {
        let Some((atr_column, multiplier)) = self.strategy.atr_trailing_config() else {
            return;
        };
        let atr = self.strategy.column_store().get_value(atr_column, bar_index);
        if atr.is_nan() || atr <= 0.0 {
            record_warning(warnings, format!(
                "bar {bar_index}: ATR trailing skipped, column '{atr_column}' missing or non-positive"
            ));
            return;
        }
        let close = self.bars.get(bar_index).close;
        let new_trail = match pos.direction {
            Direction::Long => close - multiplier * atr,
            Direction::Short => close + multiplier * atr,
        };

        let current_trail = pos.trailing_stop.unwrap_or(pos.entry_price);
        let advanced = match pos.direction {
            Direction::Long => new_trail.max(current_trail),
            Direction::Short => new_trail.min(current_trail),
        };

        if pos.trailing_stop.is_none() || advanced != current_trail {
            pos.trailing_stop = Some(advanced);
            pos.stop_loss = advanced;
        }
    }

    /// Evaluates the strict exit priority for one bar: SL, then TP1 (a
    /// partial exit, not terminal), then indicator-based exit, then —
    /// only if TP1 did not just fire — the reverse signal. Returns the
    /// final closing leg's `(exit_type, exit_price, exit_timestamp)` if
    /// the position closed this bar.
    fn evaluate_exit(
        &self,
        pos: &mut Position,
        bar: &crate::bar::Bar,
        bar_index: usize,
        trades: &mut [Trade],
        warnings: &mut Vec<String>,
    ) -> Option<(ExitType, f64, i64)> {
        let sl_triggered = match pos.direction {
            Direction::Long => bar.low <= pos.stop_loss,
            Direction::Short => bar.high >= pos.stop_loss,
        };
        if sl_triggered {
            return Some((ExitType::Sl, bar.close, bar.timestamp));
        }

        if !pos.tp1_hit {
            let tp1_triggered = match pos.direction {
                Direction::Long => bar.high >= pos.take_profit_1,
                Direction::Short => bar.low <= pos.take_profit_1,
            };
            if tp1_triggered {
                let pnl = pnl_for(pos.direction, pos.entry_price, bar.close, pos.position_size as f64, 0.5);
                if let Some(trade) = trades.iter_mut().find(|t| t.trade_id == pos.trade_id) {
                    match TradeLeg::new(pos.trade_id, ExitType::Tp1, bar.timestamp, bar.close, 0.5, pnl) {
                        Ok(leg) => {
                            let _ = trade.add_leg(leg);
                        }
                        Err(e) => record_warning(warnings, format!("bar {bar_index}: failed to record TP1 leg: {e}")),
                    }
                }
                pos.tp1_hit = true;
                self.risk_manager.move_sl_to_be(pos);
                pos.tp1_occurred_this_bar = true;
            }
        }

        if self.strategy.exit_signal(bar_index, pos.direction) {
            let exit_type = if pos.tp1_hit { ExitType::Be } else { ExitType::Reverse };
            return Some((exit_type, bar.close, bar.timestamp));
        }

        if !pos.tp1_occurred_this_bar {
            let (reverse_signal, _) = self.strategy.entry_signal(bar_index);
            if let Some(signal) = reverse_signal {
                if signal.direction == pos.direction.opposite() {
                    let exit_type = if pos.tp1_hit { ExitType::Be } else { ExitType::Reverse };
                    return Some((exit_type, bar.close, bar.timestamp));
                }
            }
        }

        None
    }
}

/// Records a per-bar anomaly: pushed onto the run's warning log and
/// emitted at `warn` level, per spec.md §7 ("Warning ... recorded in
/// `warnings`, bar action skipped, loop continues").
fn record_warning(warnings: &mut Vec<String>, message: String) {
    tracing::warn!("{message}");
    warnings.push(message);
}

fn pnl_for(direction: Direction, entry: f64, exit: f64, size: f64, qty_ratio: f64) -> f64 {
    match direction {
        Direction::Long => (exit - entry) * size * qty_ratio,
        Direction::Short => (entry - exit) * size * qty_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::Bar;
    use crate::strategy::{CompareOp, ConditionNode, Operand, PriceField, StopLossRule, StrategyDefinition};

    fn flat_series(prices: &[f64]) -> OhlcSeries {
        let bars = prices
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar::new(i as i64, c, c + 1.0, c - 1.0, c, 10.0, 0).unwrap())
            .collect();
        OhlcSeries::new(bars).unwrap()
    }

    fn always_long_def() -> StrategyDefinition {
        StrategyDefinition {
            indicators: vec![],
            entry_long: vec![ConditionNode {
                left: Operand::Price(PriceField::Close),
                op: CompareOp::Gt,
                right: Operand::Value(0.0),
            }],
            entry_short: vec![],
            exit: None,
            stop_loss: StopLossRule::FixedPoints(5.0),
        }
    }

    #[test]
    fn sl_exit_has_priority_over_tp1() {
        // Entry at bar 0 (close=100, sl=95, tp1=105). Bar 1 has low <= 95
        // and high >= 105 in the same bar: SL must win.
        let bars_data = vec![
            Bar::new(0, 100.0, 101.0, 99.0, 100.0, 10.0, 0).unwrap(),
            Bar::new(1, 100.0, 110.0, 90.0, 100.0, 10.0, 0).unwrap(),
        ];
        let bars = OhlcSeries::new(bars_data).unwrap();
        let def = always_long_def();
        let compiled = CompiledStrategy::compile(&def, &bars).unwrap();
        let rm = RiskManager::new(10_000.0, 0.1, 2.0, None).unwrap();
        let mut engine = SimulationEngine::new(&bars, &compiled, rm, 1).unwrap();
        let out = engine.run(&mut NoopProgress).unwrap();
        assert_eq!(out.trades.len(), 1);
        let trade = &out.trades[0];
        assert_eq!(trade.legs.len(), 1);
        assert_eq!(trade.legs[0].exit_type, ExitType::Sl);
    }

    #[test]
    fn trade_ids_are_dense_and_ascending() {
        let bars = flat_series(&[100.0, 99.0, 98.0, 97.0, 96.0, 95.0, 94.0]);
        let def = always_long_def();
        let compiled = CompiledStrategy::compile(&def, &bars).unwrap();
        let rm = RiskManager::new(10_000.0, 0.01, 2.0, None).unwrap();
        let mut engine = SimulationEngine::new(&bars, &compiled, rm, 1).unwrap();
        let out = engine.run(&mut NoopProgress).unwrap();
        for (idx, trade) in out.trades.iter().enumerate() {
            assert_eq!(trade.trade_id, (idx + 1) as u64);
        }
    }

    #[test]
    fn empty_bars_rejected_before_loop() {
        let bars = flat_series(&[100.0]);
        let def = always_long_def();
        let compiled = CompiledStrategy::compile(&def, &bars).unwrap();
        let rm = RiskManager::new(10_000.0, 0.01, 2.0, None).unwrap();
        assert!(SimulationEngine::new(&bars, &compiled, rm, 0).is_err());
    }

    struct CancelAfterOne(usize);
    impl ProgressSink for CancelAfterOne {
        fn report(&mut self, done: usize, _total: usize) -> ControlFlow<()> {
            if done >= self.0 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
    }

    #[test]
    fn cancellation_stops_the_loop_early() {
        let bars = flat_series(&[100.0, 99.0, 98.0, 97.0, 96.0]);
        let def = always_long_def();
        let compiled = CompiledStrategy::compile(&def, &bars).unwrap();
        let rm = RiskManager::new(10_000.0, 0.01, 2.0, None).unwrap();
        let mut engine = SimulationEngine::new(&bars, &compiled, rm, 1).unwrap();
        let out = engine.run(&mut CancelAfterOne(1)).unwrap();
        assert_eq!(out.status, RunStatus::Cancelled);
    }
}
