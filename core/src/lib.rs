//! Deterministic back-testing engine for leveraged futures strategies.
//!
//! Data flows leaf to root: [`bar`] and [`trade`] are the value types;
//! [`leverage`] and [`risk`] size positions; [`indicators`] precomputes
//! columns over the bar series; [`strategy`] compiles a declarative
//! definition against those columns into per-bar predicates; [`engine`]
//! drives the bar loop; [`metrics`] aggregates the resulting trades.

pub mod bar;
pub mod data;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod leverage;
pub mod metrics;
pub mod risk;
pub mod strategy;
pub mod trade;

pub use bar::{Bar, Direction, OhlcSeries};
pub use engine::{EngineOutput, NoopProgress, ProgressSink, RunStatus, SimulationEngine};
pub use error::{EngineError, EngineResult};
pub use leverage::{LeverageBracket, LeverageTable};
pub use metrics::{Grade, Metrics};
pub use risk::RiskManager;
pub use strategy::{CompiledStrategy, StrategyDefinition};
pub use trade::{ExitType, Position, Trade, TradeLeg};

/// `(initial_balance > 0, risk_percent in (0,1], risk_reward_ratio > 0,
/// rebalance_interval >= 1)`.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RunConfig {
    pub initial_balance: f64,
    pub risk_percent: f64,
    pub risk_reward_ratio: f64,
    pub rebalance_interval: u64,
}

impl RunConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.initial_balance > 0.0) {
            return Err(EngineError::InvalidConfig(
                "initial_balance must be positive".into(),
            ));
        }
        if !(self.risk_percent > 0.0 && self.risk_percent <= 1.0) {
            return Err(EngineError::InvalidConfig(
                "risk_percent must be in (0, 1]".into(),
            ));
        }
        if !(self.risk_reward_ratio > 0.0) {
            return Err(EngineError::InvalidConfig(
                "risk_reward_ratio must be positive".into(),
            ));
        }
        if self.rebalance_interval < 1 {
            return Err(EngineError::InvalidConfig(
                "rebalance_interval must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
