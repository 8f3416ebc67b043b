//! Error taxonomy for the backtesting engine.
//!
//! Per-bar anomalies (non-positive stop loss, sizing collapsing to zero,
//! missing ATR during trailing, …) are *not* represented here: they are
//! warnings, pushed onto [`crate::engine::EngineOutput::warnings`] and
//! logged via `tracing::warn!`, and never short-circuit the bar loop.

use thiserror::Error;

/// Everything that can stop a run before or during the bar loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown indicator type: {0}")]
    UnknownIndicator(String),

    #[error("invalid indicator params: {0}")]
    InvalidIndicatorParams(String),

    #[error("indicator kernel error: {0}")]
    IndicatorKernelError(String),

    #[error("invalid strategy: {0}")]
    InvalidStrategy(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
