use std::ops::ControlFlow;
use std::path::PathBuf;

use anyhow::{Context, Result};
use backtest_core::engine::{ProgressSink, SimulationEngine};
use backtest_core::leverage::{LeverageBracket, LeverageTable};
use backtest_core::risk::RiskManager;
use backtest_core::strategy::{CompiledStrategy, StrategyDefinition};
use backtest_core::{data, RunConfig};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

/// Runs a deterministic back-test over a CSV bar file and a JSON
/// strategy definition, printing the resulting metrics.
#[derive(Parser, Debug)]
#[command(name = "backtest", version, about)]
struct Cli {
    /// Path to the OHLCV CSV file (header: dt,do,dh,dl,dc,dv,dd).
    #[arg(long)]
    bars: PathBuf,

    /// Path to the strategy definition JSON.
    #[arg(long)]
    strategy: PathBuf,

    /// Path to the run config preset JSON.
    #[arg(long)]
    preset: PathBuf,

    /// Optional leverage bracket table JSON; runs without leverage caps
    /// if omitted.
    #[arg(long)]
    leverage: Option<PathBuf>,
}

struct CliProgress {
    bar: ProgressBar,
}

impl ProgressSink for CliProgress {
    fn report(&mut self, done: usize, total: usize) -> ControlFlow<()> {
        self.bar.set_length(total as u64);
        self.bar.set_position(done as u64);
        ControlFlow::Continue(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let bars = data::load_csv(&cli.bars)
        .with_context(|| format!("loading bars from {}", cli.bars.display()))?;
    tracing::info!(bars = bars.len(), "loaded bar series");

    let strategy_json = std::fs::read_to_string(&cli.strategy)
        .with_context(|| format!("reading strategy definition from {}", cli.strategy.display()))?;
    let strategy_def: StrategyDefinition =
        serde_json::from_str(&strategy_json).context("parsing strategy definition")?;

    let preset_json = std::fs::read_to_string(&cli.preset)
        .with_context(|| format!("reading run config preset from {}", cli.preset.display()))?;
    let preset: RunConfig = serde_json::from_str(&preset_json).context("parsing run config preset")?;
    preset.validate().context("invalid run config preset")?;

    let leverage_table = match &cli.leverage {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading leverage table from {}", path.display()))?;
            let brackets: Vec<LeverageBracket> =
                serde_json::from_str(&json).context("parsing leverage table")?;
            Some(LeverageTable::new(brackets).context("invalid leverage table")?)
        }
        None => {
            tracing::warn!("no leverage table supplied; running without leverage caps");
            None
        }
    };

    let compiled = CompiledStrategy::compile(&strategy_def, &bars).context("compiling strategy")?;

    let risk_manager = RiskManager::new(
        preset.initial_balance,
        preset.risk_percent,
        preset.risk_reward_ratio,
        leverage_table,
    )
    .context("constructing risk manager")?;

    let mut engine = SimulationEngine::new(&bars, &compiled, risk_manager, preset.rebalance_interval)
        .context("constructing simulation engine")?;

    let progress_bar = ProgressBar::new(bars.len() as u64);
    progress_bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} bars ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let mut sink = CliProgress { bar: progress_bar };

    let output = engine.run(&mut sink).context("running simulation")?;
    sink.bar.finish_and_clear();

    for warning in &output.warnings {
        tracing::warn!("{warning}");
    }

    println!("status: {:?}", output.status);
    println!("trades: {}", output.trades.len());
    println!("{}", serde_json::to_string_pretty(&output.metrics)?);

    Ok(())
}
