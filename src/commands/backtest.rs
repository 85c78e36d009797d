//! Backtest command implementation

use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use upbit_ensemble::backtest::Backtester;
use upbit_ensemble::signal::fallback_weights;
use upbit_ensemble::storage::SqliteStorage;
use upbit_ensemble::types::ParameterSet;
use upbit_ensemble::Config;

pub fn run(
    config_path: Option<PathBuf>,
    months: Option<u32>,
    threshold_override: Option<f64>,
) -> Result<()> {
    info!("Starting backtest");

    let mut config = Config::load(config_path.as_deref())?;

    if let Some(months) = months {
        info!("Overriding history window to: {} months", months);
        config.optimizer.months = months;
    }

    if let Some(threshold) = threshold_override {
        info!("Overriding signal threshold to: {}", threshold);
        config.trading.threshold = threshold;
    }

    let storage = SqliteStorage::open(&config.storage.path)?;
    let candles = storage.load_ohlcv(&config.storage.timeframe, config.optimizer.months)?;
    info!("Loaded {} candles", candles.len());

    if candles.len() < 2 {
        println!("Not enough stored history to backtest. Run `collect` or `import` first.");
        return Ok(());
    }

    let params = match storage.best_parameter_set()? {
        Some(best) => {
            info!("Using tuned weights from the last optimizer run");
            ParameterSet::new(best.weights, config.trading.threshold)
        }
        None => {
            info!("No optimizer result found, using fallback weights");
            ParameterSet::new(fallback_weights(), config.trading.threshold)
        }
    };

    let backtester = Backtester::new(config.backtest_options());
    let metrics = backtester.run(&candles, &params);

    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS");
    println!("{}", "=".repeat(60));
    println!("Candles:            {}", candles.len());
    println!("Initial Cash:       ₩{:.0}", config.optimizer.initial_cash);
    println!("Final Equity:       ₩{:.0}", metrics.final_equity);
    println!("Total Return:       {:.2}%", metrics.total_return * 100.0);
    println!("Max Drawdown:       {:.2}%", metrics.max_drawdown * 100.0);
    println!("Sharpe Ratio:       {:.2}", metrics.sharpe);
    println!("Win Rate:           {:.2}%", metrics.win_rate * 100.0);
    println!("Total Trades:       {}", metrics.num_trades);
    println!("{}", "=".repeat(60));

    info!("Backtest completed successfully");
    Ok(())
}
