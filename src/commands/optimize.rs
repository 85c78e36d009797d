//! Optimize command implementation with progress tracking

use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use upbit_ensemble::optimizer::TwoStageOptimizer;
use upbit_ensemble::storage::SqliteStorage;
use upbit_ensemble::Config;

pub fn run(
    config_path: Option<PathBuf>,
    threads: Option<usize>,
    months: Option<u32>,
) -> Result<()> {
    info!("Starting optimization");

    let mut config = Config::load(config_path.as_deref())?;

    if let Some(threads) = threads {
        info!("Overriding worker threads to: {}", threads);
        config.optimizer.threads = threads;
    }

    if let Some(months) = months {
        info!("Overriding history window to: {} months", months);
        config.optimizer.months = months;
    }

    let storage = SqliteStorage::open(&config.storage.path)?;
    let optimizer = TwoStageOptimizer::new(storage, &config).with_progress(true);

    println!(
        "Optimizing {} weights over {} months of stored candles...",
        config.trading.market, config.optimizer.months
    );

    let winner = match optimizer.run()? {
        Some(winner) => winner,
        None => {
            println!("Not enough stored history to optimize. Run `collect` or `import` first.");
            return Ok(());
        }
    };

    println!("\n{}", "=".repeat(60));
    println!("OPTIMIZATION RESULTS");
    println!("{}", "=".repeat(60));
    println!("Threshold:          {:.2}", winner.params.threshold);
    println!(
        "Total Return:       {:.2}%",
        winner.metrics.total_return * 100.0
    );
    println!("Final Equity:       ₩{:.0}", winner.metrics.final_equity);
    println!("Sharpe Ratio:       {:.2}", winner.metrics.sharpe);
    println!(
        "Max Drawdown:       {:.2}%",
        winner.metrics.max_drawdown * 100.0
    );
    println!("Win Rate:           {:.2}%", winner.metrics.win_rate * 100.0);
    println!("Total Trades:       {}", winner.metrics.num_trades);
    println!("{}", "-".repeat(60));
    println!("Weights:");
    for (key, weight) in &winner.params.weights {
        if *weight > 0.0 {
            println!("  {:<14} {:.2}", key.as_str(), weight);
        }
    }
    println!("{}", "=".repeat(60));

    info!("Optimization completed successfully");
    Ok(())
}
