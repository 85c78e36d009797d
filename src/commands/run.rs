//! Combined collect-and-trade command
//!
//! One loop that pulls fresh candles and then makes a trading decision on
//! them, so a single process keeps the data and the position current. A
//! weight optimization runs once a day on a blocking worker so the
//! collect/trade cadence keeps ticking while the grid search grinds.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};
use tracing::{error, info, warn};

use upbit_ensemble::collector::Collector;
use upbit_ensemble::optimizer::{Evaluation, TwoStageOptimizer};
use upbit_ensemble::storage::SqliteStorage;
use upbit_ensemble::trader::Trader;
use upbit_ensemble::upbit::UpbitClient;
use upbit_ensemble::Config;

const OPTIMIZE_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

pub fn run(config_path: Option<PathBuf>, interval_secs: u64, yes: bool) -> Result<()> {
    let config = Config::load(config_path.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(run_async(config, interval_secs, yes))
}

async fn run_async(config: Config, interval_secs: u64, yes: bool) -> Result<()> {
    let credentials = match config.credentials() {
        Some(credentials) => credentials,
        None => anyhow::bail!("trading requires UPBIT_ACCESS_KEY and UPBIT_SECRET_KEY"),
    };

    info!("==================================================");
    info!(" UPBIT ENSEMBLE TRADER - COLLECT + TRADE");
    info!(" Market:          {}", config.trading.market);
    info!(" Threshold:       {}", config.trading.threshold);
    info!(" Cycle interval:  {}s", interval_secs);
    info!("==================================================");

    if !yes {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 5 seconds to abort...");
        for i in (1..=5).rev() {
            info!("Starting in {} seconds...", i);
            sleep(Duration::from_secs(1)).await;
        }
    }

    let storage = SqliteStorage::open(&config.storage.path)?;
    let client = UpbitClient::new(config.client_config())?.with_credentials(credentials);
    let collector = Collector::new(client.clone(), storage.clone(), &config);
    let trader = Trader::new(client, storage.clone(), &config);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, stopping after the current cycle");
                shutdown_flag.store(true, Ordering::SeqCst);
                let _ = shutdown_tx.send(()).await;
            }
            Err(err) => error!(error = %err, "signal handler failed"),
        }
    });

    let mut ticker = interval(Duration::from_secs(interval_secs));
    let mut last_optimized: Option<Instant> = None;
    let mut optimize_task: Option<JoinHandle<Result<Option<Evaluation>>>> = None;

    info!("starting combined loop");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }

                if let Err(err) = collector.run_once().await {
                    error!(error = %err, "collection pass failed");
                    continue;
                }
                if let Err(err) = trader.run_once().await {
                    error!(error = %err, "trading cycle failed");
                }

                if optimize_task.as_ref().is_some_and(|task| task.is_finished()) {
                    if let Some(task) = optimize_task.take() {
                        report_optimize_outcome(task.await);
                    }
                }

                let due = last_optimized
                    .map_or(true, |at| at.elapsed() >= OPTIMIZE_EVERY);
                if due && optimize_task.is_none() {
                    info!("starting scheduled optimizer cycle");
                    last_optimized = Some(Instant::now());
                    let storage = storage.clone();
                    let config = config.clone();
                    optimize_task = Some(tokio::task::spawn_blocking(move || {
                        TwoStageOptimizer::new(storage, &config).run()
                    }));
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    if let Some(task) = optimize_task {
        info!("waiting for the running optimizer cycle to finish");
        report_optimize_outcome(task.await);
    }

    info!("session ended");
    Ok(())
}

fn report_optimize_outcome(
    outcome: std::result::Result<Result<Option<Evaluation>>, tokio::task::JoinError>,
) {
    match outcome {
        Ok(Ok(Some(winner))) => info!(
            total_return = winner.metrics.total_return,
            sharpe = winner.metrics.sharpe,
            "optimizer refreshed the tuned weights"
        ),
        Ok(Ok(None)) => info!("optimizer cycle skipped, not enough stored history"),
        Ok(Err(err)) => error!(error = %err, "optimizer cycle failed"),
        Err(err) => error!(error = %err, "optimizer task aborted"),
    }
}
