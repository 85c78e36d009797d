//! Live trading command
//!
//! Real orders against the Upbit API. The loop runs one full decision pass
//! per tick and never interrupts a cycle in flight; Ctrl+C stops the loop at
//! the next cycle boundary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tracing::{error, info, warn};

use upbit_ensemble::storage::SqliteStorage;
use upbit_ensemble::trader::Trader;
use upbit_ensemble::upbit::UpbitClient;
use upbit_ensemble::Config;

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
    info!(" UPBIT ENSEMBLE TRADER - LIVE MODE");
    info!(" Market:          {}", config.trading.market);
    info!(" Threshold:       {}", config.trading.threshold);
    info!(" Order TTL:       {}s", config.trading.order_ttl_secs);
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
    let trader = Trader::new(client, storage, &config);

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
    info!("starting trading loop");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = trader.run_once().await {
                    error!(error = %err, "trading cycle failed");
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    info!("trading session ended");
    Ok(())
}
