//! Candle collection command

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::interval;
use tracing::{error, info};

use upbit_ensemble::collector::Collector;
use upbit_ensemble::storage::SqliteStorage;
use upbit_ensemble::upbit::UpbitClient;
use upbit_ensemble::Config;

pub fn run(config_path: Option<PathBuf>, interval_secs: u64, once: bool) -> Result<()> {
    let config = Config::load(config_path.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(run_async(config, interval_secs, once))
}

async fn run_async(config: Config, interval_secs: u64, once: bool) -> Result<()> {
    let storage = SqliteStorage::open(&config.storage.path)?;
    let client = UpbitClient::new(config.client_config())?;
    let collector = Collector::new(client, storage, &config);

    if once {
        let new = collector.run_once().await?;
        info!(new, "collection pass finished");
        return Ok(());
    }

    info!(
        market = %config.trading.market,
        interval_secs,
        "starting collection loop"
    );

    let mut ticker = interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = collector.run_once().await {
                    error!(error = %err, "collection pass failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down collector");
                break;
            }
        }
    }
    Ok(())
}
