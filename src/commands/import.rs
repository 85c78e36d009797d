//! CSV import command
//!
//! Loads candles from a headered CSV file with ts,open,high,low,close,volume
//! columns (and an optional seventh quote-volume column) and upserts them
//! into storage under the configured timeframe.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{info, warn};

use upbit_ensemble::storage::SqliteStorage;
use upbit_ensemble::types::Candle;
use upbit_ensemble::Config;

pub fn run(
    file: PathBuf,
    config_path: Option<PathBuf>,
    timeframe_override: Option<String>,
) -> Result<()> {
    info!("Starting import from {}", file.display());

    let config = Config::load(config_path.as_deref())?;
    let timeframe = timeframe_override.unwrap_or_else(|| config.storage.timeframe.clone());

    let input = File::open(&file).with_context(|| format!("opening {}", file.display()))?;
    let candles = read_candles(input)?;
    if candles.is_empty() {
        println!("No valid candles found in {}", file.display());
        return Ok(());
    }

    let storage = SqliteStorage::open(&config.storage.path)?;
    let written = storage.upsert_candles(&timeframe, &candles)?;

    println!(
        "Imported {} candles into {} ({})",
        written, config.storage.path, timeframe
    );

    info!("Import completed successfully");
    Ok(())
}

fn read_candles(input: impl std::io::Read) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_reader(input);

    let mut candles = Vec::new();
    let mut invalid_count = 0;

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("reading row {}", row_idx + 1))?;

        let ts_str = record.get(0).context("missing ts column")?;
        let ts = parse_ts(ts_str)
            .with_context(|| format!("parsing timestamp {:?} at row {}", ts_str, row_idx + 2))?;

        let open: f64 = record
            .get(1)
            .context("missing open column")?
            .parse()
            .context("parsing open")?;
        let high: f64 = record
            .get(2)
            .context("missing high column")?
            .parse()
            .context("parsing high")?;
        let low: f64 = record
            .get(3)
            .context("missing low column")?
            .parse()
            .context("parsing low")?;
        let close: f64 = record
            .get(4)
            .context("missing close column")?
            .parse()
            .context("parsing close")?;
        let volume: f64 = record
            .get(5)
            .context("missing volume column")?
            .parse()
            .context("parsing volume")?;
        let quote_volume: Option<f64> = record.get(6).and_then(|raw| raw.parse().ok());

        let candle = Candle {
            ts,
            open,
            high,
            low,
            close,
            volume,
            quote_volume,
        };
        match candle.validate() {
            Ok(()) => candles.push(candle),
            Err(err) => {
                invalid_count += 1;
                // +2 accounts for 1-indexing plus the header row
                warn!("Skipping invalid candle at row {}: {}", row_idx + 2, err);
            }
        }
    }

    if invalid_count > 0 {
        warn!("Skipped {} invalid rows", invalid_count);
    }
    candles.sort_by_key(|candle| candle.ts);
    Ok(candles)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = raw.parse::<DateTime<Utc>>() {
        return Ok(ts);
    }
    // Timezone-less exports are assumed UTC
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}
