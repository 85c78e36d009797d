//! Minute candle collection.
//!
//! One pass pulls the most recent candles from the exchange and upserts them
//! into storage. The candle sitting on the stored boundary is written again on
//! purpose: its close keeps moving until the minute ends, and the upsert
//! refreshes it in place. Only candles strictly past the boundary count as new.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::storage::SqliteStorage;
use crate::types::Candle;
use crate::upbit::UpbitClient;

pub struct Collector {
    client: UpbitClient,
    storage: SqliteStorage,
    market: String,
    timeframe: String,
    unit: u32,
    count: u32,
}

impl Collector {
    pub fn new(client: UpbitClient, storage: SqliteStorage, config: &Config) -> Self {
        Self {
            client,
            storage,
            market: config.trading.market.clone(),
            timeframe: config.storage.timeframe.clone(),
            unit: config.collector.unit,
            count: config.collector.count,
        }
    }

    /// Runs one collection pass and returns the number of strictly new
    /// candles. When nothing new arrived the exchange may simply be lagging
    /// the minute boundary, so the pass is retried once after a short pause.
    pub async fn run_once(&self) -> Result<usize> {
        let new = self.collect().await?;
        if new > 0 {
            return Ok(new);
        }
        debug!(market = %self.market, "no new candles, retrying once");
        sleep(Duration::from_secs(1)).await;
        self.collect().await
    }

    async fn collect(&self) -> Result<usize> {
        let fetched = self
            .client
            .fetch_minute_candles(&self.market, self.unit, self.count)
            .await?;

        let candles: Vec<Candle> = fetched
            .iter()
            .map(|raw| raw.to_candle())
            .filter_map(|result| match result {
                Ok(candle) => Some(candle),
                Err(err) => {
                    warn!(error = %err, market = %self.market, "dropping malformed candle");
                    None
                }
            })
            .filter(|candle| match candle.validate() {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, market = %self.market, "dropping invalid candle");
                    false
                }
            })
            .collect();

        let boundary = self.storage.latest_candle_ts(&self.timeframe)?;
        let (fresh, new) = split_at_boundary(candles, boundary);
        if fresh.is_empty() {
            return Ok(0);
        }

        let written = self.storage.upsert_candles(&self.timeframe, &fresh)?;
        info!(
            market = %self.market,
            timeframe = %self.timeframe,
            written,
            new,
            "candles collected"
        );
        Ok(new)
    }
}

/// Keeps candles at or after the stored boundary, sorted ascending. The
/// boundary candle itself is kept so its still-forming close gets refreshed;
/// the returned count covers only candles strictly past it.
fn split_at_boundary(
    mut candles: Vec<Candle>,
    boundary: Option<DateTime<Utc>>,
) -> (Vec<Candle>, usize) {
    candles.sort_by_key(|candle| candle.ts);
    match boundary {
        Some(boundary) => {
            let fresh: Vec<Candle> = candles
                .into_iter()
                .filter(|candle| candle.ts >= boundary)
                .collect();
            let new = fresh.iter().filter(|candle| candle.ts > boundary).count();
            (fresh, new)
        }
        None => {
            let new = candles.len();
            (candles, new)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn candle_at(minute: i64) -> Candle {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Candle {
            ts: base + ChronoDuration::minutes(minute),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1.0,
            quote_volume: Some(100.5),
        }
    }

    #[test]
    fn test_empty_store_keeps_everything() {
        let candles = vec![candle_at(2), candle_at(0), candle_at(1)];
        let (fresh, new) = split_at_boundary(candles, None);
        assert_eq!(fresh.len(), 3);
        assert_eq!(new, 3);
        assert!(fresh.windows(2).all(|pair| pair[0].ts < pair[1].ts));
    }

    #[test]
    fn test_boundary_candle_is_refreshed_not_counted() {
        let candles = vec![candle_at(0), candle_at(1), candle_at(2), candle_at(3)];
        let boundary = candle_at(2).ts;
        let (fresh, new) = split_at_boundary(candles, Some(boundary));
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].ts, boundary);
        assert_eq!(new, 1);
    }

    #[test]
    fn test_all_stale_yields_nothing() {
        let candles = vec![candle_at(0), candle_at(1)];
        let boundary = candle_at(5).ts;
        let (fresh, new) = split_at_boundary(candles, Some(boundary));
        assert!(fresh.is_empty());
        assert_eq!(new, 0);
    }

    #[test]
    fn test_only_boundary_present_counts_zero_new() {
        let candles = vec![candle_at(4)];
        let boundary = candle_at(4).ts;
        let (fresh, new) = split_at_boundary(candles, Some(boundary));
        assert_eq!(fresh.len(), 1);
        assert_eq!(new, 0);
    }
}
