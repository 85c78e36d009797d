//! SQLite persistence
//!
//! Candles, optimizer results, orders and fills in a single WAL-mode database
//! behind a mutex. Timestamps are stored as RFC 3339 UTC strings, which sort
//! lexicographically in chronological order.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Months, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use tracing::debug;

use crate::types::{weights_from_named, BacktestMetrics, Candle, ParameterSet};
use crate::upbit::types::{parse_amount, OrderResponse, OrderTrade};

#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        Self::from_connection(conn)
    }

    /// Private throwaway database, for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // WAL keeps the collector and trader from blocking each other
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let storage = SqliteStorage {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.create_tables()?;
        debug!("Database schema created/verified");
        Ok(storage)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS candles (
                timeframe TEXT NOT NULL,
                ts TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                quote_volume REAL,
                PRIMARY KEY (timeframe, ts)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS optimizer_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                weights TEXT NOT NULL,
                threshold REAL NOT NULL,
                final_equity REAL NOT NULL,
                total_return REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                sharpe REAL NOT NULL,
                win_rate REAL NOT NULL,
                num_trades INTEGER NOT NULL,
                is_best INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                uuid TEXT PRIMARY KEY,
                market TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL,
                volume REAL,
                state TEXT NOT NULL,
                identifier TEXT,
                created_at TEXT NOT NULL,
                meta TEXT DEFAULT '{}'
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_uuid TEXT NOT NULL,
                market TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                volume REAL NOT NULL,
                funds REAL NOT NULL,
                slippage REAL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_results_best ON optimizer_results(is_best)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_order ON trades(order_uuid)",
            [],
        )?;

        Ok(())
    }

    /// Insert or refresh candles keyed by (timeframe, timestamp). Re-writing
    /// an existing timestamp replaces the row, so repeated collection of the
    /// same boundary candle is harmless.
    pub fn upsert_candles(&self, timeframe: &str, candles: &[Candle]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO candles (timeframe, ts, open, high, low, close, volume, quote_volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(timeframe, ts) DO UPDATE SET
                   open = excluded.open, high = excluded.high, low = excluded.low,
                   close = excluded.close, volume = excluded.volume,
                   quote_volume = excluded.quote_volume",
            )?;
            for candle in candles {
                written += stmt.execute(params![
                    timeframe,
                    fmt_ts(candle.ts),
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                    candle.quote_volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn latest_candle_ts(&self, timeframe: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let ts: Option<String> = conn.query_row(
            "SELECT MAX(ts) FROM candles WHERE timeframe = ?1",
            params![timeframe],
            |row| row.get(0),
        )?;
        ts.map(|raw| parse_ts(&raw)).transpose()
    }

    /// Candles within the trailing month horizon, ascending by timestamp
    pub fn load_ohlcv(&self, timeframe: &str, months: u32) -> Result<Vec<Candle>> {
        let cutoff = Utc::now()
            .checked_sub_months(Months::new(months))
            .context("history cutoff out of range")?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ts, open, high, low, close, volume, quote_volume FROM candles
             WHERE timeframe = ?1 AND ts >= ?2 ORDER BY ts ASC",
        )?;
        let rows = stmt
            .query_map(params![timeframe, fmt_ts(cutoff)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(ts, open, high, low, close, volume, quote_volume)| {
                Ok(Candle {
                    ts: parse_ts(&ts)?,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    quote_volume,
                })
            })
            .collect()
    }

    /// Most recent closes in ascending order, ready for the signal engine
    pub fn recent_closes(&self, timeframe: &str, limit: usize) -> Result<Vec<f64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT close FROM candles WHERE timeframe = ?1 ORDER BY ts DESC LIMIT ?2")?;
        let mut closes = stmt
            .query_map(params![timeframe, limit as i64], |row| row.get::<_, f64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        closes.reverse();
        Ok(closes)
    }

    /// Append one optimizer result; when it is the new winner, the previous
    /// best flag is cleared in the same transaction so at most one row ever
    /// carries it.
    pub fn save_optimizer_result(
        &self,
        params_set: &ParameterSet,
        metrics: &BacktestMetrics,
        mark_best: bool,
    ) -> Result<()> {
        let weights_json = serde_json::to_string(&params_set.weights)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        if mark_best {
            tx.execute("UPDATE optimizer_results SET is_best = 0 WHERE is_best = 1", [])?;
        }
        tx.execute(
            "INSERT INTO optimizer_results
             (created_at, weights, threshold, final_equity, total_return,
              max_drawdown, sharpe, win_rate, num_trades, is_best)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                fmt_ts(Utc::now()),
                weights_json,
                params_set.threshold,
                metrics.final_equity,
                metrics.total_return,
                metrics.max_drawdown,
                metrics.sharpe,
                metrics.win_rate,
                metrics.num_trades as i64,
                if mark_best { 1 } else { 0 },
            ],
        )?;
        tx.commit()?;
        debug!(best = mark_best, "optimizer result saved");
        Ok(())
    }

    /// Weights and threshold from the current best row, if any. Strategy
    /// names that are no longer known are dropped rather than erroring.
    pub fn best_parameter_set(&self) -> Result<Option<ParameterSet>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT weights, threshold FROM optimizer_results
             WHERE is_best = 1 ORDER BY id DESC LIMIT 1",
        )?;
        let row = stmt.query_row([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        });

        match row {
            Ok((weights_json, threshold)) => {
                let named: BTreeMap<String, f64> =
                    serde_json::from_str(&weights_json).context("decoding stored weights")?;
                let weights = weights_from_named(named.iter().map(|(k, v)| (k.as_str(), *v)));
                Ok(Some(ParameterSet::new(weights, threshold)))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn insert_order(&self, order: &OrderResponse) -> Result<()> {
        let meta = serde_json::to_string(order)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO orders
             (uuid, market, side, price, volume, state, identifier, created_at, meta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                order.uuid,
                order.market,
                order.side.as_str(),
                order.price.as_deref().map(parse_amount),
                order.volume.as_deref().map(parse_amount),
                order.state,
                order.identifier,
                order.created_at,
                meta,
            ],
        )?;
        Ok(())
    }

    pub fn update_order_state(&self, uuid: &str, state: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE orders SET state = ?2 WHERE uuid = ?1",
            params![uuid, state],
        )?;
        Ok(())
    }

    /// Orders we placed that are still marked waiting, with their intended
    /// limit price
    pub fn waiting_orders(&self) -> Result<Vec<(String, Option<f64>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT uuid, price FROM orders WHERE state = 'wait' ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record one fill against an order, with the realized slippage as a
    /// fraction of the intended price
    pub fn insert_trade(&self, order_uuid: &str, trade: &OrderTrade, slippage: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trades
             (order_uuid, market, side, price, volume, funds, slippage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                order_uuid,
                trade.market,
                trade.side.as_str(),
                parse_amount(&trade.price),
                parse_amount(&trade.volume),
                parse_amount(&trade.funds),
                slippage,
                trade.created_at,
            ],
        )?;
        Ok(())
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}
