//! Upbit Ensemble Trader
//!
//! An automated trading system for Upbit KRW markets built around a
//! nine-member voting ensemble. Minute candles land in SQLite, a two-stage
//! grid search tunes the ensemble weights against a path-dependent backtest,
//! and the live trader runs whatever parameters won the last search.
//!
//! ## Example (Market Data)
//! ```no_run
//! use upbit_ensemble::upbit::{ClientConfig, UpbitClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = UpbitClient::new(ClientConfig::default())?;
//!     let candles = client.fetch_minute_candles("KRW-BTC", 1, 200).await?;
//!     println!("Fetched {} candles", candles.len());
//!     Ok(())
//! }
//! ```

pub mod backtest;
pub mod collector;
pub mod config;
pub mod grid;
pub mod optimizer;
pub mod signal;
pub mod storage;
pub mod trader;
pub mod types;
pub mod upbit;

pub use config::Config;
pub use types::*;

pub use upbit::UpbitClient;
