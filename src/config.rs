//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials. Every section has full defaults, so
//! a missing file or a partial file is never an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::backtest::{BacktestOptions, EarlyStop};
use crate::upbit::{ClientConfig, Credentials, DEFAULT_BASE_URL};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    pub collector: CollectorConfig,
    pub optimizer: OptimizerConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load from a JSON file when given, defaults otherwise. Environment
    /// variables always win for API credentials.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_json(&contents)?
            }
            None => Config::default(),
        };

        if let Ok(access_key) = std::env::var("UPBIT_ACCESS_KEY") {
            config.exchange.access_key = Some(access_key);
        }
        if let Ok(secret_key) = std::env::var("UPBIT_SECRET_KEY") {
            config.exchange.secret_key = Some(secret_key);
        }

        Ok(config.validated())
    }

    fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("Failed to parse config JSON")
    }

    /// Out-of-range knobs fall back to their defaults instead of failing
    fn validated(mut self) -> Self {
        let defaults = Config::default();

        if !(self.trading.fee_rate.is_finite() && self.trading.fee_rate >= 0.0) {
            warn!(value = self.trading.fee_rate, "invalid fee_rate, using default");
            self.trading.fee_rate = defaults.trading.fee_rate;
        }
        if !(self.trading.fee_buffer.is_finite() && self.trading.fee_buffer >= 0.0) {
            warn!(value = self.trading.fee_buffer, "invalid fee_buffer, using default");
            self.trading.fee_buffer = defaults.trading.fee_buffer;
        }
        if !(self.trading.threshold.is_finite()
            && self.trading.threshold > 0.0
            && self.trading.threshold <= 1.0)
        {
            warn!(value = self.trading.threshold, "invalid threshold, using default");
            self.trading.threshold = defaults.trading.threshold;
        }
        if !(self.trading.aggressiveness.is_finite() && self.trading.aggressiveness >= 0.0) {
            warn!(
                value = self.trading.aggressiveness,
                "invalid aggressiveness, using default"
            );
            self.trading.aggressiveness = defaults.trading.aggressiveness;
        }
        if self.trading.window < 3 {
            warn!(value = self.trading.window, "signal window too small, using default");
            self.trading.window = defaults.trading.window;
        }
        if !(self.optimizer.initial_cash.is_finite() && self.optimizer.initial_cash > 0.0) {
            warn!(
                value = self.optimizer.initial_cash,
                "invalid initial_cash, using default"
            );
            self.optimizer.initial_cash = defaults.optimizer.initial_cash;
        }
        if !(self.optimizer.top_percent.is_finite()
            && self.optimizer.top_percent > 0.0
            && self.optimizer.top_percent <= 1.0)
        {
            warn!(
                value = self.optimizer.top_percent,
                "invalid top_percent, using default"
            );
            self.optimizer.top_percent = defaults.optimizer.top_percent;
        }
        if self.optimizer.months == 0 {
            warn!("optimizer months must be at least 1, using default");
            self.optimizer.months = defaults.optimizer.months;
        }
        if !(self.optimizer.early_stop_threshold.is_finite()
            && self.optimizer.early_stop_threshold < 0.0)
        {
            warn!(
                value = self.optimizer.early_stop_threshold,
                "invalid early_stop_threshold, using default"
            );
            self.optimizer.early_stop_threshold = defaults.optimizer.early_stop_threshold;
        }

        self
    }

    /// Backtest options implied by the trading and optimizer sections
    pub fn backtest_options(&self) -> BacktestOptions {
        BacktestOptions {
            initial_cash: self.optimizer.initial_cash,
            fee_rate: self.trading.fee_rate,
            fee_buffer: self.trading.fee_buffer,
            aggressiveness: self.trading.aggressiveness,
            window: self.trading.window,
            early_stop: Some(EarlyStop {
                threshold: self.optimizer.early_stop_threshold,
                min_steps: self.optimizer.early_stop_candles,
            }),
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.exchange.access_key, &self.exchange.secret_key) {
            (Some(access), Some(secret)) => Some(Credentials::new(access.clone(), secret.clone())),
            _ => None,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_base_url(self.exchange.base_url.clone())
            .with_timeout(self.exchange.timeout_secs)
            .with_max_retries(self.exchange.max_retries)
            .with_request_interval(Duration::from_millis(self.exchange.rate_limit_ms))
    }
}

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Minimum milliseconds between consecutive API requests
    pub rate_limit_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            access_key: None,
            secret_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 10,
            max_retries: 3,
            rate_limit_ms: 120,
        }
    }
}

/// Trading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub market: String,
    /// Ensemble score magnitude required to act
    pub threshold: f64,
    /// Fractional price offset toward the market when placing limit orders
    pub aggressiveness: f64,
    pub fee_rate: f64,
    pub fee_buffer: f64,
    /// Signal lookback in closes
    pub window: usize,
    /// Open orders older than this are cancelled before the next decision
    pub order_ttl_secs: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            market: "KRW-BTC".to_string(),
            threshold: 0.2,
            aggressiveness: 0.0015, // 0.15%
            fee_rate: 0.0005,       // 0.05%
            fee_buffer: 0.0005,
            window: 200,
            order_ttl_secs: 300,
        }
    }
}

/// Candle collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Candle timeframe in minutes
    pub unit: u32,
    /// Candles requested per fetch
    pub count: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig { unit: 1, count: 200 }
    }
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub initial_cash: f64,
    /// Months of history fed into each optimization cycle
    pub months: u32,
    pub coarse_step: f64,
    pub fine_step: f64,
    /// Fraction of coarse results refined in the fine stage
    pub top_percent: f64,
    /// Threshold candidates; empty means the default ladder
    pub thresholds: Vec<f64>,
    pub early_stop_threshold: f64,
    pub early_stop_candles: usize,
    /// Worker threads for evaluation; 0 means one per core
    pub threads: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            initial_cash: 1_000_000.0,
            months: 3,
            coarse_step: 0.1,
            fine_step: 0.05,
            top_percent: 0.1,
            thresholds: Vec::new(),
            early_stop_threshold: -0.3,
            early_stop_candles: 1440, // one day of minutes
            threads: 0,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    pub timeframe: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: "data/trading.db".to_string(),
            timeframe: "minute1".to_string(),
        }
    }
}
