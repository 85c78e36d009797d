//! Async REST client for Upbit
//!
//! Public candle quotes plus authenticated account/order calls, with
//! per-attempt request spacing and exponential-backoff retries. Prices and
//! volumes are rendered through decimal arithmetic so no float noise ever
//! reaches the wire.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::warn;

use super::auth::Credentials;
use super::tick::tick_size;
use super::types::{AccountBalance, MinuteCandle, OrderDetail, OrderResponse, OrderSide};

pub const DEFAULT_BASE_URL: &str = "https://api.upbit.com";

/// The API never returns more than this many candles per call
const MAX_CANDLE_COUNT: u32 = 200;

/// Client tuning knobs
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Minimum spacing between consecutive requests, shared by all calls
    pub min_request_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 10,
            max_retries: 3,
            min_request_interval: Duration::from_millis(120),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval = interval;
        self
    }
}

/// Serializes request starts so a retry storm cannot hammer the API
struct RequestSpacer {
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RequestSpacer {
    fn new(min_interval: Duration) -> Self {
        RequestSpacer {
            min_interval,
            last_start: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut last = self.last_start.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Clone)]
pub struct UpbitClient {
    config: ClientConfig,
    http: reqwest::Client,
    credentials: Option<Credentials>,
    spacer: Arc<RequestSpacer>,
}

impl UpbitClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building HTTP client")?;
        let spacer = Arc::new(RequestSpacer::new(config.min_request_interval));
        Ok(UpbitClient {
            config,
            http,
            credentials: None,
            spacer,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn credentials(&self) -> Result<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| anyhow!("API credentials not configured"))
    }

    /// Latest minute candles, newest first as the API returns them
    pub async fn fetch_minute_candles(
        &self,
        market: &str,
        unit: u32,
        count: u32,
    ) -> Result<Vec<MinuteCandle>> {
        let url = format!("{}/v1/candles/minutes/{}", self.config.base_url, unit);
        let count = count.min(MAX_CANDLE_COUNT).to_string();
        self.execute_with_retry("fetch_minute_candles", || async {
            let response = self
                .http
                .get(&url)
                .query(&[("market", market), ("count", count.as_str())])
                .send()
                .await
                .context("requesting candles")?;
            Self::check_json(response).await
        })
        .await
    }

    /// All account balances
    pub async fn fetch_accounts(&self) -> Result<Vec<AccountBalance>> {
        let creds = self.credentials()?;
        let url = format!("{}/v1/accounts", self.config.base_url);
        self.execute_with_retry("fetch_accounts", || async {
            let token = creds.bearer_token(None)?;
            let response = self
                .http
                .get(&url)
                .header("Authorization", token)
                .send()
                .await
                .context("requesting accounts")?;
            Self::check_json(response).await
        })
        .await
    }

    /// Place a limit order. The price is quantized onto the KRW grid and the
    /// volume truncated to 8 decimals before anything goes on the wire. The
    /// caller-supplied identifier doubles as the idempotency key should a
    /// retry race a lost acknowledgement.
    pub async fn place_limit_order(
        &self,
        market: &str,
        side: OrderSide,
        price: f64,
        volume: f64,
        identifier: &str,
    ) -> Result<OrderResponse> {
        let creds = self.credentials()?;
        let url = format!("{}/v1/orders", self.config.base_url);
        // Field order must match between the signed hash and the form body.
        // Every value is URL-safe by construction.
        let query = format!(
            "identifier={}&market={}&ord_type=limit&price={}&side={}&volume={}",
            identifier,
            market,
            format_price(price),
            side.as_str(),
            format_volume(volume),
        );
        self.execute_with_retry("place_limit_order", || async {
            let token = creds.bearer_token(Some(&query))?;
            let response = self
                .http
                .post(&url)
                .header("Authorization", token)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(query.clone())
                .send()
                .await
                .context("submitting order")?;
            Self::check_json(response).await
        })
        .await
    }

    /// One order with its fills
    pub async fn fetch_order(&self, uuid: &str) -> Result<OrderDetail> {
        let creds = self.credentials()?;
        let query = format!("uuid={}", uuid);
        let url = format!("{}/v1/order?{}", self.config.base_url, query);
        self.execute_with_retry("fetch_order", || async {
            let token = creds.bearer_token(Some(&query))?;
            let response = self
                .http
                .get(&url)
                .header("Authorization", token)
                .send()
                .await
                .context("requesting order detail")?;
            Self::check_json(response).await
        })
        .await
    }

    /// Orders still waiting in the book for a market
    pub async fn fetch_open_orders(&self, market: &str) -> Result<Vec<OrderResponse>> {
        let creds = self.credentials()?;
        let query = format!("market={}&state=wait", market);
        let url = format!("{}/v1/orders?{}", self.config.base_url, query);
        self.execute_with_retry("fetch_open_orders", || async {
            let token = creds.bearer_token(Some(&query))?;
            let response = self
                .http
                .get(&url)
                .header("Authorization", token)
                .send()
                .await
                .context("requesting open orders")?;
            Self::check_json(response).await
        })
        .await
    }

    /// Cancel a waiting order
    pub async fn cancel_order(&self, uuid: &str) -> Result<OrderResponse> {
        let creds = self.credentials()?;
        let query = format!("uuid={}", uuid);
        let url = format!("{}/v1/order?{}", self.config.base_url, query);
        self.execute_with_retry("cancel_order", || async {
            let token = creds.bearer_token(Some(&query))?;
            let response = self
                .http
                .delete(&url)
                .header("Authorization", token)
                .send()
                .await
                .context("cancelling order")?;
            Self::check_json(response).await
        })
        .await
    }

    async fn execute_with_retry<T, F, Fut>(&self, label: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(500 * (1 << (attempt - 1)));
                sleep(backoff).await;
            }
            self.spacer.wait().await;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        "{} failed: {:#}",
                        label,
                        err
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(match last_error {
            Some(err) => err.context(format!(
                "{} failed after {} attempts",
                label,
                self.config.max_retries + 1
            )),
            None => anyhow!("{} failed", label),
        })
    }

    async fn check_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("API returned {}: {}", status, body);
        }
        response.json::<T>().await.context("decoding API response")
    }
}

/// Render a limit price as the exchange expects it: quantized down onto the
/// KRW grid, no trailing zeros, no float noise
pub fn format_price(price: f64) -> String {
    let tick = tick_decimal(price);
    // grid-aligned inputs may sit a few ulps off their decimal value
    let count = ((price / tick_size(price)) + 1e-9).floor();
    (Decimal::from_f64(count).unwrap_or_default() * tick)
        .normalize()
        .to_string()
}

/// Render an order volume truncated to the exchange's 8 decimal places
pub fn format_volume(volume: f64) -> String {
    Decimal::from_f64(volume)
        .unwrap_or_default()
        .round_dp_with_strategy(8, RoundingStrategy::ToZero)
        .normalize()
        .to_string()
}

fn tick_decimal(price: f64) -> Decimal {
    if price >= 2_000_000.0 {
        dec!(1000)
    } else if price >= 1_000_000.0 {
        dec!(500)
    } else if price >= 500_000.0 {
        dec!(100)
    } else if price >= 100_000.0 {
        dec!(50)
    } else if price >= 10_000.0 {
        dec!(10)
    } else if price >= 1_000.0 {
        dec!(5)
    } else if price >= 100.0 {
        dec!(1)
    } else if price >= 10.0 {
        dec!(0.1)
    } else {
        dec!(0.01)
    }
}
