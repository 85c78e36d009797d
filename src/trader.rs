//! Live trading pass.
//!
//! Each pass reconciles order state with the exchange, scores the most recent
//! closes with the tuned ensemble weights, and places at most one limit order.
//! Buys spend the whole KRW balance and sells liquidate the whole position.
//! Balances and open orders are always read back from the exchange, so a
//! restart loses nothing.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backtest::floor_to_lot;
use crate::config::{Config, TradingConfig};
use crate::signal::{ensemble_signal, fallback_weights};
use crate::storage::SqliteStorage;
use crate::types::ParameterSet;
use crate::upbit::types::{parse_amount, OrderResponse, OrderSide};
use crate::upbit::{round_to_tick, TickRounding, UpbitClient, MIN_ORDER_NOTIONAL_KRW};

/// What a score demands at the current threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

pub fn decide(score: f64, threshold: f64) -> Action {
    if score >= threshold {
        Action::Buy
    } else if score <= -threshold {
        Action::Sell
    } else {
        Action::Hold
    }
}

pub struct Trader {
    client: UpbitClient,
    storage: SqliteStorage,
    trading: TradingConfig,
    timeframe: String,
}

impl Trader {
    pub fn new(client: UpbitClient, storage: SqliteStorage, config: &Config) -> Self {
        Self {
            client,
            storage,
            trading: config.trading.clone(),
            timeframe: config.storage.timeframe.clone(),
        }
    }

    /// One full decision pass.
    pub async fn run_once(&self) -> Result<()> {
        self.reconcile_orders().await?;

        let closes = self
            .storage
            .recent_closes(&self.timeframe, self.trading.window)?;
        if closes.len() < self.trading.window {
            warn!(
                have = closes.len(),
                want = self.trading.window,
                "not enough stored candles, holding"
            );
            return Ok(());
        }
        let last_close = match closes.last() {
            Some(close) => *close,
            None => return Ok(()),
        };

        let params = self.parameters()?;
        let score = ensemble_signal(&closes, &params.weights);
        debug!(score, threshold = params.threshold, last_close, "ensemble score");

        match decide(score, params.threshold) {
            Action::Buy => self.try_buy(last_close, score).await,
            Action::Sell => self.try_sell(last_close, score).await,
            Action::Hold => Ok(()),
        }
    }

    /// Tuned weights from the last optimizer winner under the configured live
    /// threshold, or the static fallback ensemble before the first run.
    fn parameters(&self) -> Result<ParameterSet> {
        match self.storage.best_parameter_set()? {
            Some(best) => Ok(ParameterSet::new(best.weights, self.trading.threshold)),
            None => {
                debug!("no optimizer result yet, using fallback weights");
                Ok(ParameterSet::new(fallback_weights(), self.trading.threshold))
            }
        }
    }

    async fn try_buy(&self, last_close: f64, score: f64) -> Result<()> {
        let (cash, _) = self.balances().await?;
        let (price, volume) = match size_buy(cash, last_close, &self.trading) {
            Some(sized) => sized,
            None => {
                debug!(cash, "buy signal but nothing to spend");
                return Ok(());
            }
        };
        let order = self.place(OrderSide::Bid, price, volume).await?;
        info!(uuid = %order.uuid, price, volume, score, "buy order placed");
        Ok(())
    }

    async fn try_sell(&self, last_close: f64, score: f64) -> Result<()> {
        let (_, position) = self.balances().await?;
        let (price, volume) = match size_sell(position, last_close, &self.trading) {
            Some(sized) => sized,
            None => {
                debug!(position, "sell signal but nothing to liquidate");
                return Ok(());
            }
        };
        let order = self.place(OrderSide::Ask, price, volume).await?;
        info!(uuid = %order.uuid, price, volume, score, "sell order placed");
        Ok(())
    }

    async fn place(&self, side: OrderSide, price: f64, volume: f64) -> Result<OrderResponse> {
        let identifier = Uuid::new_v4().to_string();
        let order = self
            .client
            .place_limit_order(&self.trading.market, side, price, volume, &identifier)
            .await?;
        self.storage.insert_order(&order)?;
        Ok(order)
    }

    /// Available quote currency (cash) and base currency (position).
    async fn balances(&self) -> Result<(f64, f64)> {
        let accounts = self.client.fetch_accounts().await?;
        let (quote, base) = split_market(&self.trading.market);
        let cash = accounts
            .iter()
            .find(|account| account.currency == quote)
            .map(|account| account.available())
            .unwrap_or(0.0);
        let position = accounts
            .iter()
            .find(|account| account.currency == base)
            .map(|account| account.available())
            .unwrap_or(0.0);
        Ok((cash, position))
    }

    /// Cancels open orders past their time to live, then records the final
    /// state and fills of orders that left the book since the last pass.
    /// Cancelled orders stay waiting locally until the sweep sees them gone,
    /// so a cancel with a partial fill still gets its trades recorded.
    async fn reconcile_orders(&self) -> Result<()> {
        let open = self.client.fetch_open_orders(&self.trading.market).await?;
        let now = Utc::now();
        for order in &open {
            match order_age_secs(&order.created_at, now) {
                Some(age) if age >= self.trading.order_ttl_secs as i64 => {
                    info!(uuid = %order.uuid, age, "cancelling stale order");
                    self.client.cancel_order(&order.uuid).await?;
                }
                Some(_) => {}
                None => {
                    warn!(
                        uuid = %order.uuid,
                        created_at = %order.created_at,
                        "unreadable order timestamp"
                    );
                }
            }
        }

        let on_book: HashSet<&str> = open.iter().map(|order| order.uuid.as_str()).collect();
        for (uuid, intended) in self.storage.waiting_orders()? {
            if on_book.contains(uuid.as_str()) {
                continue;
            }
            let detail = self.client.fetch_order(&uuid).await?;
            self.storage.update_order_state(&uuid, &detail.order.state)?;
            for trade in &detail.trades {
                let fill = parse_amount(&trade.price);
                let slippage = match intended {
                    Some(intended) if intended > 0.0 => fill / intended - 1.0,
                    _ => 0.0,
                };
                self.storage.insert_trade(&uuid, trade, slippage)?;
            }
            info!(
                uuid = %uuid,
                state = %detail.order.state,
                fills = detail.trades.len(),
                "order settled"
            );
        }
        Ok(())
    }
}

/// Limit price and size for a buy spending the whole cash balance, or None
/// when the order would sit under the exchange minimum
fn size_buy(cash: f64, last_close: f64, trading: &TradingConfig) -> Option<(f64, f64)> {
    if cash <= MIN_ORDER_NOTIONAL_KRW {
        return None;
    }
    let price = round_to_tick(last_close * (1.0 + trading.aggressiveness), TickRounding::Up);
    let volume = floor_to_lot(cash / (price * (1.0 + trading.fee_rate + trading.fee_buffer)));
    if volume > 0.0 && price * volume > MIN_ORDER_NOTIONAL_KRW {
        Some((price, volume))
    } else {
        None
    }
}

/// Limit price and size liquidating the whole position, or None when the
/// proceeds would sit under the exchange minimum
fn size_sell(position: f64, last_close: f64, trading: &TradingConfig) -> Option<(f64, f64)> {
    if position <= 0.0 {
        return None;
    }
    let price = round_to_tick(last_close * (1.0 - trading.aggressiveness), TickRounding::Down);
    let volume = floor_to_lot(position);
    if volume > 0.0 && price * volume > MIN_ORDER_NOTIONAL_KRW {
        Some((price, volume))
    } else {
        None
    }
}

/// Splits "KRW-BTC" into its quote and base currencies
fn split_market(market: &str) -> (&str, &str) {
    match market.split_once('-') {
        Some((quote, base)) => (quote, base),
        None => (market, market),
    }
}

/// Age of an exchange order in seconds, None when its timestamp is unreadable
fn order_age_secs(created_at: &str, now: DateTime<Utc>) -> Option<i64> {
    match DateTime::parse_from_rfc3339(created_at) {
        Ok(created) => Some((now - created.with_timezone(&Utc)).num_seconds()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BacktestMetrics, StrategyKey, Weights};
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn trading() -> TradingConfig {
        TradingConfig::default()
    }

    #[test]
    fn test_decide_boundaries() {
        assert_eq!(decide(0.2, 0.2), Action::Buy);
        assert_eq!(decide(0.3, 0.2), Action::Buy);
        assert_eq!(decide(-0.2, 0.2), Action::Sell);
        assert_eq!(decide(-0.5, 0.2), Action::Sell);
        assert_eq!(decide(0.19, 0.2), Action::Hold);
        assert_eq!(decide(-0.19, 0.2), Action::Hold);
        assert_eq!(decide(0.0, 0.2), Action::Hold);
    }

    #[test]
    fn test_size_buy_spends_whole_balance() {
        let (price, volume) = size_buy(1_000_000.0, 100.0, &trading()).unwrap();
        assert_eq!(price, 101.0);
        assert_relative_eq!(volume, 9_891.099, max_relative = 1e-12);
        // the fill plus its fee must still fit inside the cash balance
        assert!(price * volume * (1.0 + 0.0005 + 0.0005) <= 1_000_000.0);
    }

    #[test]
    fn test_size_buy_skips_dust() {
        assert!(size_buy(4_000.0, 100.0, &trading()).is_none());

        // clears the cash gate but the resulting notional lands under it
        let mut config = trading();
        config.aggressiveness = 0.0;
        assert!(size_buy(5_005.0, 105.0, &config).is_none());
    }

    #[test]
    fn test_size_sell_liquidates_position() {
        let (price, volume) = size_sell(100.0, 100.0, &trading()).unwrap();
        assert_relative_eq!(price, 99.8, max_relative = 1e-12);
        assert_eq!(volume, 100.0);
    }

    #[test]
    fn test_size_sell_skips_dust() {
        assert!(size_sell(0.0, 100.0, &trading()).is_none());
        assert!(size_sell(0.04, 100.0, &trading()).is_none());
    }

    #[test]
    fn test_split_market() {
        assert_eq!(split_market("KRW-BTC"), ("KRW", "BTC"));
        assert_eq!(split_market("KRW-ETH"), ("KRW", "ETH"));
        assert_eq!(split_market("BTCKRW"), ("BTCKRW", "BTCKRW"));
    }

    #[test]
    fn test_order_age() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 10, 0).unwrap();
        assert_eq!(order_age_secs("2024-06-01T09:00:00+09:00", now), Some(600));
        assert_eq!(order_age_secs("garbage", now), None);
    }

    #[test]
    fn test_parameters_fall_back_without_optimizer_run() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let config = Config::default();
        let client = UpbitClient::new(config.client_config()).unwrap();
        let trader = Trader::new(client, storage, &config);

        let params = trader.parameters().unwrap();
        assert_eq!(params.threshold, config.trading.threshold);
        assert_eq!(params.weights, fallback_weights());
    }

    #[test]
    fn test_parameters_use_stored_winner_with_live_threshold() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut weights = Weights::new();
        weights.insert(StrategyKey::Trend, 1.0);
        let tuned = ParameterSet::new(weights.clone(), 0.35);
        storage
            .save_optimizer_result(&tuned, &BacktestMetrics::default(), true)
            .unwrap();

        let config = Config::default();
        let client = UpbitClient::new(config.client_config()).unwrap();
        let trader = Trader::new(client, storage, &config);

        let chosen = trader.parameters().unwrap();
        assert_eq!(chosen.weights, weights);
        // the live threshold stays the configured one, not the tuned row's
        assert_eq!(chosen.threshold, config.trading.threshold);
    }
}
