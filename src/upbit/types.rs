//! Typed payloads for the Upbit REST API
//!
//! Upbit encodes most numeric fields as strings. They stay strings here and
//! are parsed with [`parse_amount`] at the call sites that do arithmetic, so
//! a malformed field degrades to 0.0 instead of failing the whole response.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::types::Candle;

/// Lenient numeric parse for the API's string-encoded amounts
pub fn parse_amount(value: &str) -> f64 {
    value.parse().unwrap_or(0.0)
}

/// One row from `GET /v1/candles/minutes/{unit}`
#[derive(Debug, Clone, Deserialize)]
pub struct MinuteCandle {
    pub market: String,
    pub candle_date_time_utc: String,
    pub opening_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub trade_price: f64,
    pub candle_acc_trade_price: f64,
    pub candle_acc_trade_volume: f64,
}

impl MinuteCandle {
    /// Convert to the internal candle shape. The API timestamp carries no
    /// zone suffix and is defined to be UTC.
    pub fn to_candle(&self) -> Result<Candle> {
        let naive =
            NaiveDateTime::parse_from_str(&self.candle_date_time_utc, "%Y-%m-%dT%H:%M:%S")
                .with_context(|| {
                    format!("parsing candle timestamp {:?}", self.candle_date_time_utc)
                })?;
        Ok(Candle {
            ts: naive.and_utc(),
            open: self.opening_price,
            high: self.high_price,
            low: self.low_price,
            close: self.trade_price,
            volume: self.candle_acc_trade_volume,
            quote_volume: Some(self.candle_acc_trade_price),
        })
    }
}

/// One row from `GET /v1/accounts`
#[derive(Debug, Clone, Deserialize)]
pub struct AccountBalance {
    pub currency: String,
    pub balance: String,
    pub locked: String,
    #[serde(default)]
    pub avg_buy_price: String,
    #[serde(default)]
    pub unit_currency: String,
}

impl AccountBalance {
    /// Spendable amount: balance minus locked, floored at zero
    pub fn available(&self) -> f64 {
        (parse_amount(&self.balance) - parse_amount(&self.locked)).max(0.0)
    }
}

/// Order direction in exchange vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Bid,
    Ask,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Bid => "bid",
            OrderSide::Ask => "ask",
        }
    }
}

/// Order acknowledgement, also the row shape of `GET /v1/orders`.
/// Serialization round-trips through the order book's meta column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub uuid: String,
    pub side: OrderSide,
    pub ord_type: String,
    #[serde(default)]
    pub price: Option<String>,
    pub state: String,
    pub market: String,
    pub created_at: String,
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub remaining_volume: Option<String>,
    #[serde(default)]
    pub paid_fee: Option<String>,
    #[serde(default)]
    pub executed_volume: Option<String>,
    #[serde(default)]
    pub trades_count: u32,
    #[serde(default)]
    pub identifier: Option<String>,
}

/// One fill attached to an order detail
#[derive(Debug, Clone, Deserialize)]
pub struct OrderTrade {
    pub market: String,
    pub uuid: String,
    pub price: String,
    pub volume: String,
    pub funds: String,
    pub side: OrderSide,
    pub created_at: String,
}

/// Full order with fills, from `GET /v1/order?uuid=...`
#[derive(Debug, Clone, Deserialize)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: OrderResponse,
    #[serde(default)]
    pub trades: Vec<OrderTrade>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minute_candle_conversion() {
        let json = r#"{
            "market": "KRW-BTC",
            "candle_date_time_utc": "2024-03-01T12:34:00",
            "candle_date_time_kst": "2024-03-01T21:34:00",
            "opening_price": 56000000.0,
            "high_price": 56100000.0,
            "low_price": 55900000.0,
            "trade_price": 56050000.0,
            "timestamp": 1709296440123,
            "candle_acc_trade_price": 123456789.0,
            "candle_acc_trade_volume": 2.345,
            "unit": 1
        }"#;
        let raw: MinuteCandle = serde_json::from_str(json).unwrap();
        let candle = raw.to_candle().unwrap();
        assert_eq!(candle.ts.to_rfc3339(), "2024-03-01T12:34:00+00:00");
        assert_eq!(candle.open, 56_000_000.0);
        assert_eq!(candle.close, 56_050_000.0);
        assert_eq!(candle.quote_volume, Some(123_456_789.0));
        candle.validate().unwrap();
    }

    #[test]
    fn test_account_available_subtracts_locked() {
        let balance = AccountBalance {
            currency: "KRW".to_string(),
            balance: "1000000.5".to_string(),
            locked: "250000.5".to_string(),
            avg_buy_price: "0".to_string(),
            unit_currency: "KRW".to_string(),
        };
        assert_eq!(balance.available(), 750_000.0);

        let overlocked = AccountBalance {
            locked: "2000000".to_string(),
            ..balance
        };
        assert_eq!(overlocked.available(), 0.0);
    }

    #[test]
    fn test_parse_amount_tolerates_garbage() {
        assert_eq!(parse_amount("12.5"), 12.5);
        assert_eq!(parse_amount(""), 0.0);
        assert_eq!(parse_amount("n/a"), 0.0);
    }

    #[test]
    fn test_order_detail_with_fills() {
        let json = r#"{
            "uuid": "9ca023a5-851b-4fec-9f0a-48cd83c2eaae",
            "side": "bid",
            "ord_type": "limit",
            "price": "56000000.0",
            "state": "done",
            "market": "KRW-BTC",
            "created_at": "2024-03-01T12:34:56+09:00",
            "volume": "0.01",
            "remaining_volume": "0.0",
            "reserved_fee": "280.0",
            "paid_fee": "280.0",
            "locked": "0.0",
            "executed_volume": "0.01",
            "trades_count": 1,
            "trades": [{
                "market": "KRW-BTC",
                "uuid": "cdd92199-2897-4e14-9448-f923320408ad",
                "price": "56000000.0",
                "volume": "0.01",
                "funds": "560000.0",
                "side": "bid",
                "created_at": "2024-03-01T12:34:57+09:00"
            }]
        }"#;
        let detail: OrderDetail = serde_json::from_str(json).unwrap();
        assert_eq!(detail.order.state, "done");
        assert_eq!(detail.order.side, OrderSide::Bid);
        assert_eq!(detail.trades.len(), 1);
        assert_eq!(parse_amount(&detail.trades[0].funds), 560_000.0);
    }

    #[test]
    fn test_order_side_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&OrderSide::Bid).unwrap(), "\"bid\"");
        assert_eq!(serde_json::to_string(&OrderSide::Ask).unwrap(), "\"ask\"");
    }
}
