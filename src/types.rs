//! Core data types shared across the trading system

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Accumulated quote-currency volume, when the source provides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_volume: Option<f64>,
}

/// Validation failure for a single candle
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("non-finite field in candle at {ts}")]
    NonFinite { ts: DateTime<Utc> },
    #[error("high {high} below low {low} in candle at {ts}")]
    HighBelowLow { ts: DateTime<Utc>, high: f64, low: f64 },
    #[error("non-positive price in candle at {ts}")]
    NonPositivePrice { ts: DateTime<Utc> },
}

impl Candle {
    /// Sanity checks applied at data boundaries (CSV import, exchange responses)
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(CandleValidationError::NonFinite { ts: self.ts });
        }
        if self.high < self.low {
            return Err(CandleValidationError::HighBelowLow {
                ts: self.ts,
                high: self.high,
                low: self.low,
            });
        }
        if self.open <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice { ts: self.ts });
        }
        Ok(())
    }
}

/// The fixed set of ensemble member strategies
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKey {
    Trend,
    Momentum,
    Swing,
    Scalping,
    Day,
    PriceAction,
    Rsi,
    Bollinger,
    Macd,
}

impl StrategyKey {
    /// All members, in display order
    pub const ALL: [StrategyKey; 9] = [
        StrategyKey::Trend,
        StrategyKey::Momentum,
        StrategyKey::Swing,
        StrategyKey::Scalping,
        StrategyKey::Day,
        StrategyKey::PriceAction,
        StrategyKey::Rsi,
        StrategyKey::Bollinger,
        StrategyKey::Macd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKey::Trend => "trend",
            StrategyKey::Momentum => "momentum",
            StrategyKey::Swing => "swing",
            StrategyKey::Scalping => "scalping",
            StrategyKey::Day => "day",
            StrategyKey::PriceAction => "price_action",
            StrategyKey::Rsi => "rsi",
            StrategyKey::Bollinger => "bollinger",
            StrategyKey::Macd => "macd",
        }
    }
}

impl FromStr for StrategyKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trend" => Ok(StrategyKey::Trend),
            "momentum" => Ok(StrategyKey::Momentum),
            "swing" => Ok(StrategyKey::Swing),
            "scalping" => Ok(StrategyKey::Scalping),
            "day" => Ok(StrategyKey::Day),
            "price_action" => Ok(StrategyKey::PriceAction),
            "rsi" => Ok(StrategyKey::Rsi),
            "bollinger" => Ok(StrategyKey::Bollinger),
            "macd" => Ok(StrategyKey::Macd),
            other => Err(format!("unknown strategy key: {}", other)),
        }
    }
}

impl std::fmt::Display for StrategyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-strategy ensemble weights. BTreeMap keeps iteration order deterministic,
/// which the grid dedup and result display rely on.
pub type Weights = BTreeMap<StrategyKey, f64>;

/// Build weights from loosely-typed (name, value) pairs. Names that do not map
/// to a known strategy are dropped, so historical rows with retired strategies
/// still load.
pub fn weights_from_named<'a, I>(pairs: I) -> Weights
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    pairs
        .into_iter()
        .filter_map(|(name, w)| StrategyKey::from_str(name).ok().map(|k| (k, w)))
        .collect()
}

/// One candidate evaluated by the optimizer: a weight vector plus the
/// ensemble-score threshold that triggers entries/exits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub weights: Weights,
    pub threshold: f64,
}

impl ParameterSet {
    pub fn new(weights: Weights, threshold: f64) -> Self {
        ParameterSet { weights, threshold }
    }
}

/// Metrics produced by a single backtest run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub final_equity: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub win_rate: f64,
    pub num_trades: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            ts: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1.0,
            quote_volume: None,
        }
    }

    #[test]
    fn test_strategy_key_round_trip() {
        for key in StrategyKey::ALL {
            assert_eq!(StrategyKey::from_str(key.as_str()).unwrap(), key);
        }
        assert!(StrategyKey::from_str("martingale").is_err());
    }

    #[test]
    fn test_strategy_key_serde_snake_case() {
        let json = serde_json::to_string(&StrategyKey::PriceAction).unwrap();
        assert_eq!(json, "\"price_action\"");
    }

    #[test]
    fn test_weights_from_named_drops_unknown() {
        let weights = weights_from_named([("trend", 0.5), ("retired_alpha", 0.3), ("rsi", 0.2)]);
        assert_eq!(weights.len(), 2);
        assert_eq!(weights[&StrategyKey::Trend], 0.5);
        assert_eq!(weights[&StrategyKey::Rsi], 0.2);
    }

    #[test]
    fn test_candle_validation() {
        assert!(candle(100.0, 110.0, 90.0, 105.0).validate().is_ok());
        assert!(candle(100.0, 90.0, 110.0, 105.0).validate().is_err());
        assert!(candle(f64::NAN, 110.0, 90.0, 105.0).validate().is_err());
        assert!(candle(0.0, 110.0, 90.0, 105.0).validate().is_err());
    }

    #[test]
    fn test_parameter_set_json_shape() {
        let mut weights = Weights::new();
        weights.insert(StrategyKey::Trend, 0.6);
        weights.insert(StrategyKey::Macd, 0.4);
        let params = ParameterSet::new(weights, 0.2);

        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["threshold"], 0.2);
        assert_eq!(json["weights"]["trend"], 0.6);
        assert_eq!(json["weights"]["macd"], 0.4);
    }
}
