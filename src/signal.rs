//! Ensemble signal engine
//!
//! Nine tri-state member strategies vote on a trailing window of close prices;
//! the ensemble score is the weight-blended sum of those votes. Every vote
//! function is pure and total: short or degenerate windows produce a neutral 0
//! instead of an error, so the engine can be called safely at any point in a
//! series.

use statrs::statistics::Statistics;

use crate::types::{StrategyKey, Weights};

/// Weighted ensemble score over a trailing close window.
///
/// Keys absent from `weights` simply do not vote. The result lands in
/// `[-sum(weights), +sum(weights)]`, so `[-1, 1]` for normalized weights.
pub fn ensemble_signal(prices: &[f64], weights: &Weights) -> f64 {
    weights
        .iter()
        .map(|(key, w)| w * f64::from(vote(*key, prices)))
        .sum()
}

/// Single member vote: +1 long, -1 short, 0 neutral
pub fn vote(key: StrategyKey, prices: &[f64]) -> i32 {
    match key {
        StrategyKey::Trend => vote_trend(prices),
        StrategyKey::Momentum => vote_momentum(prices, 10),
        StrategyKey::Swing => vote_swing(prices, 5, 20),
        StrategyKey::Scalping => vote_scalping(prices, 10),
        StrategyKey::Day => vote_day(prices, 20),
        StrategyKey::PriceAction => vote_price_action(prices),
        StrategyKey::Rsi => vote_rsi(prices, 14),
        StrategyKey::Bollinger => vote_bollinger(prices, 20, 2.0),
        StrategyKey::Macd => vote_macd(prices, 12, 26, 9),
    }
}

/// Weights the live trader falls back to when no optimizer result exists yet
pub fn fallback_weights() -> Weights {
    let mut weights = Weights::new();
    weights.insert(StrategyKey::Trend, 0.2);
    weights.insert(StrategyKey::Momentum, 0.2);
    weights.insert(StrategyKey::Swing, 0.2);
    weights.insert(StrategyKey::Scalping, 0.15);
    weights.insert(StrategyKey::Day, 0.15);
    weights.insert(StrategyKey::PriceAction, 0.1);
    weights
}

fn sign(diff: f64) -> i32 {
    if diff > 0.0 {
        1
    } else if diff < 0.0 {
        -1
    } else {
        0
    }
}

/// Direction of the last one-step move
fn vote_trend(prices: &[f64]) -> i32 {
    let n = prices.len();
    if n < 2 {
        return 0;
    }
    sign(prices[n - 1] - prices[n - 2])
}

/// Direction of the move over the last `period` steps
fn vote_momentum(prices: &[f64], period: usize) -> i32 {
    let n = prices.len();
    if n <= period {
        return 0;
    }
    sign(prices[n - 1] - prices[n - 1 - period])
}

/// Short SMA vs long SMA crossover state
fn vote_swing(prices: &[f64], short: usize, long: usize) -> i32 {
    let n = prices.len();
    if n < long.max(short) {
        return 0;
    }
    let short_ma = prices[n - short..].mean();
    let long_ma = prices[n - long..].mean();
    sign(short_ma - long_ma)
}

/// Last move measured against half the volatility of the preceding `lookback`
/// closes (population sigma, last close excluded)
fn vote_scalping(prices: &[f64], lookback: usize) -> i32 {
    let n = prices.len();
    if n < lookback + 1 {
        return 0;
    }
    let vol = prices[n - 1 - lookback..n - 1].population_std_dev();
    if vol == 0.0 {
        return 0;
    }
    let last_change = prices[n - 1] - prices[n - 2];
    let threshold = vol * 0.5;
    if last_change > threshold {
        1
    } else if last_change < -threshold {
        -1
    } else {
        0
    }
}

/// Regime switch on the volatility ratio of the last `lookback` closes:
/// quiet markets follow the last move, noisy markets fade the mean
fn vote_day(prices: &[f64], lookback: usize) -> i32 {
    let n = prices.len();
    if n < lookback {
        return 0;
    }
    let recent = &prices[n - lookback..];
    let mean = recent.mean();
    if mean == 0.0 {
        return 0;
    }
    let vol_ratio = recent.population_std_dev() / mean;
    if vol_ratio < 0.02 {
        sign(prices[n - 1] - prices[n - 2])
    } else if vol_ratio > 0.05 {
        -sign(prices[n - 1] - mean)
    } else {
        0
    }
}

/// Breakout above / below every prior close in the window
fn vote_price_action(prices: &[f64]) -> i32 {
    let n = prices.len();
    if n < 3 {
        return 0;
    }
    let prior = &prices[..n - 1];
    let high = prior.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let low = prior.iter().cloned().fold(f64::INFINITY, f64::min);
    if prices[n - 1] > high {
        1
    } else if prices[n - 1] < low {
        -1
    } else {
        0
    }
}

/// Simple-average RSI over the last `period` one-step changes; contrarian at
/// the classic 30/70 bands. A window with no movement at all is neutral.
fn vote_rsi(prices: &[f64], period: usize) -> i32 {
    let n = prices.len();
    if n <= period {
        return 0;
    }
    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for i in n - period..n {
        let change = prices[i] - prices[i - 1];
        if change > 0.0 {
            gain_sum += change;
        } else {
            loss_sum += change.abs();
        }
    }
    let avg_gain = gain_sum / period as f64;
    let avg_loss = loss_sum / period as f64;

    let rsi = if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            return 0;
        }
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };

    if rsi < 30.0 {
        1
    } else if rsi > 70.0 {
        -1
    } else {
        0
    }
}

/// Mean-reversion at the Bollinger band edges (SMA +/- num_std population
/// sigma). A zero-width band carries no information.
fn vote_bollinger(prices: &[f64], period: usize, num_std: f64) -> i32 {
    let n = prices.len();
    if n < period {
        return 0;
    }
    let recent = &prices[n - period..];
    let middle = recent.mean();
    let std = recent.population_std_dev();
    if std == 0.0 {
        return 0;
    }
    let last = prices[n - 1];
    if last <= middle - num_std * std {
        1
    } else if last >= middle + num_std * std {
        -1
    } else {
        0
    }
}

/// EMA seeded with the SMA of the first `period` values, then the standard
/// recursion over the rest
fn ema(data: &[f64], period: usize) -> f64 {
    if data.len() < period {
        return data.mean();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut value = data[..period].mean();
    for price in &data[period..] {
        value = price * k + value * (1.0 - k);
    }
    value
}

/// MACD line vs its signal line. The signal line is the mean of the trailing
/// `signal` MACD values, each re-derived from the price prefix ending at that
/// index, so the vote needs `slow + signal + 10` closes of history before it
/// says anything.
fn vote_macd(prices: &[f64], fast: usize, slow: usize, signal: usize) -> i32 {
    let n = prices.len();
    if n < slow + signal + 10 {
        return 0;
    }
    let macd_line = ema(prices, fast) - ema(prices, slow);

    let mut macd_history = Vec::with_capacity(slow + signal);
    for i in n - slow - signal..n {
        if i < slow {
            continue;
        }
        macd_history.push(ema(&prices[..=i], fast) - ema(&prices[..=i], slow));
    }
    if macd_history.len() < signal {
        return 0;
    }
    let signal_line = macd_history[macd_history.len() - signal..].mean();
    sign(macd_line - signal_line)
}
