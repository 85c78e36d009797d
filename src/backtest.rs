//! Backtest simulator
//!
//! Replays a candle series through the signal engine under one parameter
//! setting, tracking cash and position state candle by candle. Execution is
//! T+1: a signal computed on bar i fills at bar i+1's open, so no decision
//! ever sees data past its own bar.

use statrs::statistics::Statistics;

use crate::signal::ensemble_signal;
use crate::types::{BacktestMetrics, Candle, ParameterSet};
use crate::upbit::{round_to_tick, TickRounding, MIN_ORDER_NOTIONAL_KRW};

/// Sentinel sharpe marking an evaluation cut short by the loss guard
pub const EARLY_STOP_SHARPE: f64 = -999.0;

/// Annualization base for per-minute returns
const MINUTES_PER_YEAR: f64 = 365.0 * 24.0 * 60.0;

/// Aborts evaluations whose cumulative loss crosses a floor, so the optimizer
/// does not pay full simulation cost for clearly losing candidates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EarlyStop {
    /// Negative cumulative-return floor, e.g. -0.3 for a 30% loss
    pub threshold: f64,
    /// Steps to run before the floor is checked
    pub min_steps: usize,
}

#[derive(Debug, Clone)]
pub struct BacktestOptions {
    pub initial_cash: f64,
    pub fee_rate: f64,
    /// Extra margin over the fee when sizing buys, so a fill plus its fee
    /// never overshoots available cash
    pub fee_buffer: f64,
    /// Fractional price offset applied toward the market on both sides
    pub aggressiveness: f64,
    /// Signal lookback in closes; clamped to at least 3 bars
    pub window: usize,
    pub early_stop: Option<EarlyStop>,
}

impl Default for BacktestOptions {
    fn default() -> Self {
        BacktestOptions {
            initial_cash: 1_000_000.0,
            fee_rate: 0.0005,
            fee_buffer: 0.0005,
            aggressiveness: 0.0015,
            window: 200,
            early_stop: Some(EarlyStop {
                threshold: -0.3,
                min_steps: 1440,
            }),
        }
    }
}

pub struct Backtester {
    options: BacktestOptions,
}

impl Backtester {
    pub fn new(options: BacktestOptions) -> Self {
        Backtester { options }
    }

    pub fn options(&self) -> &BacktestOptions {
        &self.options
    }

    /// Run one parameter set over an ascending candle series
    pub fn run(&self, candles: &[Candle], params: &ParameterSet) -> BacktestMetrics {
        let opts = &self.options;
        if candles.len() < 2 {
            return BacktestMetrics {
                final_equity: opts.initial_cash,
                ..BacktestMetrics::default()
            };
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let window = opts.window.min(candles.len()).max(3);

        let mut cash = opts.initial_cash;
        let mut qty = 0.0_f64;
        let mut equity_curve: Vec<f64> = Vec::with_capacity(candles.len() - 1);
        let mut returns: Vec<f64> = Vec::with_capacity(candles.len().saturating_sub(2));
        let mut trades = 0_usize;
        let mut wins = 0_usize;

        for i in 0..candles.len() - 1 {
            let next = &candles[i + 1];

            // Mark to market against the bar the next fill would land on
            let equity = cash + qty * next.close;
            if let Some(&prev) = equity_curve.last() {
                if prev > 0.0 {
                    returns.push(equity / prev - 1.0);
                }
            }
            equity_curve.push(equity);

            if let Some(early) = opts.early_stop {
                if i >= early.min_steps {
                    let cumulative = equity / opts.initial_cash - 1.0;
                    if cumulative <= early.threshold {
                        return BacktestMetrics {
                            final_equity: equity,
                            total_return: cumulative,
                            max_drawdown: 1.0,
                            sharpe: EARLY_STOP_SHARPE,
                            win_rate: 0.0,
                            num_trades: trades,
                        };
                    }
                }
            }

            // Partial windows are skipped, never zero-padded
            if i + 1 < window {
                continue;
            }
            let lookback = &closes[i + 1 - window..=i];
            let score = ensemble_signal(lookback, &params.weights);

            if score >= params.threshold && cash > MIN_ORDER_NOTIONAL_KRW {
                let target =
                    round_to_tick(next.open * (1.0 + opts.aggressiveness), TickRounding::Up);
                let volume =
                    floor_to_lot(cash / (target * (1.0 + opts.fee_rate + opts.fee_buffer)));
                let notional = target * volume;
                if volume > 0.0 && notional > MIN_ORDER_NOTIONAL_KRW {
                    cash -= notional + notional * opts.fee_rate;
                    qty += volume;
                    trades += 1;
                }
            } else if score <= -params.threshold && qty > 0.0 {
                let target =
                    round_to_tick(next.open * (1.0 - opts.aggressiveness), TickRounding::Down);
                let proceeds = target * qty;
                // Sells are all-or-nothing, never partial
                if proceeds > MIN_ORDER_NOTIONAL_KRW {
                    cash += proceeds - proceeds * opts.fee_rate;
                    if cash > equity {
                        wins += 1;
                    }
                    qty = 0.0;
                    trades += 1;
                }
            }
        }

        let final_equity = cash + qty * closes[closes.len() - 1];
        let total_return = final_equity / opts.initial_cash - 1.0;
        let win_rate = if trades > 0 {
            wins as f64 / trades as f64
        } else {
            0.0
        };

        BacktestMetrics {
            final_equity,
            total_return,
            max_drawdown: max_drawdown(&equity_curve),
            sharpe: annualized_sharpe(&returns),
            win_rate,
            num_trades: trades,
        }
    }
}

/// Truncate a volume to the exchange's 8 decimal places, never rounding up
pub(crate) fn floor_to_lot(volume: f64) -> f64 {
    (volume * 1e8).floor() / 1e8
}

/// Worst peak-to-trough decline over an equity series, as a fraction of the peak
fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = match equity.first() {
        Some(first) => *first,
        None => return 0.0,
    };
    let mut max_dd = 0.0;
    for &value in equity {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            let dd = (peak - value) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    max_dd
}

/// Mean over sample standard deviation of per-step returns, scaled to a year
/// of minutes. Zero when there are fewer than two samples or no variance.
fn annualized_sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().mean();
    // Deviations against the final mean cancel exactly on a constant series
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    let std_dev = variance.sqrt();
    if std_dev > 0.0 {
        MINUTES_PER_YEAR.sqrt() * mean / std_dev
    } else {
        0.0
    }
}
