//! Integration tests for the upbit-ensemble system
//!
//! These tests verify that the signal, backtest, storage, and optimizer
//! components work together correctly.

use chrono::{Duration, Utc};

use upbit_ensemble::backtest::{BacktestOptions, Backtester, EarlyStop, EARLY_STOP_SHARPE};
use upbit_ensemble::grid;
use upbit_ensemble::optimizer::TwoStageOptimizer;
use upbit_ensemble::signal::{ensemble_signal, fallback_weights};
use upbit_ensemble::storage::SqliteStorage;
use upbit_ensemble::types::{Candle, ParameterSet, StrategyKey, Weights};
use upbit_ensemble::Config;

// =============================================================================
// Test Utilities
// =============================================================================

/// Generate steadily trending minute candles ending now
fn generate_trending_candles(count: usize, base_price: f64, step: f64) -> Vec<Candle> {
    let start = Utc::now() - Duration::minutes(count as i64);

    (0..count)
        .map(|i| {
            let close = base_price + step * i as f64;
            Candle {
                ts: start + Duration::minutes(i as i64),
                open: close - step * 0.5,
                high: close + base_price * 0.001,
                low: close - base_price * 0.001,
                close,
                volume: 1.0 + i as f64 * 0.01,
                quote_volume: None,
            }
        })
        .collect()
}

/// Generate candles pinned to one price, ending now
fn generate_flat_candles(count: usize, price: f64) -> Vec<Candle> {
    let start = Utc::now() - Duration::minutes(count as i64);

    (0..count)
        .map(|i| Candle {
            ts: start + Duration::minutes(i as i64),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1.0,
            quote_volume: None,
        })
        .collect()
}

fn trend_weights() -> Weights {
    let mut weights = Weights::new();
    weights.insert(StrategyKey::Trend, 1.0);
    weights
}

// =============================================================================
// Signal Tests
// =============================================================================

#[test]
fn test_ensemble_score_stays_within_weight_budget() {
    let weights = fallback_weights();
    let budget: f64 = weights.values().sum();

    for candles in [
        generate_trending_candles(250, 100_000.0, 50.0),
        generate_flat_candles(250, 100_000.0),
    ] {
        let closes: Vec<f64> = candles.iter().map(|candle| candle.close).collect();
        let score = ensemble_signal(&closes, &weights);
        assert!(
            score.abs() <= budget + 1e-12,
            "score {} exceeds weight budget {}",
            score,
            budget
        );
    }
}

#[test]
fn test_uptrend_scores_positive_with_trend_weights() {
    let candles = generate_trending_candles(250, 100_000.0, 50.0);
    let closes: Vec<f64> = candles.iter().map(|candle| candle.close).collect();

    let score = ensemble_signal(&closes, &trend_weights());
    assert!(score > 0.0);
}

// =============================================================================
// Backtest Tests
// =============================================================================

#[test]
fn test_backtest_profits_in_uptrend() {
    let candles = generate_trending_candles(300, 100_000.0, 50.0);
    let params = ParameterSet::new(trend_weights(), 0.2);
    let backtester = Backtester::new(BacktestOptions {
        window: 20,
        ..BacktestOptions::default()
    });

    let metrics = backtester.run(&candles, &params);

    assert!(metrics.num_trades >= 1);
    assert!(metrics.total_return > 0.0);
    assert!(metrics.final_equity > BacktestOptions::default().initial_cash);
}

#[test]
fn test_backtest_never_trades_on_flat_prices() {
    let candles = generate_flat_candles(300, 100_000.0);
    let params = ParameterSet::new(fallback_weights(), 0.2);
    let backtester = Backtester::new(BacktestOptions::default());

    let metrics = backtester.run(&candles, &params);

    assert_eq!(metrics.num_trades, 0);
    assert_eq!(metrics.final_equity, BacktestOptions::default().initial_cash);
    assert_eq!(metrics.max_drawdown, 0.0);
}

#[test]
fn test_backtest_early_stop_reports_sentinel() {
    // a short climb so the trend vote buys in, then a 95% collapse
    let start = Utc::now() - Duration::minutes(40);
    let candles: Vec<Candle> = (0..40)
        .map(|i| {
            let close = if i < 6 {
                100_000.0 + 100.0 * i as f64
            } else {
                5_000.0
            };
            Candle {
                ts: start + Duration::minutes(i as i64),
                open: close,
                high: close * 1.001,
                low: close * 0.999,
                close,
                volume: 1.0,
                quote_volume: None,
            }
        })
        .collect();

    let backtester = Backtester::new(BacktestOptions {
        window: 3,
        aggressiveness: 0.0,
        early_stop: Some(EarlyStop {
            threshold: -0.3,
            min_steps: 10,
        }),
        ..BacktestOptions::default()
    });
    let metrics = backtester.run(&candles, &ParameterSet::new(trend_weights(), 0.2));

    assert_eq!(metrics.sharpe, EARLY_STOP_SHARPE);
    assert_eq!(metrics.max_drawdown, 1.0);
    assert!(metrics.total_return < -0.3);
    assert!(metrics.num_trades >= 1);
}

// =============================================================================
// Storage Tests
// =============================================================================

#[test]
fn test_candles_round_trip_through_storage() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let candles = generate_trending_candles(120, 100_000.0, 25.0);

    let written = storage.upsert_candles("minute1", &candles).unwrap();
    assert_eq!(written, 120);

    let loaded = storage.load_ohlcv("minute1", 3).unwrap();
    assert_eq!(loaded.len(), 120);
    assert!(loaded.windows(2).all(|pair| pair[0].ts < pair[1].ts));
    for (original, stored) in candles.iter().zip(&loaded) {
        assert_eq!(original.close, stored.close);
        assert_eq!(original.volume, stored.volume);
    }

    // re-upserting the same batch stays idempotent
    let rewritten = storage.upsert_candles("minute1", &candles).unwrap();
    assert_eq!(rewritten, 120);
    assert_eq!(storage.load_ohlcv("minute1", 3).unwrap().len(), 120);
}

// =============================================================================
// Optimizer Tests
// =============================================================================

#[test]
fn test_optimizer_cycle_persists_winner() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let candles = generate_trending_candles(400, 100_000.0, 50.0);
    storage.upsert_candles("minute1", &candles).unwrap();

    let mut config = Config::default();
    config.trading.window = 10;
    config.optimizer.coarse_step = 0.5;
    config.optimizer.fine_step = 0.25;
    config.optimizer.thresholds = vec![0.2];
    config.optimizer.threads = 2;

    let optimizer = TwoStageOptimizer::new(storage.clone(), &config);
    let winner = optimizer.run().unwrap().expect("expected a winner");

    assert!(winner.metrics.total_return > 0.0);
    let sum: f64 = winner.params.weights.values().sum();
    assert!((sum - 1.0).abs() <= grid::SUM_TOLERANCE);

    let best = storage
        .best_parameter_set()
        .unwrap()
        .expect("winner should be stored");
    assert_eq!(best.weights, winner.params.weights);
}

#[test]
fn test_optimizer_declines_thin_history() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let candles = generate_trending_candles(50, 100_000.0, 50.0);
    storage.upsert_candles("minute1", &candles).unwrap();

    let optimizer = TwoStageOptimizer::new(storage.clone(), &Config::default());
    assert!(optimizer.run().unwrap().is_none());
    assert!(storage.best_parameter_set().unwrap().is_none());
}

// =============================================================================
// Grid Tests
// =============================================================================

#[test]
fn test_grid_candidates_are_normalized() {
    let weights = grid::weight_grid(0.25);
    assert_eq!(
        weights.len() as u64,
        grid::weight_candidate_count(0.25, StrategyKey::ALL.len())
    );

    for candidate in &weights {
        let sum: f64 = candidate.values().sum();
        assert!((sum - 1.0).abs() <= grid::SUM_TOLERANCE);
        assert!(candidate.values().all(|weight| *weight >= 0.0));
    }
}
