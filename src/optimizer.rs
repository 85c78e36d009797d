//! Two-stage ensemble weight optimizer
//!
//! A coarse sweep over the full weight simplex followed by a fine local
//! refinement around the top performers. Every (weights, threshold) candidate
//! is an independent read-only backtest; candidates within a stage run in
//! parallel on a dedicated worker pool, stages never overlap, and only the
//! single global winner is persisted.

use std::cmp::Ordering;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::iproduct;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::backtest::Backtester;
use crate::config::{Config, OptimizerConfig};
use crate::grid;
use crate::storage::SqliteStorage;
use crate::types::{BacktestMetrics, Candle, ParameterSet, StrategyKey, Weights};

/// Fewest candles worth optimizing over
pub const MIN_REQUIRED_CANDLES: usize = 200;

/// Heaviest keys of a coarse result that the fine stage perturbs
const NEIGHBOR_TOP_K: usize = 3;

/// One evaluated candidate
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub params: ParameterSet,
    pub metrics: BacktestMetrics,
}

/// Strict lexicographic ranking: total return first, sharpe as the tie-break,
/// both descending. Never a blended score.
pub fn compare_evaluations(a: &Evaluation, b: &Evaluation) -> Ordering {
    b.metrics
        .total_return
        .partial_cmp(&a.metrics.total_return)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.metrics
                .sharpe
                .partial_cmp(&a.metrics.sharpe)
                .unwrap_or(Ordering::Equal)
        })
}

pub struct TwoStageOptimizer {
    storage: SqliteStorage,
    settings: OptimizerConfig,
    backtester: Backtester,
    timeframe: String,
    show_progress: bool,
}

impl TwoStageOptimizer {
    pub fn new(storage: SqliteStorage, config: &Config) -> Self {
        TwoStageOptimizer {
            storage,
            settings: config.optimizer.clone(),
            backtester: Backtester::new(config.backtest_options()),
            timeframe: config.storage.timeframe.clone(),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Run one full optimization cycle and return the winning evaluation.
    /// `None` means a recoverable no-op: not enough history, or nothing to
    /// evaluate. Any evaluation or persistence failure aborts the cycle and
    /// leaves the previously stored best untouched.
    pub fn run(&self) -> Result<Option<Evaluation>> {
        let candles = self
            .storage
            .load_ohlcv(&self.timeframe, self.settings.months)?;
        if candles.len() < MIN_REQUIRED_CANDLES {
            warn!(
                candles = candles.len(),
                required = MIN_REQUIRED_CANDLES,
                "not enough history to optimize"
            );
            return Ok(None);
        }

        let thresholds = grid::threshold_candidates(&self.settings.thresholds);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.threads) // 0 selects one thread per core
            .build()
            .context("building evaluation worker pool")?;

        let coarse_weights = grid::weight_grid(self.settings.coarse_step);
        let coarse_candidates = cross(&coarse_weights, &thresholds);
        if coarse_candidates.is_empty() {
            warn!("no candidates to evaluate");
            return Ok(None);
        }
        info!(
            weight_vectors = coarse_weights.len(),
            expected = grid::weight_candidate_count(self.settings.coarse_step, StrategyKey::ALL.len()),
            thresholds = thresholds.len(),
            candles = candles.len(),
            "starting coarse stage"
        );
        let coarse = pool.install(|| self.evaluate_all(&candles, coarse_candidates));

        let top = select_top(&coarse, self.settings.top_percent);
        info!(evaluated = coarse.len(), kept = top.len(), "coarse stage done");

        let mut fine_weights: Vec<Weights> = Vec::new();
        for evaluation in &top {
            fine_weights.extend(grid::neighbor_weights(
                &evaluation.params.weights,
                self.settings.fine_step,
                NEIGHBOR_TOP_K,
            ));
        }
        let fine_weights = grid::dedup_weights(fine_weights);
        let fine_candidates = cross(&fine_weights, &thresholds);
        info!(
            weight_vectors = fine_weights.len(),
            candidates = fine_candidates.len(),
            "starting fine stage"
        );
        let fine = pool.install(|| self.evaluate_all(&candles, fine_candidates));

        // Merge both stages and rank once; ties keep the earlier candidate
        let mut all = coarse;
        all.extend(fine);
        all.sort_by(compare_evaluations);
        let winner = match all.into_iter().next() {
            Some(winner) => winner,
            None => return Ok(None),
        };

        self.storage
            .save_optimizer_result(&winner.params, &winner.metrics, true)
            .context("persisting optimizer winner")?;
        info!(
            total_return = winner.metrics.total_return,
            sharpe = winner.metrics.sharpe,
            threshold = winner.params.threshold,
            trades = winner.metrics.num_trades,
            "optimization cycle complete"
        );
        Ok(Some(winner))
    }

    fn evaluate_all(&self, candles: &[Candle], candidates: Vec<ParameterSet>) -> Vec<Evaluation> {
        let progress = if self.show_progress {
            let pb = ProgressBar::new(candidates.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}, {per_sec:.2}]")
                    .unwrap()
                    .progress_chars("█░ "),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let results: Vec<Evaluation> = candidates
            .into_par_iter()
            .map(|params| {
                let metrics = self.backtester.run(candles, &params);
                progress.inc(1);
                Evaluation { params, metrics }
            })
            .collect();
        progress.finish_and_clear();
        results
    }
}

/// Top slice of a stage under the ranking key: at least one, at most 50
fn select_top(results: &[Evaluation], top_percent: f64) -> Vec<Evaluation> {
    let mut sorted = results.to_vec();
    sorted.sort_by(compare_evaluations);
    let keep = ((results.len() as f64 * top_percent).floor() as usize)
        .min(50)
        .max(1);
    sorted.truncate(keep);
    sorted
}

fn cross(weights: &[Weights], thresholds: &[f64]) -> Vec<ParameterSet> {
    iproduct!(weights, thresholds)
        .map(|(w, &t)| ParameterSet::new(w.clone(), t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use crate::grid::SUM_TOLERANCE;

    fn evaluation(total_return: f64, sharpe: f64) -> Evaluation {
        Evaluation {
            params: ParameterSet::new(Weights::from([(StrategyKey::Trend, 1.0)]), 0.2),
            metrics: BacktestMetrics {
                total_return,
                sharpe,
                ..BacktestMetrics::default()
            },
        }
    }

    #[test]
    fn test_ranking_is_a_strict_total_order() {
        let a = evaluation(0.3, 1.0);
        let b = evaluation(0.3, 0.5);
        let c = evaluation(0.1, 2.0);

        // every input order selects the same winner
        for perm in [[&a, &b, &c], [&a, &c, &b], [&b, &a, &c], [&b, &c, &a], [&c, &a, &b], [&c, &b, &a]] {
            let mut results: Vec<Evaluation> = perm.into_iter().cloned().collect();
            results.sort_by(compare_evaluations);
            assert_eq!(results[0].metrics.total_return, 0.3);
            assert_eq!(results[0].metrics.sharpe, 1.0);
            assert_eq!(results[2].metrics.total_return, 0.1);
        }
    }

    #[test]
    fn test_select_top_bounds() {
        let results: Vec<Evaluation> = (0..100).map(|i| evaluation(i as f64 / 100.0, 0.0)).collect();
        assert_eq!(select_top(&results, 0.1).len(), 10);
        // floor would give zero, the floor of one applies
        assert_eq!(select_top(&results[..3], 0.01).len(), 1);
        // the cap of fifty applies
        let many: Vec<Evaluation> = (0..1000).map(|i| evaluation(i as f64, 0.0)).collect();
        let top = select_top(&many, 0.9);
        assert_eq!(top.len(), 50);
        assert_eq!(top[0].metrics.total_return, 999.0);
    }

    #[test]
    fn test_cross_pairs_every_weight_with_every_threshold() {
        let weights = vec![
            Weights::from([(StrategyKey::Trend, 1.0)]),
            Weights::from([(StrategyKey::Momentum, 1.0)]),
        ];
        let candidates = cross(&weights, &[0.1, 0.2, 0.3]);
        assert_eq!(candidates.len(), 6);
        assert!(candidates.iter().any(|p| p.threshold == 0.3
            && p.weights.get(&StrategyKey::Momentum) == Some(&1.0)));
    }

    #[test]
    fn test_full_cycle_persists_one_best() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        let candles: Vec<Candle> = (0..300)
            .map(|i| {
                let close = 100.0 + i as f64 * 0.5;
                Candle {
                    ts: now - Duration::minutes(300 - i),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1.0,
                    quote_volume: None,
                }
            })
            .collect();
        storage.upsert_candles("minute1", &candles).unwrap();

        let mut config = Config::default();
        config.trading.window = 5;
        config.optimizer.coarse_step = 0.5;
        config.optimizer.fine_step = 0.25;
        config.optimizer.thresholds = vec![0.2];
        config.optimizer.threads = 2;

        let optimizer = TwoStageOptimizer::new(storage.clone(), &config);
        let winner = optimizer.run().unwrap().expect("winner expected");

        // a steady uptrend must reward trading over sitting in cash
        assert!(winner.metrics.total_return > 0.0);
        let sum: f64 = winner.params.weights.values().sum();
        assert!((sum - 1.0).abs() < SUM_TOLERANCE);

        let best = storage.best_parameter_set().unwrap().expect("best row");
        assert_eq!(best.threshold, winner.params.threshold);
        assert_eq!(best.weights, winner.params.weights);
    }

    #[test]
    fn test_thin_history_is_a_no_op() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        let candles: Vec<Candle> = (0..50)
            .map(|i| Candle {
                ts: now - Duration::minutes(50 - i),
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0,
                volume: 1.0,
                quote_volume: None,
            })
            .collect();
        storage.upsert_candles("minute1", &candles).unwrap();

        let config = Config::default();
        let optimizer = TwoStageOptimizer::new(storage.clone(), &config);
        assert!(optimizer.run().unwrap().is_none());
        assert!(storage.best_parameter_set().unwrap().is_none());
    }
}
