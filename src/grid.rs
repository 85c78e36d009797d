//! Candidate generation for the weight optimizer
//!
//! Stage one enumerates every weight vector on the simplex lattice for a given
//! step (all non-negative unit compositions, divided back to fractions). Stage
//! two perturbs the heaviest keys of promising vectors by one fine step. Every
//! vector this module emits sums to 1.0 within the shared tolerance.

use std::collections::HashSet;

use ordered_float::OrderedFloat;
use tracing::warn;

use crate::types::{StrategyKey, Weights};

/// Fallback grid step when the configured one is unusable
pub const DEFAULT_STEP: f64 = 0.1;

/// Tolerance on the sum-to-one invariant
pub const SUM_TOLERANCE: f64 = 1e-6;

/// Thresholds tried when the config does not pin any: 0.05 through 0.50
pub fn default_threshold_ladder() -> Vec<f64> {
    (1..=10).map(|i| i as f64 * 0.05).collect()
}

/// Configured thresholds filtered to (0, 1]; falls back to the default ladder
/// when nothing valid remains
pub fn threshold_candidates(configured: &[f64]) -> Vec<f64> {
    let valid: Vec<f64> = configured
        .iter()
        .copied()
        .filter(|t| t.is_finite() && *t > 0.0 && *t <= 1.0)
        .collect();
    if valid.len() < configured.len() {
        warn!(
            dropped = configured.len() - valid.len(),
            "ignoring thresholds outside (0, 1]"
        );
    }
    if valid.is_empty() {
        default_threshold_ladder()
    } else {
        valid
    }
}

fn sanitize_step(step: f64) -> f64 {
    if step.is_finite() && step > 0.0 && step <= 1.0 {
        step
    } else {
        warn!(step, default = DEFAULT_STEP, "invalid grid step, using default");
        DEFAULT_STEP
    }
}

fn round10(value: f64) -> f64 {
    (value * 1e10).round() / 1e10
}

/// Full coarse grid over all nine strategies
pub fn weight_grid(step: f64) -> Vec<Weights> {
    weight_grid_over(&StrategyKey::ALL, step)
}

/// Coarse grid over an explicit key subset. Enumerates every composition of
/// `round(1/step)` units across the keys and divides back by the unit count,
/// so the sum is exact up to float addition error.
pub fn weight_grid_over(keys: &[StrategyKey], step: f64) -> Vec<Weights> {
    if keys.is_empty() {
        return Vec::new();
    }
    let step = sanitize_step(step);
    let units = (1.0 / step).round() as u32;

    let mut out = Vec::new();
    let mut scratch = vec![0u32; keys.len()];
    compose(units, units, 0, keys, &mut scratch, &mut out);
    out
}

fn compose(
    units: u32,
    remaining: u32,
    idx: usize,
    keys: &[StrategyKey],
    scratch: &mut Vec<u32>,
    out: &mut Vec<Weights>,
) {
    if idx == keys.len() - 1 {
        scratch[idx] = remaining;
        let vector: Weights = keys
            .iter()
            .zip(scratch.iter())
            .map(|(key, count)| (*key, f64::from(*count) / f64::from(units)))
            .collect();
        out.push(vector);
        return;
    }
    for count in 0..=remaining {
        scratch[idx] = count;
        compose(units, remaining - count, idx + 1, keys, scratch, out);
    }
}

/// Number of vectors `weight_grid_over` would emit: C(units + n - 1, n - 1),
/// built multiplicatively so nothing factorial-sized is ever materialized
pub fn weight_candidate_count(step: f64, num_keys: usize) -> u64 {
    if num_keys == 0 {
        return 0;
    }
    let step = sanitize_step(step);
    let units = (1.0 / step).round() as u64;
    binomial(units + num_keys as u64 - 1, num_keys as u64 - 1)
}

fn binomial(n: u64, r: u64) -> u64 {
    let r = r.min(n - r);
    let mut result: u128 = 1;
    for k in 1..=r {
        // stays exact: the running product of k consecutive ratios is integral
        result = result * u128::from(n - r + k) / u128::from(k);
    }
    u64::try_from(result).unwrap_or(u64::MAX)
}

/// Local refinements of `base`: every +-step transfer between ordered pairs of
/// its `top_k` heaviest keys that keeps all components in [0, 1] and the sum
/// on the simplex. Components are rounded to 10 decimals so equal vectors
/// compare equal downstream.
pub fn neighbor_weights(base: &Weights, step: f64, top_k: usize) -> Vec<Weights> {
    let step = sanitize_step(step);

    let mut ranked: Vec<(StrategyKey, f64)> = base.iter().map(|(k, w)| (*k, *w)).collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    let top: Vec<StrategyKey> = ranked.iter().take(top_k).map(|(k, _)| *k).collect();

    let mut out = Vec::new();
    for &gainer in &top {
        for delta in [step, -step] {
            let new_gain = base[&gainer] + delta;
            if !(0.0..=1.0).contains(&new_gain) {
                continue;
            }
            for &payer in &top {
                if payer == gainer {
                    continue;
                }
                let new_pay = base[&payer] - delta;
                if !(0.0..=1.0).contains(&new_pay) {
                    continue;
                }
                let mut candidate = base.clone();
                candidate.insert(gainer, new_gain);
                candidate.insert(payer, new_pay);
                let sum: f64 = candidate.values().sum();
                if (sum - 1.0).abs() > SUM_TOLERANCE {
                    continue;
                }
                for weight in candidate.values_mut() {
                    *weight = round10(*weight);
                }
                out.push(candidate);
            }
        }
    }
    out
}

/// Drop duplicate vectors, keeping first occurrences in order. Equality is on
/// the full (key, weight) sequence, which BTreeMap already yields canonically.
pub fn dedup_weights(candidates: Vec<Weights>) -> Vec<Weights> {
    let mut seen: HashSet<Vec<(StrategyKey, OrderedFloat<f64>)>> = HashSet::new();
    let mut out = Vec::new();
    for candidate in candidates {
        let fingerprint: Vec<(StrategyKey, OrderedFloat<f64>)> = candidate
            .iter()
            .map(|(k, w)| (*k, OrderedFloat(*w)))
            .collect();
        if seen.insert(fingerprint) {
            out.push(candidate);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_KEYS: [StrategyKey; 2] = [StrategyKey::Trend, StrategyKey::Momentum];
    const THREE_KEYS: [StrategyKey; 3] =
        [StrategyKey::Trend, StrategyKey::Momentum, StrategyKey::Swing];

    fn sums_to_one(weights: &Weights) -> bool {
        (weights.values().sum::<f64>() - 1.0).abs() <= SUM_TOLERANCE
    }

    #[test]
    fn test_two_key_half_step_grid() {
        let grid = weight_grid_over(&TWO_KEYS, 0.5);
        assert_eq!(grid.len(), 3);

        let pairs: Vec<(f64, f64)> = grid
            .iter()
            .map(|w| (w[&StrategyKey::Trend], w[&StrategyKey::Momentum]))
            .collect();
        assert!(pairs.contains(&(0.0, 1.0)));
        assert!(pairs.contains(&(0.5, 0.5)));
        assert!(pairs.contains(&(1.0, 0.0)));
    }

    #[test]
    fn test_grid_vectors_sum_to_one() {
        for weights in weight_grid_over(&THREE_KEYS, 0.25) {
            assert!(sums_to_one(&weights), "bad sum in {:?}", weights);
        }
    }

    #[test]
    fn test_candidate_count_matches_enumeration() {
        for (keys, step) in [(&TWO_KEYS[..], 0.5), (&THREE_KEYS[..], 0.25), (&THREE_KEYS[..], 0.2)]
        {
            let grid = weight_grid_over(keys, step);
            assert_eq!(grid.len() as u64, weight_candidate_count(step, keys.len()));
        }
    }

    #[test]
    fn test_full_grid_count_at_default_step() {
        // C(18, 8) lattice points for nine keys at step 0.1
        assert_eq!(weight_candidate_count(0.1, 9), 43758);
    }

    #[test]
    fn test_invalid_step_falls_back_to_default() {
        let reference = weight_grid_over(&THREE_KEYS, DEFAULT_STEP).len();
        assert_eq!(weight_grid_over(&THREE_KEYS, f64::NAN).len(), reference);
        assert_eq!(weight_grid_over(&THREE_KEYS, 0.0).len(), reference);
        assert_eq!(weight_grid_over(&THREE_KEYS, -0.1).len(), reference);
        assert_eq!(weight_grid_over(&THREE_KEYS, 2.0).len(), reference);
    }

    #[test]
    fn test_neighbors_stay_on_simplex() {
        let mut base = Weights::new();
        base.insert(StrategyKey::Trend, 0.5);
        base.insert(StrategyKey::Momentum, 0.3);
        base.insert(StrategyKey::Swing, 0.2);

        let neighbors = neighbor_weights(&base, 0.05, 3);
        assert!(!neighbors.is_empty());
        for n in &neighbors {
            assert!(sums_to_one(n), "bad sum in {:?}", n);
            assert!(n.values().all(|w| (0.0..=1.0).contains(w)));
            assert_ne!(n, &base);
        }
    }

    #[test]
    fn test_neighbors_respect_bounds() {
        // A key already at zero cannot pay for anyone else's raise
        let mut base = Weights::new();
        base.insert(StrategyKey::Trend, 1.0);
        base.insert(StrategyKey::Momentum, 0.0);
        base.insert(StrategyKey::Swing, 0.0);

        for n in neighbor_weights(&base, 0.1, 3) {
            assert!(n.values().all(|w| (0.0..=1.0).contains(w)));
            assert!(sums_to_one(&n));
        }
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let grid = weight_grid_over(&TWO_KEYS, 0.5);
        let mut doubled = grid.clone();
        doubled.extend(grid.iter().cloned());
        let unique = dedup_weights(doubled);
        assert_eq!(unique, grid);
    }

    #[test]
    fn test_threshold_candidates() {
        assert_eq!(threshold_candidates(&[0.2, 0.4]), vec![0.2, 0.4]);
        // Invalid entries are dropped, full fallback when nothing is left
        assert_eq!(threshold_candidates(&[0.2, -1.0, 7.0]), vec![0.2]);
        assert_eq!(threshold_candidates(&[]), default_threshold_ladder());
        assert_eq!(threshold_candidates(&[f64::NAN, 0.0]), default_threshold_ladder());
        assert_eq!(default_threshold_ladder().len(), 10);
    }
}
