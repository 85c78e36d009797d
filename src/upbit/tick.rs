//! Upbit KRW price grid
//!
//! All KRW markets quote on a stepped price grid; orders priced off the grid
//! are rejected. The backtest simulator and the live trader share these
//! helpers so simulated fills and real orders land on the same prices.

/// Exchange price increment for a KRW quote price
pub fn tick_size(price: f64) -> f64 {
    if price >= 2_000_000.0 {
        1_000.0
    } else if price >= 1_000_000.0 {
        500.0
    } else if price >= 500_000.0 {
        100.0
    } else if price >= 100_000.0 {
        50.0
    } else if price >= 10_000.0 {
        10.0
    } else if price >= 1_000.0 {
        5.0
    } else if price >= 100.0 {
        1.0
    } else if price >= 10.0 {
        0.1
    } else {
        0.01
    }
}

/// Direction to snap an off-grid price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickRounding {
    /// Never below the input: the safe side for buy prices
    Up,
    /// Never above the input: the safe side for sell prices
    Down,
}

// Absorbs float noise when a price reconstructed as count * tick is fed back
// in; one part in 1e9 is far below any real quote increment.
const GRID_EPS: f64 = 1e-9;

/// Snap `price` onto the exchange grid in the requested direction.
///
/// Guarantees `Up >= price`, `Down <= price`, and that reapplying either
/// direction to its own output is a no-op.
pub fn round_to_tick(price: f64, mode: TickRounding) -> f64 {
    let tick = tick_size(price);
    let steps = price / tick;
    match mode {
        TickRounding::Up => {
            let mut n = (steps - GRID_EPS).ceil();
            if n * tick < price {
                n += 1.0;
            }
            n * tick
        }
        TickRounding::Down => {
            let mut n = (steps + GRID_EPS).floor();
            if n * tick > price {
                n -= 1.0;
            }
            n * tick
        }
    }
}
