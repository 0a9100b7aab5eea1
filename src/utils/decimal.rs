//! Decimal arithmetic utilities for prices, quantities and ratios.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Direction used when snapping a price onto the tick grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickRounding {
    /// Toward zero (stops, stop-limits).
    Down,
    /// Away from zero (take-profit targets, break-even stops).
    Up,
}

/// Round to tick size (e.g., 0.01 for most equity prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal, mode: TickRounding) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return value;
    }
    let steps = value / tick_size;
    let steps = match mode {
        TickRounding::Down => steps.floor(),
        TickRounding::Up => steps.ceil(),
    };
    (steps * tick_size).normalize()
}

/// Tick size for a US equity at `price`: sub-dollar names trade on a finer grid.
pub fn equity_tick(price: Decimal, tick_ge_1: Decimal, tick_lt_1: Decimal) -> Decimal {
    if price < Decimal::ONE {
        tick_lt_1
    } else {
        tick_ge_1
    }
}

/// Whole-share floor; negative inputs clamp to zero.
pub fn floor_shares(value: Decimal) -> Decimal {
    if value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    value.floor()
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Express a ratio as a percentage.
pub fn to_pct(ratio: Decimal) -> Decimal {
    ratio * dec!(100)
}
