//! Decimal arithmetic helpers for money and quantity calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Basis points (1 bp = 0.01%).
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Relative mismatch between two quantities, measured against the larger one.
pub fn relative_mismatch(a: Decimal, b: Decimal) -> Decimal {
    let larger = a.abs().max(b.abs());
    safe_div((a.abs() - b.abs()).abs(), larger)
}

/// Volume-weighted average price of two fills.
pub fn blended_price(qty_a: Decimal, price_a: Decimal, qty_b: Decimal, price_b: Decimal) -> Decimal {
    safe_div(qty_a * price_a + qty_b * price_b, qty_a + qty_b)
}
