//! Fixed-point share math
//!
//! All asset and share quantities are unsigned integers in the asset's
//! smallest unit. Products are widened to big integers so conversions never
//! overflow before the division.

use num_bigint::BigUint;
use num_traits::Zero;

/// Asset or share quantity in base units.
pub type Amount = u128;

/// Scale applied to `profit_unlocking_rate` (base units per second * 1e12).
pub const UNLOCK_RATE_SCALE: Amount = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Down,
    Up,
}

/// `x * y / denominator` with explicit rounding.
///
/// The product is taken as a `BigUint`, so it never overflows before the
/// division. Returns `None` on a zero denominator or when the result exceeds
/// `u128`.
pub fn mul_div(x: Amount, y: Amount, denominator: Amount, rounding: Rounding) -> Option<Amount> {
    if denominator == 0 {
        return None;
    }
    let product = BigUint::from(x) * BigUint::from(y);
    let denominator = BigUint::from(denominator);
    let quotient = &product / &denominator;
    let remainder = &product % &denominator;
    let quotient = match rounding {
        Rounding::Up if !remainder.is_zero() => quotient + 1u32,
        _ => quotient,
    };
    u128::try_from(&quotient).ok()
}
