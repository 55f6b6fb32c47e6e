//! Small helpers shared across the lifecycle services.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Absolute difference below which two payment amounts count as equal.
pub const PAYMENT_AMOUNT_EPSILON: Decimal = dec!(0.01);

/// Rounds a monetary amount to 2 decimal places, half away from zero. The
/// same rounding is used everywhere money is computed so a displayed total
/// always matches the stored one.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Whether `a` and `b` agree within [`PAYMENT_AMOUNT_EPSILON`].
pub fn amounts_match(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() <= PAYMENT_AMOUNT_EPSILON
}
