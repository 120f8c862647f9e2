//! Money helpers. Amounts are `Decimal` with two fractional digits, rounded
//! half away from zero.

use rust_decimal::{Decimal, RoundingStrategy};

/// Rounds to cents and fixes the scale at 2 so `17` renders as `17.00`.
pub fn round_money(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}

/// `amount * percent / 100`, rounded to cents.
pub fn percent_of(amount: Decimal, percent: i32) -> Decimal {
    round_money(amount * Decimal::from(percent) / Decimal::ONE_HUNDRED)
}
