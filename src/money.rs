//! Fixed-point arithmetic shared by every engine.
//!
//! Money carries two decimals, stock quantities three. Products are rounded
//! once, at the last step of an aggregation, never per intermediate term.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Tolerance used when comparing monetary amounts ("fully paid", overpayment).
pub const MONEY_EPSILON: Decimal = dec!(0.01);

/// Decimal places kept on monetary columns.
pub const MONEY_PLACES: u32 = 2;

/// Decimal places kept on stock and quantity columns.
pub const STOCK_PLACES: u32 = 3;

/// Total coercion into a decimal; `None` becomes zero.
pub fn to_decimal<T: Into<Decimal>>(value: Option<T>) -> Decimal {
    value.map(Into::into).unwrap_or(Decimal::ZERO)
}

/// Rounds half away from zero to `places` decimals.
pub fn round_places(value: Decimal, places: u32) -> Decimal {
    value.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero)
}

/// Rounds a monetary amount to cents.
pub fn money_round(value: Decimal) -> Decimal {
    round_places(value, MONEY_PLACES)
}

/// Rounds a stock quantity to thousandths.
pub fn stock_round(value: Decimal) -> Decimal {
    round_places(value, STOCK_PLACES)
}

/// `quantity × unit_price`, rounded to cents.
pub fn line_amount(quantity: Decimal, unit_price: Decimal) -> Decimal {
    money_round(quantity * unit_price)
}

/// True when two amounts differ by less than [`MONEY_EPSILON`].
pub fn approx_eq(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() < MONEY_EPSILON
}

/// True when `amount` exceeds `limit` by at least [`MONEY_EPSILON`].
pub fn exceeds(amount: Decimal, limit: Decimal) -> bool {
    amount - limit >= MONEY_EPSILON
}

/// Running weighted-average unit cost after an inbound movement.
///
/// Returns `previous_cost` unchanged when the resulting stock is not positive.
pub fn weighted_average_cost(
    stock_before: Decimal,
    previous_cost: Decimal,
    quantity_in: Decimal,
    unit_price: Decimal,
) -> Decimal {
    let stock_after = stock_before + quantity_in;
    if stock_after <= Decimal::ZERO {
        return previous_cost;
    }
    money_round((stock_before * previous_cost + quantity_in * unit_price) / stock_after)
}

/// Applies the invoice surcharge factor to a pre-tax subtotal.
pub fn apply_invoice_factor(subtotal: Decimal, invoice_required: bool, factor: Decimal) -> Decimal {
    if invoice_required {
        money_round(subtotal * factor)
    } else {
        money_round(subtotal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_decimal_coerces_none_to_zero() {
        assert_eq!(to_decimal::<Decimal>(None), Decimal::ZERO);
        assert_eq!(to_decimal(Some(dec!(4.5))), dec!(4.5));
        assert_eq!(to_decimal(Some(7i32)), dec!(7));
    }

    #[test]
    fn money_round_is_half_up() {
        assert_eq!(money_round(dec!(2.345)), dec!(2.35));
        assert_eq!(money_round(dec!(2.344)), dec!(2.34));
        assert_eq!(money_round(dec!(-2.345)), dec!(-2.35));
        assert_eq!(stock_round(dec!(1.23456)), dec!(1.235));
    }

    #[test]
    fn epsilon_comparisons() {
        assert!(approx_eq(dec!(200.00), dec!(199.995)));
        assert!(!approx_eq(dec!(200.00), dec!(199.99)));
        assert!(exceeds(dec!(200.01), dec!(200.00)));
        assert!(!exceeds(dec!(200.005), dec!(200.00)));
    }

    #[test]
    fn weighted_average_matches_receipt_example() {
        assert_eq!(
            weighted_average_cost(dec!(4), dec!(100), dec!(6), dec!(150)),
            dec!(130)
        );
        assert_eq!(
            weighted_average_cost(dec!(0), dec!(0), dec!(2.5), dec!(80)),
            dec!(80)
        );
    }

    #[test]
    fn invoice_factor_only_when_required() {
        assert_eq!(apply_invoice_factor(dec!(100), true, dec!(1.16)), dec!(116.00));
        assert_eq!(apply_invoice_factor(dec!(100), false, dec!(1.16)), dec!(100));
    }
}
