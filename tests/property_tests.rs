//! Property-based tests for the money kernel and the pure engine rules.
//!
//! These use proptest to check invariants over generated prices, quantities
//! and states rather than a handful of fixed examples.

use autoshop_api::{
    entities::{inventory_alert::AlertKind, work_order::WorkOrderStatus},
    money::{apply_invoice_factor, approx_eq, exceeds, money_round, weighted_average_cost},
    services::{
        inventory::classify_stock,
        numbering::{daily_prefix, format_number, next_sequence, WORK_ORDER_PREFIX},
        payables::{bucket_for, AgingBucket},
        sales::is_settled,
        work_orders::state::{ensure, Action},
    },
};
use chrono::NaiveDate;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// Strategies for generating test data
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..10_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn quantity_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000).prop_map(|thousandths| Decimal::new(thousandths, 3))
}

fn stock_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..1_000_000).prop_map(|thousandths| Decimal::new(thousandths, 3))
}

fn status_strategy() -> impl Strategy<Value = WorkOrderStatus> {
    prop_oneof![
        Just(WorkOrderStatus::Pending),
        Just(WorkOrderStatus::Quoted),
        Just(WorkOrderStatus::WaitingAuth),
        Just(WorkOrderStatus::WaitingParts),
        Just(WorkOrderStatus::InProcess),
        Just(WorkOrderStatus::Completed),
        Just(WorkOrderStatus::Delivered),
        Just(WorkOrderStatus::Cancelled),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn weighted_average_stays_between_old_and_new_cost(
        stock in stock_strategy(),
        cost in price_strategy(),
        quantity in quantity_strategy(),
        price in price_strategy(),
    ) {
        let updated = weighted_average_cost(stock, cost, quantity, price);
        let low = cost.min(price);
        let high = cost.max(price);
        // Rounding to cents may step at most half a cent outside the exact mean.
        prop_assert!(updated >= low - dec!(0.005), "{} < {}", updated, low);
        prop_assert!(updated <= high + dec!(0.005), "{} > {}", updated, high);
        prop_assert_eq!(updated, money_round(updated));
    }

    #[test]
    fn entry_into_empty_stock_takes_the_entry_price(
        cost in price_strategy(),
        quantity in quantity_strategy(),
        price in price_strategy(),
    ) {
        prop_assert_eq!(weighted_average_cost(Decimal::ZERO, cost, quantity, price), price);
    }

    #[test]
    fn money_round_is_idempotent(cents in -100_000_000i64..100_000_000, extra in 0i64..1000) {
        let value = Decimal::new(cents * 1000 + extra, 5);
        let once = money_round(value);
        prop_assert_eq!(money_round(once), once);
        prop_assert!((once - value).abs() <= dec!(0.005));
    }

    #[test]
    fn exceeds_and_approx_eq_are_exclusive(a in price_strategy(), b in price_strategy()) {
        if approx_eq(a, b) {
            prop_assert!(!exceeds(a, b));
            prop_assert!(!exceeds(b, a));
        } else {
            prop_assert!(exceeds(a, b) ^ exceeds(b, a));
        }
    }

    #[test]
    fn invoice_factor_round_trip(subtotal in price_strategy()) {
        let factor = dec!(1.16);
        let total = apply_invoice_factor(subtotal, true, factor);
        let back = money_round(total / factor);
        prop_assert!((back - subtotal).abs() <= dec!(0.01), "{} vs {}", back, subtotal);
        prop_assert_eq!(apply_invoice_factor(subtotal, false, factor), subtotal);
    }

    #[test]
    fn settled_means_paid_within_a_cent(total in price_strategy(), paid in price_strategy()) {
        prop_assert_eq!(is_settled(total, paid), total - paid < dec!(0.01));
        prop_assert!(is_settled(Decimal::ZERO, paid));
    }

    #[test]
    fn out_of_stock_always_wins(min in stock_strategy(), max in stock_strategy()) {
        prop_assert_eq!(classify_stock(Decimal::ZERO, min, max, dec!(1.2)), Some(AlertKind::Out));
    }

    #[test]
    fn stock_between_thresholds_raises_nothing(
        min in (1i64..1000).prop_map(Decimal::from),
        headroom in (1i64..1000).prop_map(Decimal::from),
    ) {
        let max = min * dec!(2) + headroom;
        let stock = min * dec!(1.2) + dec!(0.001);
        prop_assume!(stock <= max);
        prop_assert_eq!(classify_stock(stock, min, max, dec!(1.2)), None);
    }

    #[test]
    fn terminal_states_accept_no_lifecycle_action(status in status_strategy()) {
        let terminal = matches!(status, WorkOrderStatus::Delivered | WorkOrderStatus::Cancelled);
        if terminal {
            for action in [Action::Start, Action::Finish, Action::Cancel, Action::EditLines, Action::Deliver] {
                prop_assert!(ensure(status, action).is_err());
            }
        }
    }

    #[test]
    fn daily_sequence_is_contiguous(count in 1u32..50) {
        let day = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let prefix = daily_prefix(WORK_ORDER_PREFIX, day);
        let mut current = 0;
        let mut issued = Vec::new();
        for expected in 1..=count {
            current = next_sequence(current, &prefix).unwrap();
            prop_assert_eq!(current, expected);
            issued.push(format_number(&prefix, current));
        }
        prop_assert_eq!(issued.last().cloned(), Some(format!("OT-20240315-{:04}", count)));
        issued.dedup();
        prop_assert_eq!(issued.len() as u32, count);
    }

    #[test]
    fn aging_buckets_partition_days(days in 0i64..400) {
        let bucket = bucket_for(days);
        let expected = if days <= 30 {
            AgingBucket::Current
        } else if days <= 60 {
            AgingBucket::Days31To60
        } else {
            AgingBucket::Over60
        };
        prop_assert_eq!(bucket, expected);
    }
}
