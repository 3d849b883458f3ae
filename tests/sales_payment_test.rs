mod common;

use assert_matches::assert_matches;
use chrono::{Duration, NaiveDate};
use rust_decimal_macros::dec;

use autoshop_api::{
    entities::{
        cash_alert::AlertLevel, commission_config::CommissionBasis, inventory_movement::MovementKind,
        payment::PaymentMethod, sale::SaleStatus,
    },
    errors::ServiceError,
    services::{
        commissions::CommissionRate,
        sales::{CancelSale, LineDisposition, NewSale, SaleLineInput, SaleUpdate},
        work_orders::ServiceLineInput,
    },
};
use common::{long_ago, order_input, TestApp};

#[tokio::test]
async fn cancelling_a_paid_sale_splits_reusable_and_shrinkage() {
    let app = TestApp::new().await;
    let part = app.part("P-80", dec!(10), dec!(45), dec!(80)).await;
    let sales = &app.services.sales;

    app.services
        .commissions
        .set_commission_rate(
            app.admin,
            CommissionRate {
                employee_id: app.admin.id,
                basis: CommissionBasis::ProductsSale,
                percentage: dec!(3),
                valid_from: long_ago(),
            },
        )
        .await
        .unwrap();

    let sale = sales
        .create_manual_sale(
            app.admin,
            NewSale {
                lines: vec![SaleLineInput::product(part.id, dec!(2))],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(sale.sale.total, dec!(160.00));
    assert_eq!(app.stock_of(part.id).await, dec!(8));

    app.services
        .cash_shifts
        .open_shift(app.admin, dec!(0))
        .await
        .unwrap();
    let paid = app
        .services
        .cash_shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Transfer, dec!(160), None)
        .await
        .unwrap();
    assert_eq!(paid.sale.status, SaleStatus::Paid);
    assert_eq!(paid.commissions.len(), 1);
    assert_eq!(paid.commissions[0].amount, dec!(4.80));

    let line_id = sale.lines[0].id;
    let cancelled = sales
        .cancel_sale(
            app.admin,
            sale.sale.id,
            CancelSale {
                reason: "Customer returned the parts".into(),
                dispositions: vec![LineDisposition {
                    sale_line_id: line_id,
                    quantity_reusable: dec!(1),
                    quantity_shrinkage: dec!(1),
                    shrinkage_reason: Some("damaged".into()),
                }],
            },
        )
        .await
        .unwrap();

    assert_eq!(cancelled.sale.status, SaleStatus::Cancelled);
    assert_eq!(cancelled.details.len(), 1);
    let detail = &cancelled.details[0];
    assert_eq!(detail.quantity_reusable + detail.quantity_shrinkage, dec!(2));
    assert_eq!(detail.shrinkage_cost, dec!(45.00));
    assert_eq!(app.stock_of(part.id).await, dec!(9));

    let reference = format!("CANCEL-SALE-{}", sale.sale.id);
    let returns: Vec<_> = app
        .services
        .inventory
        .movements_for_part(part.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.kind == MovementKind::Entry && m.reference.as_deref() == Some(reference.as_str()))
        .collect();
    assert_eq!(returns.len(), 1);
    assert_eq!(returns[0].quantity, dec!(1));

    assert!(app
        .services
        .commissions
        .accrued_for_sale(sale.sale.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn dispositions_must_cover_the_whole_line() {
    let app = TestApp::new().await;
    let part = app.part("P-81", dec!(5), dec!(10), dec!(20)).await;
    let sales = &app.services.sales;

    let sale = sales
        .create_manual_sale(
            app.admin,
            NewSale {
                lines: vec![SaleLineInput::product(part.id, dec!(3))],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = sales
        .cancel_sale(
            app.admin,
            sale.sale.id,
            CancelSale {
                reason: "Wrong part".into(),
                dispositions: vec![LineDisposition {
                    sale_line_id: sale.lines[0].id,
                    quantity_reusable: dec!(1),
                    quantity_shrinkage: dec!(1),
                    shrinkage_reason: Some("lost".into()),
                }],
            },
        )
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::ValidationError(_));
    assert_eq!(
        sales.get_sale(sale.sale.id).await.unwrap().sale.status,
        SaleStatus::Pending
    );
    assert_eq!(app.stock_of(part.id).await, dec!(2));
}

#[tokio::test]
async fn payments_need_an_open_shift_and_cannot_overpay() {
    let app = TestApp::new().await;
    let item = app.service_item("Alignment", dec!(350)).await;
    let shifts = &app.services.cash_shifts;

    let sale = app
        .services
        .sales
        .create_manual_sale(
            app.admin,
            NewSale {
                lines: vec![SaleLineInput::service(item.id, dec!(1))],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Cash, dec!(100), None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    shifts.open_shift(app.admin, dec!(500)).await.unwrap();
    assert_matches!(
        shifts.open_shift(app.admin, dec!(500)).await.unwrap_err(),
        ServiceError::Conflict(_)
    );

    let partial = shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Cash, dec!(100), None)
        .await
        .unwrap();
    assert_eq!(partial.sale.status, SaleStatus::Pending);
    assert_eq!(partial.balance, dec!(250.00));

    let err = shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Cash, dec!(300), None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let settled = shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Card, dec!(250), None)
        .await
        .unwrap();
    assert_eq!(settled.sale.status, SaleStatus::Paid);
    assert_eq!(shifts.payments_for_sale(sale.sale.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn closing_a_shift_flags_cash_differences() {
    let app = TestApp::new().await;
    let item = app.service_item("Oil change", dec!(400)).await;
    let shifts = &app.services.cash_shifts;

    let sale = app
        .services
        .sales
        .create_manual_sale(
            app.admin,
            NewSale {
                lines: vec![SaleLineInput::service(item.id, dec!(1))],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    shifts.open_shift(app.admin, dec!(100)).await.unwrap();
    shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Cash, dec!(400), None)
        .await
        .unwrap();

    let closing = shifts.close_shift(app.admin, dec!(420)).await.unwrap();
    assert_eq!(closing.shift.expected_amount, Some(dec!(500.00)));
    assert_eq!(closing.shift.difference, Some(dec!(-80.00)));
    let alert = closing.alert.expect("difference alert");
    assert_eq!(alert.level, AlertLevel::Critical);

    assert!(shifts.current_shift(app.admin.id).await.unwrap().is_none());
}

#[tokio::test]
async fn flipping_the_invoice_flag_reprices_the_sale() {
    let app = TestApp::new().await;
    let item = app.service_item("Diagnosis", dec!(100)).await;
    let sales = &app.services.sales;

    let sale = sales
        .create_manual_sale(
            app.admin,
            NewSale {
                invoice_required: true,
                lines: vec![SaleLineInput::service(item.id, dec!(1))],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(sale.sale.subtotal, dec!(100.00));
    assert_eq!(sale.sale.total, dec!(116.00));

    let updated = sales
        .update_sale(
            app.admin,
            sale.sale.id,
            SaleUpdate {
                invoice_required: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.sale.total, dec!(100.00));

    let restored = sales
        .update_sale(
            app.admin,
            sale.sale.id,
            SaleUpdate {
                invoice_required: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(restored.sale.subtotal, dec!(100.00));
    assert_eq!(restored.sale.total, sale.sale.total);
}

#[tokio::test]
async fn editing_manual_lines_moves_stock_both_ways() {
    let app = TestApp::new().await;
    let part = app.part("P-82", dec!(10), dec!(10), dec!(25)).await;
    let sales = &app.services.sales;

    let sale = sales
        .create_manual_sale(
            app.admin,
            NewSale {
                lines: vec![SaleLineInput::product(part.id, dec!(4))],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(app.stock_of(part.id).await, dec!(6));

    let updated = sales
        .update_sale(
            app.admin,
            sale.sale.id,
            SaleUpdate {
                lines: Some(vec![SaleLineInput::product(part.id, dec!(1)).at_price(dec!(30))]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.sale.total, dec!(30.00));
    assert_eq!(updated.lines.len(), 1);
    assert_eq!(app.stock_of(part.id).await, dec!(9));
}

async fn finished_order(app: &TestApp, labour: rust_decimal::Decimal) -> i32 {
    let client = app.client("Rosa").await;
    let tech = app.technician("Luis").await;
    let orders = &app.services.work_orders;
    let order = orders
        .create(
            app.admin,
            order_input(client.id, Some(tech.id), vec![ServiceLineInput::free_text("Labour", labour)], vec![]),
        )
        .await
        .unwrap()
        .order;
    orders.start(app.admin, order.id).await.unwrap();
    orders.finish(app.admin, order.id).await.unwrap();
    order.id
}

#[tokio::test]
async fn linking_and_unlinking_a_work_order_moves_its_lines() {
    let app = TestApp::new().await;
    let item = app.service_item("Car wash", dec!(80)).await;
    let sales = &app.services.sales;
    let order_id = finished_order(&app, dec!(120)).await;

    let sale = sales
        .create_manual_sale(
            app.admin,
            NewSale {
                lines: vec![SaleLineInput::service(item.id, dec!(1))],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let linked = sales.link_work_order(app.admin, sale.sale.id, order_id).await.unwrap();
    assert_eq!(linked.sale.work_order_id, Some(order_id));
    assert_eq!(linked.sale.total, dec!(200.00));
    assert_eq!(linked.lines.len(), 2);
    assert!(linked.sale.client_id.is_some());
    assert_matches!(
        sales.link_work_order(app.admin, sale.sale.id, order_id).await.unwrap_err(),
        ServiceError::IllegalTransition(_)
    );
    assert_matches!(
        sales.create_from_work_order(app.admin, order_id, false).await.unwrap_err(),
        ServiceError::IllegalTransition(_)
    );

    let unlinked = sales.unlink_work_order(app.admin, sale.sale.id).await.unwrap();
    assert_eq!(unlinked.sale.work_order_id, None);
    assert_eq!(unlinked.sale.total, dec!(80.00));
    assert_eq!(unlinked.lines.len(), 1);
    assert!(unlinked.lines[0].origin_order_id.is_none());
    assert_matches!(
        sales.unlink_work_order(app.admin, sale.sale.id).await.unwrap_err(),
        ServiceError::IllegalTransition(_)
    );

    let invoiced = sales.create_from_work_order(app.admin, order_id, false).await.unwrap();
    assert_eq!(invoiced.sale.total, dec!(120.00));
}

#[tokio::test]
async fn unlink_refuses_to_leave_less_than_was_paid() {
    let app = TestApp::new().await;
    let item = app.service_item("Car wash", dec!(80)).await;
    let sales = &app.services.sales;
    let order_id = finished_order(&app, dec!(120)).await;

    let sale = sales
        .create_manual_sale(
            app.admin,
            NewSale {
                lines: vec![SaleLineInput::service(item.id, dec!(1))],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    sales.link_work_order(app.admin, sale.sale.id, order_id).await.unwrap();

    app.services.cash_shifts.open_shift(app.admin, dec!(0)).await.unwrap();
    app.services
        .cash_shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Card, dec!(150), None)
        .await
        .unwrap();

    let err = sales.unlink_work_order(app.admin, sale.sale.id).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let unchanged = sales.get_sale(sale.sale.id).await.unwrap();
    assert_eq!(unchanged.sale.work_order_id, Some(order_id));
    assert_eq!(unchanged.sale.total, dec!(200.00));
    assert_eq!(unchanged.lines.len(), 2);
    assert_eq!(unchanged.balance, dec!(50.00));
}

#[tokio::test]
async fn raising_a_paid_sale_withdraws_its_commissions() {
    let app = TestApp::new().await;
    let item = app.service_item("Brake bleed", dec!(100)).await;
    let sales = &app.services.sales;
    let shifts = &app.services.cash_shifts;

    app.services
        .commissions
        .set_commission_rate(
            app.admin,
            CommissionRate {
                employee_id: app.admin.id,
                basis: CommissionBasis::ServicesSale,
                percentage: dec!(10),
                valid_from: long_ago(),
            },
        )
        .await
        .unwrap();

    let sale = sales
        .create_manual_sale(
            app.admin,
            NewSale {
                lines: vec![SaleLineInput::service(item.id, dec!(1))],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    shifts.open_shift(app.admin, dec!(0)).await.unwrap();
    let paid = shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Cash, dec!(100), None)
        .await
        .unwrap();
    assert_eq!(paid.sale.status, SaleStatus::Paid);
    assert_eq!(paid.commissions.len(), 1);

    let raised = sales
        .update_sale(
            app.admin,
            sale.sale.id,
            SaleUpdate {
                lines: Some(vec![SaleLineInput::service(item.id, dec!(2))]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(raised.sale.status, SaleStatus::Pending);
    assert_eq!(raised.balance, dec!(100.00));
    assert!(app
        .services
        .commissions
        .accrued_for_sale(sale.sale.id)
        .await
        .unwrap()
        .is_empty());

    let settled = shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Cash, dec!(100), None)
        .await
        .unwrap();
    assert_eq!(settled.sale.status, SaleStatus::Paid);
    assert_eq!(settled.commissions.len(), 1);
    assert_eq!(settled.commissions[0].amount, dec!(20.00));
}

#[tokio::test]
async fn a_new_commission_rate_closes_the_previous_one() {
    let app = TestApp::new().await;
    let tech = app.technician("Luis").await;
    let commissions = &app.services.commissions;
    let january = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let june = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    let rate = |percentage, valid_from| CommissionRate {
        employee_id: tech.id,
        basis: CommissionBasis::Labor,
        percentage,
        valid_from,
    };

    commissions.set_commission_rate(app.admin, rate(dec!(5), january)).await.unwrap();
    commissions.set_commission_rate(app.admin, rate(dec!(8), june)).await.unwrap();

    let history = commissions.rate_history(tech.id, CommissionBasis::Labor).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].percentage, dec!(5));
    assert_eq!(history[0].valid_to, Some(june));
    assert_eq!(history[1].percentage, dec!(8));
    assert_eq!(history[1].valid_to, None);

    for valid_from in [june, january] {
        assert_matches!(
            commissions
                .set_commission_rate(app.admin, rate(dec!(9), valid_from))
                .await
                .unwrap_err(),
            ServiceError::Conflict(_)
        );
    }
    assert_eq!(
        commissions.rate_history(tech.id, CommissionBasis::Labor).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn long_shift_alert_escalates_in_place() {
    let app = TestApp::new().await;
    let shifts = &app.services.cash_shifts;
    let shift = shifts.open_shift(app.admin, dec!(100)).await.unwrap();
    let opened = shift.opened_at;

    assert!(shifts.inspect_open_shifts(opened + Duration::hours(2)).await.unwrap().is_empty());

    let warned = shifts.inspect_open_shifts(opened + Duration::hours(13)).await.unwrap();
    assert_eq!(warned.len(), 1);
    assert_eq!(warned[0].level, AlertLevel::Warning);
    assert!(shifts.inspect_open_shifts(opened + Duration::hours(14)).await.unwrap().is_empty());

    let escalated = shifts.inspect_open_shifts(opened + Duration::hours(25)).await.unwrap();
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].id, warned[0].id);
    assert_eq!(escalated[0].level, AlertLevel::Critical);

    shifts.close_shift(app.admin, dec!(100)).await.unwrap();
    let alerts = shifts.alerts_for_shift(shift.id).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].resolved_at.is_some());
}
