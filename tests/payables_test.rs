mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal_macros::dec;

use autoshop_api::{
    config::BusinessRules,
    entities::{
        payment::PaymentMethod, purchase_order, purchase_order::PurchaseOrderStatus,
        purchase_order_line, supplier,
    },
    errors::ServiceError,
    events::EventSender,
    services::{
        catalog::NewSupplier,
        sales::{NewSale, SaleLineInput},
        documents::JsonDocumentRenderer,
        payables::{
            AgingBucket, NewManualPayable, NewPurchaseOrder, PurchaseOrderLineInput, ReceiptLine,
            SupplierNotifier,
        },
    },
    AppServices,
};
use common::TestApp;

async fn supplier(app: &TestApp) -> supplier::Model {
    app.services
        .catalog
        .create_supplier(
            app.admin,
            NewSupplier {
                name: "Refacciones del Norte".into(),
                email: Some("orders@refacciones.example".into()),
                phone: None,
            },
        )
        .await
        .unwrap()
}

fn line(part_id: Option<i32>, description: Option<&str>, quantity: rust_decimal::Decimal, price: rust_decimal::Decimal) -> PurchaseOrderLineInput {
    PurchaseOrderLineInput {
        part_id,
        description: description.map(str::to_string),
        quantity,
        estimated_unit_price: Some(price),
    }
}

#[tokio::test]
async fn partial_receipt_updates_weighted_average_cost() {
    let app = TestApp::new().await;
    let supplier = supplier(&app).await;
    let part = app.part("Q-1", dec!(4), dec!(100), dec!(160)).await;
    let payables = &app.services.payables;

    let created = payables
        .create_purchase_order(
            app.admin,
            NewPurchaseOrder {
                supplier_id: supplier.id,
                lines: vec![line(Some(part.id), None, dec!(10), dec!(100))],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(created.order.status, PurchaseOrderStatus::Draft);
    let today = Utc::now().format("%Y%m%d").to_string();
    assert_eq!(created.order.number, format!("OC-{}-0001", today));

    let sent = payables
        .send_purchase_order(app.admin, created.order.id)
        .await
        .unwrap();
    assert_eq!(sent.order.status, PurchaseOrderStatus::Sent);
    assert!(sent.notification_error.is_none());

    let received = payables
        .receive_purchase_order(
            app.admin,
            created.order.id,
            vec![ReceiptLine {
                line_id: created.lines[0].id,
                quantity_received: dec!(6),
                real_unit_price: Some(dec!(150)),
            }],
            None,
        )
        .await
        .unwrap();

    assert_eq!(received.order.status, PurchaseOrderStatus::PartialReceipt);
    assert_eq!(received.owed, dec!(900.00));
    let part = app.services.inventory.get_part(part.id).await.unwrap();
    assert_eq!(part.current_stock, dec!(10));
    assert_eq!(part.purchase_price, dec!(130.00));

    let err = payables
        .cancel_purchase_order(app.admin, created.order.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::IllegalTransition(_));

    let err = payables
        .receive_purchase_order(
            app.admin,
            created.order.id,
            vec![ReceiptLine {
                line_id: created.lines[0].id,
                quantity_received: dec!(5),
                real_unit_price: None,
            }],
            None,
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let done = payables
        .receive_purchase_order(
            app.admin,
            created.order.id,
            vec![ReceiptLine {
                line_id: created.lines[0].id,
                quantity_received: dec!(4),
                real_unit_price: None,
            }],
            Some("https://files.example/invoice-77.pdf".into()),
        )
        .await
        .unwrap();
    assert_eq!(done.order.status, PurchaseOrderStatus::Received);
    assert_eq!(done.owed, dec!(1500.00));
}

#[tokio::test]
async fn receiving_a_placeholder_line_creates_the_part() {
    let app = TestApp::new().await;
    let supplier = supplier(&app).await;
    let payables = &app.services.payables;

    let created = payables
        .create_purchase_order(
            app.admin,
            NewPurchaseOrder {
                supplier_id: supplier.id,
                lines: vec![line(None, Some("Water pump, 2015 Sentra"), dec!(2), dec!(750))],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    payables
        .authorize_purchase_order(app.admin, created.order.id)
        .await
        .unwrap();

    let received = payables
        .receive_purchase_order(
            app.admin,
            created.order.id,
            vec![ReceiptLine {
                line_id: created.lines[0].id,
                quantity_received: dec!(2),
                real_unit_price: None,
            }],
            None,
        )
        .await
        .unwrap();

    let part_id = received.lines[0].part_id.expect("placeholder part");
    let part = app.services.inventory.get_part(part_id).await.unwrap();
    assert!(part.code.starts_with("PDTE EDITAR"));
    assert_eq!(part.current_stock, dec!(2));
    assert_eq!(part.purchase_price, dec!(750.00));
}

#[tokio::test]
async fn payments_reduce_the_balance_and_cannot_exceed_it() {
    let app = TestApp::new().await;
    let supplier = supplier(&app).await;
    let part = app.part("Q-2", dec!(0), dec!(50), dec!(90)).await;
    let payables = &app.services.payables;

    let created = payables
        .create_purchase_order(
            app.admin,
            NewPurchaseOrder {
                supplier_id: supplier.id,
                lines: vec![line(Some(part.id), None, dec!(4), dec!(50))],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    payables.send_purchase_order(app.admin, created.order.id).await.unwrap();
    payables
        .receive_purchase_order(
            app.admin,
            created.order.id,
            vec![ReceiptLine {
                line_id: created.lines[0].id,
                quantity_received: dec!(4),
                real_unit_price: None,
            }],
            None,
        )
        .await
        .unwrap();

    payables
        .register_purchase_order_payment(app.admin, created.order.id, PaymentMethod::Transfer, dec!(150), None)
        .await
        .unwrap();
    let err = payables
        .register_purchase_order_payment(app.admin, created.order.id, PaymentMethod::Transfer, dec!(60), None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let detail = payables.get_purchase_order(created.order.id).await.unwrap();
    assert_eq!(detail.owed, dec!(200.00));
    assert_eq!(detail.paid, dec!(150.00));
    assert_eq!(detail.balance, dec!(50.00));
}

#[tokio::test]
async fn aging_report_buckets_open_balances() {
    let app = TestApp::new().await;
    let supplier = supplier(&app).await;
    let payables = &app.services.payables;
    let today = Utc::now().date_naive();

    for (concept, days_ago, amount) in [
        ("Rent", 10, dec!(5000)),
        ("Tooling", 45, dec!(1200)),
        ("Old invoice", 90, dec!(300)),
    ] {
        payables
            .create_manual_payable(
                app.admin,
                NewManualPayable {
                    supplier_id: Some(supplier.id),
                    concept: concept.into(),
                    amount,
                    reference_date: today - Duration::days(days_ago),
                    due_date: None,
                },
            )
            .await
            .unwrap();
    }
    let settled = payables
        .create_manual_payable(
            app.admin,
            NewManualPayable {
                supplier_id: None,
                concept: "Cleaning".into(),
                amount: dec!(400),
                reference_date: today - Duration::days(70),
                due_date: None,
            },
        )
        .await
        .unwrap();
    payables
        .register_manual_payment(app.admin, settled.id, PaymentMethod::Card, dec!(400), None)
        .await
        .unwrap();

    let report = payables.aging_report(today).await.unwrap();
    assert_eq!(report.entries.len(), 3);
    assert_eq!(report.current, dec!(5000));
    assert_eq!(report.days_31_to_60, dec!(1200));
    assert_eq!(report.over_60, dec!(300));
    assert_eq!(report.total(), dec!(6500));
    assert!(report
        .entries
        .iter()
        .any(|e| e.bucket == AgingBucket::Over60 && e.description.contains("Old invoice")));
}

struct UnreachableMailServer;

#[async_trait]
impl SupplierNotifier for UnreachableMailServer {
    async fn purchase_order_sent(
        &self,
        _order: &purchase_order::Model,
        _lines: &[purchase_order_line::Model],
    ) -> Result<(), ServiceError> {
        Err(ServiceError::ExternalServiceError("SMTP connection refused".into()))
    }
}

#[tokio::test]
async fn notifier_failure_is_reported_without_undoing_the_send() {
    let app = TestApp::new().await;
    let supplier = supplier(&app).await;
    let part = app.part("Q-3", dec!(0), dec!(20), dec!(35)).await;

    let (sender, _rx) = EventSender::channel(64);
    let services = AppServices::with_ports(
        app.db.clone(),
        Arc::new(sender),
        BusinessRules::default(),
        Arc::new(UnreachableMailServer),
        Arc::new(JsonDocumentRenderer),
    );

    let created = services
        .payables
        .create_purchase_order(
            app.admin,
            NewPurchaseOrder {
                supplier_id: supplier.id,
                lines: vec![line(Some(part.id), None, dec!(1), dec!(20))],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let outcome = services
        .payables
        .send_purchase_order(app.admin, created.order.id)
        .await
        .unwrap();

    assert_eq!(outcome.order.status, PurchaseOrderStatus::Sent);
    assert!(outcome
        .notification_error
        .as_deref()
        .is_some_and(|e| e.contains("SMTP")));
    let stored = services.payables.get_purchase_order(created.order.id).await.unwrap();
    assert_eq!(stored.order.status, PurchaseOrderStatus::Sent);
}

#[tokio::test]
async fn cash_paid_to_suppliers_leaves_the_drawer() {
    let app = TestApp::new().await;
    let item = app.service_item("Tyre rotation", dec!(150)).await;
    let shifts = &app.services.cash_shifts;
    let payables = &app.services.payables;

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
    let payable = payables
        .create_manual_payable(
            app.admin,
            NewManualPayable {
                supplier_id: None,
                concept: "Courier".into(),
                amount: dec!(70),
                reference_date: Utc::now().date_naive(),
                due_date: None,
            },
        )
        .await
        .unwrap();

    let shift = shifts.open_shift(app.admin, dec!(200)).await.unwrap();
    shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Cash, dec!(100), None)
        .await
        .unwrap();
    shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Card, dec!(50), None)
        .await
        .unwrap();
    let paid_out = payables
        .register_manual_payment(app.admin, payable.id, PaymentMethod::Cash, dec!(70), None)
        .await
        .unwrap();
    assert_eq!(paid_out.shift_id, Some(shift.id));

    let closing = shifts.close_shift(app.admin, dec!(230)).await.unwrap();
    assert_eq!(closing.shift.expected_amount, Some(dec!(230.00)));
    assert_eq!(closing.shift.difference, Some(dec!(0.00)));
    assert!(closing.alert.is_none());
}
