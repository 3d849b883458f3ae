mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use autoshop_api::{
    entities::{inventory_alert::AlertKind, inventory_movement::MovementKind},
    errors::ServiceError,
    services::inventory::{MovementRequest, NewPart, PartUpdate, INITIAL_STOCK_REFERENCE},
};
use common::TestApp;

#[tokio::test]
async fn initial_stock_is_booked_as_an_entry() {
    let app = TestApp::new().await;
    let part = app.part("BRK-001", dec!(10), dec!(50), dec!(80)).await;

    assert_eq!(part.current_stock, dec!(10));
    let movements = app
        .services
        .inventory
        .movements_for_part(part.id)
        .await
        .unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].kind, MovementKind::Entry);
    assert_eq!(movements[0].reference.as_deref(), Some(INITIAL_STOCK_REFERENCE));
    assert_eq!(movements[0].total_cost, dec!(500.00));
}

#[tokio::test]
async fn entry_updates_weighted_average_cost() {
    let app = TestApp::new().await;
    let part = app.part("FLT-010", dec!(4), dec!(100), dec!(180)).await;

    let outcome = app
        .services
        .inventory
        .record_movement(
            app.admin,
            MovementRequest::new(part.id, MovementKind::Entry, dec!(6)).with_unit_price(dec!(150)),
        )
        .await
        .unwrap();

    assert_eq!(outcome.part.current_stock, dec!(10));
    assert_eq!(outcome.part.purchase_price, dec!(130.00));
    assert_eq!(outcome.movement.stock_before, dec!(4));
    assert_eq!(outcome.movement.stock_after, dec!(10));
}

#[tokio::test]
async fn exit_beyond_stock_is_refused() {
    let app = TestApp::new().await;
    let part = app.part("SPK-002", dec!(2), dec!(30), dec!(45)).await;

    let err = app
        .services
        .inventory
        .record_movement(
            app.admin,
            MovementRequest::new(part.id, MovementKind::Exit, dec!(3)),
        )
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::InsufficientStock(_));
    assert_eq!(app.stock_of(part.id).await, dec!(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_exits_do_not_oversell() {
    let app = TestApp::new().await;
    let part = app.part("RAD-777", dec!(1), dec!(900), dec!(1200)).await;

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let inventory = app.services.inventory.clone();
        let actor = app.admin;
        let part_id = part.id;
        tasks.push(tokio::spawn(async move {
            inventory
                .record_movement(actor, MovementRequest::new(part_id, MovementKind::Exit, dec!(1)))
                .await
        }));
    }

    let mut successes = 0;
    let mut shortages = 0;
    for task in tasks {
        match task.await.expect("task panicked") {
            Ok(_) => successes += 1,
            Err(ServiceError::InsufficientStock(_)) => shortages += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(shortages, 1);
    assert_eq!(app.stock_of(part.id).await, Decimal::ZERO);
}

#[tokio::test]
async fn stock_is_conserved_across_movement_kinds() {
    let app = TestApp::new().await;
    let part = app.part("BLT-300", dec!(5), dec!(20), dec!(35)).await;
    let inventory = &app.services.inventory;

    inventory
        .record_movement(
            app.admin,
            MovementRequest::new(part.id, MovementKind::Entry, dec!(3)).with_unit_price(dec!(22)),
        )
        .await
        .unwrap();
    inventory
        .record_movement(
            app.admin,
            MovementRequest::new(part.id, MovementKind::Exit, dec!(2)),
        )
        .await
        .unwrap();
    inventory
        .record_movement(
            app.admin,
            MovementRequest::new(part.id, MovementKind::Shrinkage, dec!(1)).with_reason("broken"),
        )
        .await
        .unwrap();
    inventory
        .adjust_inventory(app.admin, part.id, dec!(7.5), "physical count")
        .await
        .unwrap();

    let movements = inventory.movements_for_part(part.id).await.unwrap();
    let signed: Decimal = movements
        .iter()
        .map(|m| {
            if m.kind.is_inbound() {
                m.quantity
            } else {
                -m.quantity
            }
        })
        .sum();

    assert_eq!(app.stock_of(part.id).await, dec!(7.5));
    assert_eq!(signed, dec!(7.5));
}

#[tokio::test]
async fn low_stock_alert_opens_and_resolves() {
    let app = TestApp::new().await;
    let inventory = &app.services.inventory;
    let part = inventory
        .create_part(
            app.admin,
            NewPart {
                code: "PAD-100".into(),
                name: "Brake pads".into(),
                purchase_price: dec!(200),
                sale_price: dec!(320),
                initial_stock: dec!(10),
                min_stock: dec!(4),
                max_stock: dec!(20),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(inventory.open_alert_for_part(part.id).await.unwrap().is_none());

    inventory
        .record_movement(
            app.admin,
            MovementRequest::new(part.id, MovementKind::Exit, dec!(6)),
        )
        .await
        .unwrap();
    let alert = inventory.open_alert_for_part(part.id).await.unwrap().unwrap();
    assert_eq!(alert.kind, AlertKind::Low);

    inventory
        .record_movement(
            app.admin,
            MovementRequest::new(part.id, MovementKind::Exit, dec!(4)),
        )
        .await
        .unwrap();
    let alert = inventory.open_alert_for_part(part.id).await.unwrap().unwrap();
    assert_eq!(alert.kind, AlertKind::Out);
    assert_eq!(inventory.open_alerts().await.unwrap().len(), 1);

    inventory
        .record_movement(
            app.admin,
            MovementRequest::new(part.id, MovementKind::Entry, dec!(10)).with_unit_price(dec!(200)),
        )
        .await
        .unwrap();
    assert!(inventory.open_alert_for_part(part.id).await.unwrap().is_none());
}

#[tokio::test]
async fn stale_parts_are_flagged_once() {
    let app = TestApp::new().await;
    let part = app.part("OLD-001", dec!(3), dec!(10), dec!(15)).await;
    let inventory = &app.services.inventory;

    let fresh = inventory.scan_no_movement(Utc::now()).await.unwrap();
    assert!(fresh.is_empty());

    let later = Utc::now() + Duration::days(120);
    let flagged = inventory.scan_no_movement(later).await.unwrap();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].part_id, part.id);
    assert_eq!(flagged[0].kind, AlertKind::NoMovement);

    let again = inventory.scan_no_movement(later).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn duplicate_codes_conflict_until_soft_delete() {
    let app = TestApp::new().await;
    let inventory = &app.services.inventory;
    let part = app.part("DUP-1", dec!(0), dec!(10), dec!(15)).await;

    let dup = NewPart {
        code: "DUP-1".into(),
        name: "Duplicate".into(),
        ..Default::default()
    };
    let err = inventory.create_part(app.admin, dup.clone()).await.unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));

    let deleted = inventory.soft_delete_part(app.admin, part.id).await.unwrap();
    assert_eq!(deleted.code, format!("DUP-1_DEL_{}", part.id));
    assert!(deleted.deleted);

    inventory.create_part(app.admin, dup).await.unwrap();
}

#[tokio::test]
async fn update_part_never_touches_stock() {
    let app = TestApp::new().await;
    let part = app.part("UPD-9", dec!(8), dec!(10), dec!(15)).await;

    let updated = app
        .services
        .inventory
        .update_part(
            app.admin,
            part.id,
            PartUpdate {
                name: Some("Renamed".into()),
                sale_price: Some(dec!(18.5)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.name, "Renamed");
    assert_eq!(updated.sale_price, dec!(18.50));
    assert_eq!(updated.current_stock, dec!(8));
}
