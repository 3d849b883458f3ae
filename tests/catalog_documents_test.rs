mod common;

use assert_matches::assert_matches;
use rust_decimal_macros::dec;

use autoshop_api::{
    entities::payment::PaymentMethod,
    errors::ServiceError,
    services::{
        catalog::{ClientUpdate, NewVehicle},
        documents::{Document, DocumentRenderer, JsonDocumentRenderer},
        inventory::{PartLocation, PartUpdate},
        work_orders::{PartLineInput, ServiceLineInput},
    },
};
use common::{order_input, TestApp};

fn sentra(client_id: i32) -> NewVehicle {
    NewVehicle {
        client_id,
        make: "Nissan".into(),
        model: "Sentra".into(),
        year: Some(2015),
        vin: Some("3n1ab7ap5fy123456".into()),
        plate: Some("abc-123".into()),
    }
}

#[tokio::test]
async fn vehicles_need_an_active_client() {
    let app = TestApp::new().await;
    let catalog = &app.services.catalog;
    let client = app.client("Rosa").await;

    catalog
        .update_client(
            app.admin,
            client.id,
            ClientUpdate {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = catalog.create_vehicle(app.admin, sentra(client.id)).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    catalog
        .update_client(
            app.admin,
            client.id,
            ClientUpdate {
                active: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let vehicle = catalog.create_vehicle(app.admin, sentra(client.id)).await.unwrap();
    assert_eq!(vehicle.vin.as_deref(), Some("3N1AB7AP5FY123456"));
    assert_eq!(vehicle.plate.as_deref(), Some("ABC-123"));

    let soft_deleted = catalog.soft_delete_client(app.admin, client.id).await.unwrap();
    assert!(soft_deleted.deleted);
    assert_matches!(
        catalog.create_vehicle(app.admin, sentra(client.id)).await.unwrap_err(),
        ServiceError::NotFound(_)
    );
}

#[tokio::test]
async fn deleting_a_vehicle_frees_its_vin() {
    let app = TestApp::new().await;
    let catalog = &app.services.catalog;
    let client = app.client("Rosa").await;

    let vehicle = catalog.create_vehicle(app.admin, sentra(client.id)).await.unwrap();
    assert_matches!(
        catalog.create_vehicle(app.admin, sentra(client.id)).await.unwrap_err(),
        ServiceError::Conflict(_)
    );

    let deleted = catalog.soft_delete_vehicle(app.admin, vehicle.id).await.unwrap();
    assert_eq!(
        deleted.vin,
        Some(format!("3N1AB7AP5FY123456_DEL_{}", vehicle.id))
    );
    catalog.create_vehicle(app.admin, sentra(client.id)).await.unwrap();
    assert_eq!(catalog.vehicles_for_client(client.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn documents_carry_order_and_sale_data() {
    let app = TestApp::new().await;
    let tech = app.technician("Luis").await;
    let client = app.client("Rosa").await;
    let vehicle = app
        .services
        .catalog
        .create_vehicle(app.admin, sentra(client.id))
        .await
        .unwrap();
    let part = app.part("PAD-7", dec!(6), dec!(120), dec!(210)).await;
    app.services
        .inventory
        .update_part(
            app.admin,
            part.id,
            PartUpdate {
                location: Some(PartLocation {
                    warehouse: Some("A".into()),
                    shelf: Some("4".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut input = order_input(
        client.id,
        Some(tech.id),
        vec![ServiceLineInput::free_text("Replace front pads", dec!(250))],
        vec![PartLineInput::new(part.id, dec!(2))],
    );
    input.vehicle_id = Some(vehicle.id);
    let order = app.services.work_orders.create(app.admin, input).await.unwrap().order;

    let documents = &app.services.documents;
    let quotation = documents.quotation(order.id).await.unwrap();
    match &quotation {
        Document::Quotation(data) => {
            assert_eq!(data.number, order.number);
            assert_eq!(data.total, dec!(670.00));
            assert_eq!(data.parts[0].unit_price, dec!(210.00));
            assert_eq!(data.party.vehicle.as_deref(), Some("Nissan Sentra 2015"));
            assert!(!data.disclaimers.is_empty());
        }
        other => panic!("unexpected document {}", other.name()),
    }

    let sheet = documents.work_sheet(order.id).await.unwrap();
    match &sheet {
        Document::WorkSheet(data) => {
            assert_eq!(data.technician.as_deref(), Some("Luis"));
            assert_eq!(data.tasks, vec!["Replace front pads".to_string()]);
            assert_eq!(data.parts[0].code, "PAD-7");
            assert_eq!(data.parts[0].location, "A / 4");
        }
        other => panic!("unexpected document {}", other.name()),
    }

    let orders = &app.services.work_orders;
    orders.start(app.admin, order.id).await.unwrap();
    orders.finish(app.admin, order.id).await.unwrap();
    let sale = app
        .services
        .sales
        .create_from_work_order(app.admin, order.id, false)
        .await
        .unwrap();
    app.services.cash_shifts.open_shift(app.admin, dec!(0)).await.unwrap();
    app.services
        .cash_shifts
        .register_payment(app.admin, sale.sale.id, PaymentMethod::Card, dec!(400), None)
        .await
        .unwrap();

    let ticket = documents.ticket(sale.sale.id).await.unwrap();
    match &ticket {
        Document::Ticket(data) => {
            assert_eq!(data.work_order_number.as_deref(), Some(order.number.as_str()));
            assert_eq!(data.client_name.as_deref(), Some("Rosa"));
            assert_eq!(data.paid, dec!(400.00));
            assert_eq!(data.balance, dec!(270.00));
            assert_eq!(data.status, "PENDING");
        }
        other => panic!("unexpected document {}", other.name()),
    }

    let bytes = documents.render(&ticket).unwrap();
    assert_eq!(documents.content_type(), JsonDocumentRenderer.content_type());
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["document"], "ticket");
}
