#![allow(dead_code)]

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tempfile::TempDir;

use autoshop_api::{
    config::{AppConfig, BusinessRules},
    db::{self, DbPool},
    entities::{client, employee, part, service_item},
    events::{self, EventSender},
    services::{
        catalog::NewClient,
        inventory::NewPart,
        work_orders::{NewWorkOrder, PartLineInput, ServiceLineInput},
    },
    Actor, AppServices,
};

/// A fresh SQLite file per test with the full schema applied.
pub struct TestApp {
    pub db: Arc<DbPool>,
    pub services: AppServices,
    pub admin: Actor,
    _dir: TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_rules(BusinessRules::default()).await
    }

    pub async fn with_rules(rules: BusinessRules) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("autoshop_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", path.display()),
            "test".to_string(),
        );
        // One connection serializes writers the way row locks do on PostgreSQL.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::check_connection(&pool).await.expect("database answers");
        db::run_migrations(&pool).await.expect("migrations");

        let (sender, rx) = EventSender::channel(256);
        let event_task = tokio::spawn(events::process_events(rx, Vec::new()));

        let db = Arc::new(pool);
        let services = AppServices::new(db.clone(), Arc::new(sender), rules);
        let admin_row = services
            .catalog
            .create_employee(Actor::new(0), "Front Desk", false)
            .await
            .expect("admin employee");

        Self {
            db,
            services,
            admin: Actor::new(admin_row.id),
            _dir: dir,
            _event_task: event_task,
        }
    }

    pub async fn technician(&self, name: &str) -> employee::Model {
        self.services
            .catalog
            .create_employee(self.admin, name, true)
            .await
            .expect("technician")
    }

    pub async fn client(&self, name: &str) -> client::Model {
        self.services
            .catalog
            .create_client(
                self.admin,
                NewClient {
                    name: name.to_string(),
                    ..Default::default()
                },
            )
            .await
            .expect("client")
    }

    pub async fn part(
        &self,
        code: &str,
        stock: Decimal,
        purchase_price: Decimal,
        sale_price: Decimal,
    ) -> part::Model {
        self.services
            .inventory
            .create_part(
                self.admin,
                NewPart {
                    code: code.to_string(),
                    name: format!("Part {}", code),
                    purchase_price,
                    sale_price,
                    initial_stock: stock,
                    ..Default::default()
                },
            )
            .await
            .expect("part")
    }

    pub async fn service_item(&self, name: &str, price: Decimal) -> service_item::Model {
        self.services
            .catalog
            .create_service_item(self.admin, name, None, price)
            .await
            .expect("service item")
    }

    pub async fn stock_of(&self, part_id: i32) -> Decimal {
        self.services
            .inventory
            .get_part(part_id)
            .await
            .expect("part")
            .current_stock
    }
}

pub fn order_input(
    client_id: i32,
    technician_id: Option<i32>,
    services: Vec<ServiceLineInput>,
    parts: Vec<PartLineInput>,
) -> NewWorkOrder {
    NewWorkOrder {
        client_id,
        vehicle_id: None,
        priority: None,
        initial_diagnosis: "Noise when braking".to_string(),
        customer_complaint: "Brakes squeal".to_string(),
        entry_date: Some(Utc::now()),
        promise_date: None,
        discount: Decimal::ZERO,
        requires_authorization: false,
        customer_provides_parts: false,
        technician_id,
        services,
        parts,
    }
}

pub fn long_ago() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid date")
}
