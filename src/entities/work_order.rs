use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum WorkOrderStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "QUOTED")]
    Quoted,
    #[sea_orm(string_value = "WAITING_AUTH")]
    WaitingAuth,
    #[sea_orm(string_value = "WAITING_PARTS")]
    WaitingParts,
    #[sea_orm(string_value = "IN_PROCESS")]
    InProcess,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
    #[sea_orm(string_value = "DELIVERED")]
    Delivered,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl WorkOrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkOrderStatus::Pending => "PENDING",
            WorkOrderStatus::Quoted => "QUOTED",
            WorkOrderStatus::WaitingAuth => "WAITING_AUTH",
            WorkOrderStatus::WaitingParts => "WAITING_PARTS",
            WorkOrderStatus::InProcess => "IN_PROCESS",
            WorkOrderStatus::Completed => "COMPLETED",
            WorkOrderStatus::Delivered => "DELIVERED",
            WorkOrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for WorkOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum WorkOrderPriority {
    #[sea_orm(string_value = "LOW")]
    Low,
    #[sea_orm(string_value = "NORMAL")]
    Normal,
    #[sea_orm(string_value = "HIGH")]
    High,
    #[sea_orm(string_value = "URGENT")]
    Urgent,
}

/// Repair ticket. Every transition stamps its own who/when columns.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "work_orders")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub number: String,
    pub client_id: i32,
    pub vehicle_id: Option<i32>,
    pub status: WorkOrderStatus,
    pub priority: WorkOrderPriority,
    pub initial_diagnosis: String,
    pub customer_complaint: String,
    pub entry_date: DateTimeUtc,
    pub promise_date: Option<DateTimeUtc>,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub subtotal_services: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub subtotal_parts: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub discount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub total: Decimal,
    pub requires_authorization: bool,
    pub authorized: bool,
    pub customer_provides_parts: bool,
    pub technician_id: Option<i32>,
    pub created_by: i32,
    pub quoted_by: Option<i32>,
    pub quoted_at: Option<DateTimeUtc>,
    pub authorized_by: Option<i32>,
    pub authorized_at: Option<DateTimeUtc>,
    pub started_by: Option<i32>,
    pub started_at: Option<DateTimeUtc>,
    pub finished_by: Option<i32>,
    pub finished_at: Option<DateTimeUtc>,
    pub delivered_by: Option<i32>,
    pub delivered_at: Option<DateTimeUtc>,
    pub cancelled_by: Option<i32>,
    pub cancelled_at: Option<DateTimeUtc>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
